//! Script execution and result decoding.

use std::sync::Arc;

use hvremote_core::{
    ExecutionResult, OutputLog, RenderError, Script, Shell, ShellError,
    powershell::file_command,
};
use hvremote_session::PoolError;
use hvremote_transport::{UploadError, Uploader};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ExecutorConfig,
    elevation::{ElevatedRunner, ElevationError},
};

/// UTF-8 byte order mark; Windows PowerShell reads BOM-less scripts as ANSI.
const UTF8_BOM: &str = "\u{feff}";

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Script render failed: {0}")]
    Render(#[from] RenderError),
    #[error("Session unavailable: {0}")]
    Pool(#[from] PoolError),
    #[error("Transport error: {0}")]
    Shell(#[from] ShellError),
    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("Elevated run failed: {0}")]
    Elevation(#[from] ElevationError),
    #[error("Script failed with exit code {}: {}", .0.exit_code, .0.stderr.trim())]
    Execution(ExecutionResult),
    #[error("Script output is not a JSON document: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        result: ExecutionResult,
    },
    #[error("{primary} (cleanup also failed: {secondary})")]
    WithSecondary {
        primary: Box<ExecError>,
        secondary: Box<ExecError>,
    },
}

impl ExecError {
    /// Whether the session that produced this error should be discarded.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Shell(_) => true,
            Self::Upload(e) => e.is_transport(),
            Self::Elevation(e) => e.is_transport(),
            Self::WithSecondary { primary, secondary } => {
                primary.is_transport() || secondary.is_transport()
            }
            _ => false,
        }
    }

    /// The remote result attached to this error, if any.
    #[must_use]
    pub const fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Execution(result) | Self::Decode { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Merge an outcome with the outcome of its cleanup, primary first.
    ///
    /// # Errors
    /// Returns the primary error, the cleanup error, or both.
    pub fn combine<T>(primary: Result<T, Self>, cleanup: Result<(), Self>) -> Result<T, Self> {
        match (primary, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(secondary)) => Err(secondary),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(secondary)) => {
                tracing::warn!(%secondary, "cleanup failed after an earlier error");
                Err(Self::WithSecondary {
                    primary: Box::new(primary),
                    secondary: Box::new(secondary),
                })
            }
        }
    }
}

/// Fail unless the command exited zero with an empty stderr.
///
/// # Errors
/// Returns `ExecError::Execution` carrying the full result.
pub fn check(result: ExecutionResult) -> Result<ExecutionResult, ExecError> {
    if result.is_success() {
        Ok(result)
    } else {
        Err(ExecError::Execution(result))
    }
}

/// Decode trimmed stdout as exactly one JSON document.
///
/// # Errors
/// Returns `ExecError::Decode` carrying the serde error and the full result.
pub fn decode_result<T: DeserializeOwned>(result: ExecutionResult) -> Result<T, ExecError> {
    match serde_json::from_str(result.stdout.trim()) {
        Ok(value) => Ok(value),
        Err(source) => Err(ExecError::Decode { source, result }),
    }
}

/// Uploads rendered scripts and runs them, elevated when configured.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    config: ExecutorConfig,
    uploader: Uploader,
    elevated: Option<ElevatedRunner>,
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl ScriptExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        let uploader = Uploader::new(config.upload.clone());
        let elevated = config
            .elevation
            .clone()
            .map(|credentials| ElevatedRunner::new(uploader.clone(), credentials, config.poll_interval));
        Self {
            config,
            uploader,
            elevated,
        }
    }

    /// Stream elevated task output into `log`. No effect without
    /// elevation.
    #[must_use]
    pub fn with_output(mut self, log: Arc<OutputLog>) -> Self {
        self.elevated = self.elevated.map(|runner| runner.with_output(log));
        self
    }

    /// Executor configuration.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Uploader used for scripts and files.
    #[must_use]
    pub const fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// Render, upload and run `script`, returning its result whatever the
    /// exit code. The uploaded script is always deleted.
    ///
    /// # Errors
    /// Returns error if rendering, transport, upload or cleanup fails. When
    /// cleanup fails after a failing script, both are reported with the
    /// script failure first.
    pub async fn execute<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        script: &Script,
    ) -> Result<ExecutionResult, ExecError> {
        let rendered = script.render()?;
        let mut body = String::with_capacity(UTF8_BOM.len() + rendered.len());
        body.push_str(UTF8_BOM);
        body.push_str(&rendered);

        let path = self
            .uploader
            .upload(shell, cancel, body.as_bytes(), &self.config.script_path())
            .await?;
        let command = file_command(&path);

        let mut outcome = match &self.elevated {
            Some(runner) => runner.run(shell, cancel, &command).await.map_err(ExecError::from),
            None => shell
                .execute_cancellable(cancel, &command)
                .await
                .map_err(ExecError::from),
        };
        if let Ok(result) = &outcome {
            tracing::debug!(
                script = %path,
                exit_code = result.exit_code,
                stdout_len = result.stdout.len(),
                stderr_len = result.stderr.len(),
                "script finished"
            );
        }

        let cleanup = self
            .uploader
            .delete(shell, cancel, &path)
            .await
            .map_err(ExecError::from);
        if cleanup.is_err() {
            outcome = outcome.and_then(check);
        }
        ExecError::combine(outcome, cleanup)
    }

    /// Upload raw bytes.
    ///
    /// # Errors
    /// Returns error if the upload fails.
    pub async fn upload<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        payload: &[u8],
        destination: &str,
    ) -> Result<String, ExecError> {
        Ok(self.uploader.upload(shell, cancel, payload, destination).await?)
    }

    /// Delete a remote file if present.
    ///
    /// # Errors
    /// Returns error if the remote delete fails.
    pub async fn delete<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<(), ExecError> {
        Ok(self.uploader.delete(shell, cancel, path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Elevation;
    use hvremote_session::MemoryHost;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Presence {
        #[serde(rename = "Exists")]
        exists: bool,
    }

    #[test]
    fn decodes_padded_json() {
        let presence: Presence = decode_result(ExecutionResult::ok("  {\"Exists\":true}  ")).unwrap();
        assert_eq!(presence, Presence { exists: true });
    }

    #[test]
    fn stderr_with_zero_exit_is_failure() {
        let err = check(ExecutionResult::new(0, "{}", "warning")).unwrap_err();
        assert!(matches!(err, ExecError::Execution(ref r) if r.stderr == "warning"));
    }

    #[test]
    fn decode_error_carries_result() {
        let err = decode_result::<Presence>(ExecutionResult::ok("{} {}")).unwrap_err();
        let result = err.result().unwrap();
        assert_eq!(result.stdout, "{} {}");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn uploads_runs_and_removes_script() {
        let host = MemoryHost::new();
        host.on_script("Get-VM -Name", |script| {
            assert!(script.contains("Get-VM -Name 'web 01'"));
            ExecutionResult::ok("{\"Exists\":true}\r\n")
        });
        let mut shell = host.shell();

        let script = Script::new("Get-VM -Name {{Name}} | ConvertTo-Json").string("Name", "web 01");
        let result = ScriptExecutor::default()
            .execute(&mut shell, &CancellationToken::new(), &script)
            .await
            .unwrap();

        assert_eq!(decode_result::<Presence>(result).unwrap(), Presence { exists: true });
        assert!(host.files().is_empty());
        assert!(host.commands().iter().any(|c| c.contains("-File \"C:\\Users\\hvremote\\AppData\\Local\\Temp\\hvremote-")));
    }

    #[tokio::test]
    async fn failed_script_is_returned_and_cleaned_up() {
        let host = MemoryHost::new();
        host.on_script("Remove-VM", |_| ExecutionResult::new(1, "", "VM is running"));
        let mut shell = host.shell();

        let result = ScriptExecutor::default()
            .execute(&mut shell, &CancellationToken::new(), &Script::new("Remove-VM web"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 1);
        assert!(check(result).is_err());
        assert!(host.files().is_empty());
    }

    #[tokio::test]
    async fn render_errors_run_nothing() {
        let host = MemoryHost::new();
        let mut shell = host.shell();

        let err = ScriptExecutor::default()
            .execute(&mut shell, &CancellationToken::new(), &Script::new("Get-VM {{Name}}"))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Render(RenderError::MissingValue(_))));
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn cleanup_failure_is_secondary_to_script_failure() {
        let host = MemoryHost::new();
        host.on_script("Stop-VM", |_| ExecutionResult::new(0, "", "access denied"));
        host.fail_when(".ps1' -Force", ExecutionResult::new(1, "", "in use"));
        let mut shell = host.shell();

        let outcome = ScriptExecutor::default()
            .execute(&mut shell, &CancellationToken::new(), &Script::new("Stop-VM web"))
            .await;

        let ExecError::WithSecondary { primary, secondary } = outcome.unwrap_err() else {
            panic!("expected the script failure alongside the cleanup failure");
        };
        assert_eq!(primary.result().unwrap().stderr, "access denied");
        assert!(matches!(*secondary, ExecError::Upload(UploadError::Remote { ref result, .. }) if result.stderr == "in use"));
    }

    #[tokio::test]
    async fn elevated_scripts_run_through_a_task() {
        let host = MemoryHost::new();
        host.on_script("Set-VMHost", |_| ExecutionResult::ok("done\r\n"));
        let mut shell = host.shell();

        let config = ExecutorConfig::default()
            .elevation(Elevation::new("HV\\admin", "secret"))
            .poll_interval(Duration::from_millis(1));
        let result = ScriptExecutor::new(config)
            .execute(&mut shell, &CancellationToken::new(), &Script::new("Set-VMHost -NumaSpanningEnabled $false"))
            .await
            .unwrap();

        assert_eq!(result, ExecutionResult::ok("done\n"));
        assert_eq!(host.registrations().len(), 1);
        assert!(host.task_names().is_empty());
        assert!(host.files().is_empty());
    }

    #[tokio::test]
    async fn transport_failures_mark_the_error() {
        let host = MemoryHost::new();
        host.lose_connection(true);
        let mut shell = host.shell();

        let err = ScriptExecutor::default()
            .execute(&mut shell, &CancellationToken::new(), &Script::new("Get-VM"))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
