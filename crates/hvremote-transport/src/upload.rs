//! Chunked upload of arbitrary payloads through a length-limited shell.
//!
//! The payload is appended to a remote temp file as base64 lines, one line
//! per command, then decoded into the destination by a single reconstruct
//! script. The temp file is removed afterwards whether or not the transfer
//! succeeded.

use std::fmt;

use hvremote_core::{
    ExecutionResult, Shell, ShellError,
    powershell::{delete_script, encoded_command, quote, resolve_path_script},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk::{ChunkPlan, scaffold_len};

/// Stage of an upload, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStep {
    Resolve,
    Append { index: usize, total: usize },
    Reconstruct,
    Cleanup,
}

impl fmt::Display for UploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve => f.write_str("path resolution"),
            Self::Append { index, total } => write!(f, "append of chunk {}/{total}", index + 1),
            Self::Reconstruct => f.write_str("reconstruct"),
            Self::Cleanup => f.write_str("temp file cleanup"),
        }
    }
}

/// Upload error.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Transport error during {step}: {source}")]
    Shell {
        step: UploadStep,
        #[source]
        source: ShellError,
    },
    #[error("{step} failed with exit code {}: {}", result.exit_code, result.stderr.trim())]
    Remote {
        step: UploadStep,
        result: ExecutionResult,
    },
    #[error("Path {0:?} resolved to nothing")]
    EmptyPath(String),
    #[error("Command length limit {max_command_len} leaves no room for data after a {scaffold_len}-character scaffold")]
    CommandTooShort {
        max_command_len: usize,
        scaffold_len: usize,
    },
    #[error("{primary} (cleanup also failed: {secondary})")]
    WithSecondary {
        primary: Box<UploadError>,
        secondary: Box<UploadError>,
    },
}

impl UploadError {
    /// Whether the failure came from the transport rather than the remote
    /// side.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Shell { .. } => true,
            Self::WithSecondary { primary, .. } => primary.is_transport(),
            _ => false,
        }
    }

    /// Merge the outcome of an operation with the outcome of its cleanup,
    /// keeping the operation's error first.
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

/// Upload configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Longest command line the remote shell accepts.
    pub max_command_len: usize,
    /// Remote directory for intermediate files. May contain `%VAR%`
    /// references, which are expanded remotely.
    pub temp_dir: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_command_len: 8000,
            temp_dir: "%TEMP%".to_string(),
        }
    }
}

impl UploadConfig {
    /// Set the command-length limit.
    #[must_use]
    pub const fn max_command_len(mut self, limit: usize) -> Self {
        self.max_command_len = limit;
        self
    }

    /// Set the remote temp directory.
    #[must_use]
    pub fn temp_dir(mut self, dir: impl Into<String>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// A unique, unresolved path under the temp directory.
    #[must_use]
    pub fn temp_path(&self, prefix: &str, extension: &str) -> String {
        format!(
            "{}\\{prefix}-{}.{extension}",
            self.temp_dir.trim_end_matches('\\'),
            Uuid::new_v4().simple()
        )
    }
}

/// Uploads payloads and manages the remote files it creates.
#[derive(Debug, Clone, Default)]
pub struct Uploader {
    config: UploadConfig,
}

impl Uploader {
    /// Create an uploader.
    #[must_use]
    pub const fn new(config: UploadConfig) -> Self {
        Self { config }
    }

    /// Upload configuration.
    #[must_use]
    pub const fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload `payload` to `destination` and return its absolute remote
    /// path.
    ///
    /// # Errors
    /// Returns error if any remote step fails. A failed upload is not
    /// resumed; the temp file is deleted before returning.
    pub async fn upload<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        payload: &[u8],
        destination: &str,
    ) -> Result<String, UploadError> {
        let tmp = self
            .resolve_path(shell, cancel, &self.config.temp_path("hvremote-upload", "b64"))
            .await?;
        let dest = self.resolve_path(shell, cancel, destination).await?;

        let transfer = self.transfer(shell, cancel, payload, &tmp, &dest).await;
        let cleanup = self.delete_step(shell, cancel, &tmp, UploadStep::Cleanup).await;
        UploadError::combine(transfer, cleanup)?;

        tracing::info!(destination = %dest, bytes = payload.len(), "upload complete");
        Ok(dest)
    }

    /// Resolve `path` to an absolute path on the remote side.
    ///
    /// # Errors
    /// Returns error if the remote command fails or prints nothing.
    pub async fn resolve_path<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<String, UploadError> {
        let result = run_step(
            shell,
            cancel,
            UploadStep::Resolve,
            &encoded_command(&resolve_path_script(path)),
        )
        .await?;
        let resolved = result.stdout.trim();
        if resolved.is_empty() {
            return Err(UploadError::EmptyPath(path.to_string()));
        }
        Ok(resolved.to_string())
    }

    /// Delete a remote file if it exists.
    ///
    /// # Errors
    /// Returns error if the remote command fails.
    pub async fn delete<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<(), UploadError> {
        self.delete_step(shell, cancel, path, UploadStep::Cleanup)
            .await
    }

    async fn delete_step<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        path: &str,
        step: UploadStep,
    ) -> Result<(), UploadError> {
        run_step(shell, cancel, step, &encoded_command(&delete_script(path)))
            .await
            .map(|_| ())
    }

    async fn transfer<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        payload: &[u8],
        tmp: &str,
        dest: &str,
    ) -> Result<(), UploadError> {
        let plan = ChunkPlan::new(self.config.max_command_len, tmp).ok_or(
            UploadError::CommandTooShort {
                max_command_len: self.config.max_command_len,
                scaffold_len: scaffold_len(tmp),
            },
        )?;
        let total = plan.chunk_count(payload.len());
        tracing::debug!(
            tmp,
            bytes = payload.len(),
            chunk_size = plan.chunk_size(),
            chunks = total,
            "uploading payload"
        );

        for (index, command) in plan.commands(payload).enumerate() {
            run_step(shell, cancel, UploadStep::Append { index, total }, &command).await?;
        }

        run_step(
            shell,
            cancel,
            UploadStep::Reconstruct,
            &encoded_command(&reconstruct_script(tmp, dest)),
        )
        .await
        .map(|_| ())
    }
}

/// Script decoding the base64 lines of `tmp` into `dest`.
///
/// Writes to a sibling `.part` file and moves it over the destination, so
/// readers never see a half-written file.
#[must_use]
pub fn reconstruct_script(tmp: &str, dest: &str) -> String {
    format!(
        r"$ErrorActionPreference = 'Stop'
$tmp_file_path = {tmp}
$dest_file_path = {dest}
$dest_dir = [System.IO.Path]::GetDirectoryName($dest_file_path)
if (-not (Test-Path -LiteralPath $dest_dir)) {{ New-Item -ItemType Directory -Force -Path $dest_dir | Out-Null }}
$part_file_path = $dest_file_path + '.part'
$writer = [System.IO.File]::Create($part_file_path)
try {{
if (Test-Path -LiteralPath $tmp_file_path) {{
$reader = [System.IO.File]::OpenText($tmp_file_path)
try {{
while ($null -ne ($line = $reader.ReadLine())) {{
$line = $line.Trim()
if ($line.Length -eq 0) {{ continue }}
$bytes = [System.Convert]::FromBase64String($line)
$writer.Write($bytes, 0, $bytes.Length)
}}
}} finally {{ $reader.Close() }}
}}
}} finally {{ $writer.Close() }}
Move-Item -LiteralPath $part_file_path -Destination $dest_file_path -Force",
        tmp = quote(tmp),
        dest = quote(dest),
    )
}

async fn run_step<S: Shell + ?Sized>(
    shell: &mut S,
    cancel: &CancellationToken,
    step: UploadStep,
    command: &str,
) -> Result<ExecutionResult, UploadError> {
    let result = shell
        .execute_cancellable(cancel, command)
        .await
        .map_err(|source| UploadError::Shell { step, source })?;
    if result.is_success() {
        Ok(result)
    } else {
        Err(UploadError::Remote { step, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvremote_session::MemoryHost;
    use tokio_test::assert_err;

    const TEMP: &str = "C:\\Users\\hvremote\\AppData\\Local\\Temp";

    fn expected_chunk_size(limit: usize) -> usize {
        let tmp = format!("{TEMP}\\hvremote-upload-{}.b64", Uuid::nil().simple());
        ChunkPlan::new(limit, &tmp).unwrap().chunk_size()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn round_trips_payloads_around_chunk_boundaries() {
        for limit in [3500, 5000, 8191] {
            let chunk = expected_chunk_size(limit);
            for len in [0, 1, chunk - 1, chunk, chunk + 1, chunk * 3 + 2] {
                let host = MemoryHost::new().with_max_command_len(limit);
                let mut shell = host.shell();
                let uploader = Uploader::new(UploadConfig::default().max_command_len(limit));
                let data = payload(len);

                let dest = uploader
                    .upload(&mut shell, &CancellationToken::new(), &data, "C:\\VMs\\seed.bin")
                    .await
                    .unwrap_or_else(|e| panic!("limit {limit}, len {len}: {e}"));

                assert_eq!(dest, "C:\\VMs\\seed.bin");
                assert_eq!(host.file(&dest).unwrap(), data, "limit {limit}, len {len}");
                assert_eq!(host.files(), vec![dest.clone()]);

                let appends: Vec<String> = host
                    .commands()
                    .into_iter()
                    .filter(|c| c.starts_with("echo "))
                    .collect();
                assert_eq!(appends.len(), len.div_ceil(chunk));
                assert!(appends.iter().all(|c| c.len() <= limit));
            }
        }
    }

    #[tokio::test]
    async fn destination_is_resolved_remotely_and_replaced() {
        let host = MemoryHost::new();
        host.put_file(&format!("{TEMP}\\script.ps1"), b"old".to_vec());
        let mut shell = host.shell();

        let dest = Uploader::default()
            .upload(&mut shell, &CancellationToken::new(), b"new", "%TEMP%\\script.ps1")
            .await
            .unwrap();

        assert_eq!(dest, format!("{TEMP}\\script.ps1"));
        assert_eq!(host.file(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn failed_append_aborts_and_cleans_up() {
        let host = MemoryHost::new();
        host.fail_when("echo ", ExecutionResult::new(1, "", "The system cannot find the path specified."));
        let mut shell = host.shell();

        let err = Uploader::default()
            .upload(&mut shell, &CancellationToken::new(), b"payload", "C:\\a.bin")
            .await
            .unwrap_err();

        match err {
            UploadError::Remote { step, result } => {
                assert_eq!(step, UploadStep::Append { index: 0, total: 1 });
                assert!(result.stderr.contains("cannot find the path"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(host.files().is_empty());
        assert!(host.scripts().last().unwrap().contains("Remove-Item"));
    }

    #[tokio::test]
    async fn failed_reconstruct_reports_remote_output() {
        let host = MemoryHost::new();
        host.fail_when("FromBase64String", ExecutionResult::new(1, "partial", "Access denied"));
        let mut shell = host.shell();

        let err = Uploader::default()
            .upload(&mut shell, &CancellationToken::new(), b"payload", "C:\\a.bin")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::Remote { step: UploadStep::Reconstruct, ref result } if result.stdout == "partial"
        ));
        assert!(host.files().is_empty());
    }

    #[tokio::test]
    async fn cleanup_failure_is_secondary_to_the_transfer_error() {
        let host = MemoryHost::new();
        host.fail_when("FromBase64String", ExecutionResult::new(1, "", "Access denied"));
        host.fail_when("Remove-Item", ExecutionResult::new(1, "", "file in use"));
        let mut shell = host.shell();

        let err = Uploader::default()
            .upload(&mut shell, &CancellationToken::new(), b"x", "C:\\a.bin")
            .await
            .unwrap_err();

        let UploadError::WithSecondary { primary, secondary } = err else {
            panic!("expected both errors");
        };
        assert!(matches!(*primary, UploadError::Remote { step: UploadStep::Reconstruct, .. }));
        assert!(matches!(*secondary, UploadError::Remote { step: UploadStep::Cleanup, .. }));
    }

    #[tokio::test]
    async fn cleanup_failure_alone_is_reported() {
        let host = MemoryHost::new();
        host.fail_when("Remove-Item", ExecutionResult::new(1, "", "file in use"));
        let mut shell = host.shell();

        let err = Uploader::default()
            .upload(&mut shell, &CancellationToken::new(), b"x", "C:\\a.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Remote { step: UploadStep::Cleanup, .. }));
    }

    #[tokio::test]
    async fn limit_too_small_for_any_data() {
        let host = MemoryHost::new();
        let mut shell = host.shell();
        let uploader = Uploader::new(UploadConfig::default().max_command_len(60));

        let err = uploader
            .upload(&mut shell, &CancellationToken::new(), b"x", "C:\\a.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::CommandTooShort { max_command_len: 60, .. }));
    }

    #[tokio::test]
    async fn transport_errors_are_flagged() {
        let host = MemoryHost::new();
        host.lose_connection(true);
        let mut shell = host.shell();

        let err = assert_err!(
            Uploader::default()
                .upload(&mut shell, &CancellationToken::new(), b"x", "C:\\a.bin")
                .await
        );
        assert!(err.is_transport());
    }
}
