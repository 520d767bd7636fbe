//! Elevated execution through a one-shot scheduled task.
//!
//! A remote session may lack the privilege a script needs. The runner wraps
//! the command line in a scheduled task registered for a privileged
//! principal, starts it, and follows its output through the log files the
//! task redirects stdout and stderr into:
//!
//! ```text
//! Define -> Register -> Start -> Poll (repeats) -> Collect
//!              \___________________________________\__ Teardown
//! ```
//!
//! Teardown (unregister, delete definition and logs) runs whenever
//! registration succeeded or files were written, whatever happened
//! afterwards.

use std::{fmt, sync::Arc, time::Duration};

use hvremote_core::{
    ExecutionResult, OutputLog, Shell, ShellError,
    powershell::{encoded_command, quote},
};
use hvremote_transport::{UploadError, Uploader};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Elevation;

/// `SCHED_S_TASK_HAS_NOT_RUN`: `LastTaskResult` of a task that never ran.
const NOT_YET_RUN: i64 = 267_011;

/// Polls for which a started task may still report it has not run.
const START_GRACE_POLLS: usize = 10;

/// Stage of an elevated run, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationStep {
    Define,
    Register,
    Start,
    Poll,
    Collect,
    Teardown,
}

impl fmt::Display for ElevationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Define => "task definition",
            Self::Register => "task registration",
            Self::Start => "task start",
            Self::Poll => "task status poll",
            Self::Collect => "task result collection",
            Self::Teardown => "task teardown",
        })
    }
}

/// Elevation error.
#[derive(Debug, Error)]
pub enum ElevationError {
    #[error("Transport error during {step}: {source}")]
    Shell {
        step: ElevationStep,
        #[source]
        source: ShellError,
    },
    #[error("{step} failed with exit code {}: {}", result.exit_code, result.stderr.trim())]
    Remote {
        step: ElevationStep,
        result: ExecutionResult,
    },
    #[error("Upload failed during {step}: {source}")]
    Upload {
        step: ElevationStep,
        #[source]
        source: UploadError,
    },
    #[error("Unreadable output from {step}: {stdout:?}")]
    Unreadable { step: ElevationStep, stdout: String },
    #[error("Elevated run cancelled")]
    Cancelled,
    #[error("{primary} (cleanup also failed: {secondary})")]
    WithSecondary {
        primary: Box<ElevationError>,
        secondary: Box<ElevationError>,
    },
}

impl ElevationError {
    /// Whether the session that produced this error should be discarded.
    ///
    /// A cancelled run may have abandoned a command mid-flight, so the
    /// session counts as spent.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Shell { .. } | Self::Cancelled => true,
            Self::Upload { source, .. } => source.is_transport(),
            Self::WithSecondary { primary, secondary } => {
                primary.is_transport() || secondary.is_transport()
            }
            Self::Remote { .. } | Self::Unreadable { .. } => false,
        }
    }

    fn combine<T>(primary: Result<T, Self>, cleanup: Result<(), Self>) -> Result<T, Self> {
        match (primary, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(secondary)) => Err(secondary),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(secondary)) => {
                tracing::warn!(%secondary, "task teardown failed after an earlier error");
                Err(Self::WithSecondary {
                    primary: Box::new(primary),
                    secondary: Box::new(secondary),
                })
            }
        }
    }
}

/// Remote artifacts of one elevated run.
#[derive(Debug)]
struct TaskArtifacts {
    name: String,
    stdout_log: Option<String>,
    stderr_log: Option<String>,
    definition: Option<String>,
    registered: bool,
}

enum Phase {
    Define,
    Register,
    Start,
    Poll {
        polls: usize,
        emitted: usize,
        output: Vec<String>,
    },
    Collect {
        output: Vec<String>,
    },
}

impl Phase {
    const fn step(&self) -> ElevationStep {
        match self {
            Self::Define => ElevationStep::Define,
            Self::Register => ElevationStep::Register,
            Self::Start => ElevationStep::Start,
            Self::Poll { .. } => ElevationStep::Poll,
            Self::Collect { .. } => ElevationStep::Collect,
        }
    }
}

/// One status poll: task state, last result, and stdout lines past the
/// requested offset.
#[derive(Debug, Deserialize)]
struct TaskStatus {
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Result", default)]
    result: Option<i64>,
    #[serde(rename = "Lines", default, deserialize_with = "log_lines")]
    lines: Vec<String>,
}

impl TaskStatus {
    fn is_running(&self) -> bool {
        matches!(self.state.as_str(), "Running" | "Queued")
    }

    /// Ready but never run: the start has not been picked up yet.
    fn not_started(&self) -> bool {
        self.state == "Ready" && self.result == Some(NOT_YET_RUN)
    }
}

/// Final result code and the task's stderr log.
#[derive(Debug, Deserialize)]
struct TaskOutcome {
    #[serde(rename = "Result")]
    result: i64,
    #[serde(rename = "Errors", default, deserialize_with = "log_lines")]
    errors: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLines {
    One(String),
    Many(Vec<Option<String>>),
}

fn log_lines<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<RawLines>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(RawLines::One(line)) => vec![line],
        Some(RawLines::Many(lines)) => lines.into_iter().map(Option::unwrap_or_default).collect(),
    })
}

/// Runs command lines as a privileged principal via scheduled tasks.
#[derive(Debug, Clone)]
pub struct ElevatedRunner {
    uploader: Uploader,
    credentials: Elevation,
    poll_interval: Duration,
    output: Option<Arc<OutputLog>>,
}

impl ElevatedRunner {
    /// Create a runner. Intermediate files go to the uploader's temp
    /// directory.
    #[must_use]
    pub const fn new(uploader: Uploader, credentials: Elevation, poll_interval: Duration) -> Self {
        Self {
            uploader,
            credentials,
            poll_interval,
            output: None,
        }
    }

    /// Stream task output lines into `log` as they arrive.
    #[must_use]
    pub fn with_output(mut self, log: Arc<OutputLog>) -> Self {
        self.output = Some(log);
        self
    }

    /// Run `command_line` elevated and return its exit code, stdout and
    /// stderr.
    ///
    /// Stdout is streamed while the task runs; stderr is read once it has
    /// finished.
    ///
    /// # Errors
    /// Returns error if any phase fails. Teardown failures are reported
    /// alongside the original error, or alone if the run succeeded.
    pub async fn run<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        command_line: &str,
    ) -> Result<ExecutionResult, ElevationError> {
        let mut task = TaskArtifacts {
            name: format!("hvremote-{}", Uuid::new_v4().simple()),
            stdout_log: None,
            stderr_log: None,
            definition: None,
            registered: false,
        };
        let outcome = self.drive(shell, cancel, command_line, &mut task).await;

        if cancel.is_cancelled() {
            tracing::warn!(task = %task.name, "elevated run cancelled; remote task left behind");
            return outcome;
        }
        let teardown = self.teardown(shell, cancel, &task).await;
        ElevationError::combine(outcome, teardown)
    }

    async fn drive<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        command_line: &str,
        task: &mut TaskArtifacts,
    ) -> Result<ExecutionResult, ElevationError> {
        let mut phase = Phase::Define;
        loop {
            tracing::debug!(task = %task.name, step = %phase.step(), "elevation phase");
            phase = match phase {
                Phase::Define => {
                    let config = self.uploader.config();
                    let base = self
                        .uploader
                        .resolve_path(shell, cancel, &format!("{}\\{}", config.temp_dir, task.name))
                        .await
                        .map_err(|source| ElevationError::Upload { step: ElevationStep::Define, source })?;
                    let (stdout_log, stderr_log) = (format!("{base}.out.log"), format!("{base}.err.log"));
                    let xml = task_definition(&self.credentials.user, command_line, &stdout_log, &stderr_log);
                    task.stdout_log = Some(stdout_log);
                    task.stderr_log = Some(stderr_log);
                    let definition = self
                        .uploader
                        .upload(shell, cancel, xml.as_bytes(), &format!("{base}.xml"))
                        .await
                        .map_err(|source| ElevationError::Upload { step: ElevationStep::Define, source })?;
                    task.definition = Some(definition);
                    Phase::Register
                }
                Phase::Register => {
                    let definition = task.definition.as_deref().unwrap_or_default();
                    let script = register_script(&task.name, definition, &self.credentials);
                    step(shell, cancel, ElevationStep::Register, &script).await?;
                    task.registered = true;
                    tracing::info!(task = %task.name, user = %self.credentials.user, "task registered");
                    Phase::Start
                }
                Phase::Start => {
                    let script = format!("Start-ScheduledTask -TaskName {}", quote(&task.name));
                    step(shell, cancel, ElevationStep::Start, &script).await?;
                    Phase::Poll {
                        polls: 0,
                        emitted: 0,
                        output: Vec::new(),
                    }
                }
                Phase::Poll {
                    polls,
                    emitted,
                    mut output,
                } => {
                    let log = task.stdout_log.as_deref().unwrap_or_default();
                    let result = step(shell, cancel, ElevationStep::Poll, &poll_script(&task.name, log, emitted)).await?;
                    let status: TaskStatus = serde_json::from_str(result.stdout.trim()).map_err(|_| {
                        ElevationError::Unreadable {
                            step: ElevationStep::Poll,
                            stdout: result.stdout.clone(),
                        }
                    })?;
                    for line in &status.lines {
                        self.emit(&task.name, line);
                    }
                    let emitted = emitted + status.lines.len();
                    let pending = status.is_running() || (status.not_started() && polls < START_GRACE_POLLS);
                    output.extend(status.lines);
                    if pending {
                        self.pause(cancel).await?;
                        Phase::Poll {
                            polls: polls + 1,
                            emitted,
                            output,
                        }
                    } else {
                        tracing::debug!(task = %task.name, state = %status.state, lines = emitted, "task finished");
                        Phase::Collect { output }
                    }
                }
                Phase::Collect { output } => {
                    let errors = task.stderr_log.as_deref().unwrap_or_default();
                    let result = step(shell, cancel, ElevationStep::Collect, &collect_script(&task.name, errors)).await?;
                    let unreadable = || ElevationError::Unreadable {
                        step: ElevationStep::Collect,
                        stdout: result.stdout.clone(),
                    };
                    let outcome: TaskOutcome = serde_json::from_str(result.stdout.trim()).map_err(|_| unreadable())?;
                    let exit_code = result_code(outcome.result).ok_or_else(unreadable)?;
                    if let Some(log) = &self.output {
                        for line in &outcome.errors {
                            log.push_stderr(line.as_str());
                        }
                        log.push_finished();
                    }
                    return Ok(ExecutionResult::new(exit_code, join_lines(&output), join_lines(&outcome.errors)));
                }
            };
        }
    }

    async fn teardown<S: Shell + ?Sized>(
        &self,
        shell: &mut S,
        cancel: &CancellationToken,
        task: &TaskArtifacts,
    ) -> Result<(), ElevationError> {
        let mut first_error = None;
        if task.registered {
            let script = format!("Unregister-ScheduledTask -TaskName {} -Confirm:$false", quote(&task.name));
            if let Err(e) = step(shell, cancel, ElevationStep::Teardown, &script).await {
                first_error.get_or_insert(e);
            }
        }
        for path in [&task.definition, &task.stdout_log, &task.stderr_log].into_iter().flatten() {
            if let Err(source) = self.uploader.delete(shell, cancel, path).await {
                first_error.get_or_insert(ElevationError::Upload {
                    step: ElevationStep::Teardown,
                    source,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn emit(&self, task: &str, line: &str) {
        tracing::debug!(task, line, "elevated output");
        if let Some(log) = &self.output {
            log.push_stdout(line);
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), ElevationError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ElevationError::Cancelled),
            () = tokio::time::sleep(self.poll_interval) => Ok(()),
        }
    }
}

async fn step<S: Shell + ?Sized>(
    shell: &mut S,
    cancel: &CancellationToken,
    step: ElevationStep,
    script: &str,
) -> Result<ExecutionResult, ElevationError> {
    let result = shell
        .execute_cancellable(cancel, &encoded_command(script))
        .await
        .map_err(|source| match source {
            ShellError::Cancelled => ElevationError::Cancelled,
            source => ElevationError::Shell { step, source },
        })?;
    if result.is_success() {
        Ok(result)
    } else {
        Err(ElevationError::Remote { step, result })
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Task Scheduler definition running `command_line` through `cmd` with
/// stdout redirected to `stdout_log` and stderr to `stderr_log`.
#[must_use]
pub fn task_definition(user: &str, command_line: &str, stdout_log: &str, stderr_log: &str) -> String {
    let arguments = format!("/c {command_line} 1> \"{stdout_log}\" 2> \"{stderr_log}\"");
    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <Principals>
    <Principal id="Author">
      <UserId>{user}</UserId>
      <LogonType>Password</LogonType>
      <RunLevel>HighestAvailable</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <AllowHardTerminate>true</AllowHardTerminate>
    <StartWhenAvailable>false</StartWhenAvailable>
    <AllowStartOnDemand>true</AllowStartOnDemand>
    <Enabled>true</Enabled>
    <Hidden>false</Hidden>
    <ExecutionTimeLimit>PT24H</ExecutionTimeLimit>
    <Priority>4</Priority>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>cmd</Command>
      <Arguments>{arguments}</Arguments>
    </Exec>
  </Actions>
</Task>
"#,
        user = xml_escape(user),
        arguments = xml_escape(&arguments),
    )
}

fn register_script(name: &str, definition: &str, credentials: &Elevation) -> String {
    format!(
        "Register-ScheduledTask -TaskName {} -Xml ([System.IO.File]::ReadAllText({})) -User {} -Password {} -Force | Out-Null",
        quote(name),
        quote(definition),
        quote(&credentials.user),
        quote(&credentials.password),
    )
}

fn poll_script(name: &str, log: &str, skip: usize) -> String {
    format!(
        "$task = Get-ScheduledTask -TaskName {name}
$info = $task | Get-ScheduledTaskInfo
$lines = @(Get-Content -LiteralPath {log} -ErrorAction SilentlyContinue | Select-Object -Skip {skip})
@{{ State = \"$($task.State)\"; Result = $info.LastTaskResult; Lines = $lines }} | ConvertTo-Json -Compress",
        name = quote(name),
        log = quote(log),
    )
}

fn collect_script(name: &str, errors: &str) -> String {
    format!(
        "$info = Get-ScheduledTaskInfo -TaskName {name}
$errors = @(Get-Content -LiteralPath {errors} -ErrorAction SilentlyContinue)
@{{ Result = $info.LastTaskResult; Errors = $errors }} | ConvertTo-Json -Compress",
        name = quote(name),
        errors = quote(errors),
    )
}

/// `LastTaskResult` is unsigned; exit codes above `i32::MAX` keep their bit
/// pattern.
fn result_code(raw: i64) -> Option<i32> {
    i32::try_from(raw)
        .ok()
        .or_else(|| u32::try_from(raw).ok().map(|v| i32::from_ne_bytes(v.to_ne_bytes())))
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
