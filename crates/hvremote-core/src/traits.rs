//! Core traits for remote shell sessions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Outcome of one remote command.
///
/// `stdout` is the only channel for structured results. Any stderr output
/// counts as failure regardless of the exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    /// Create a result from its parts.
    #[must_use]
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// A successful result with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(0, stdout, "")
    }

    /// Whether the command succeeded: zero exit code and nothing on stderr.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.stderr.trim().is_empty()
    }
}

/// Transport error.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Session closed")]
    Closed,
    #[error("Command rejected: {0}")]
    Rejected(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One remote shell invocation context.
///
/// Implementations are stateful and not shared between concurrent
/// operations; whoever holds the session owns it.
#[async_trait]
pub trait Shell: Send {
    /// Execute one command line and capture its output.
    async fn execute(&mut self, command: &str) -> Result<ExecutionResult, ShellError>;

    /// Close the underlying connection.
    async fn close(&mut self) -> Result<(), ShellError>;

    /// Execute a command, aborting when `cancel` fires.
    ///
    /// # Errors
    /// Returns `ShellError::Cancelled` if the token fires first, otherwise
    /// whatever `execute` returns.
    async fn execute_cancellable(
        &mut self,
        cancel: &CancellationToken,
        command: &str,
    ) -> Result<ExecutionResult, ShellError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("remote command cancelled");
                Err(ShellError::Cancelled)
            }
            result = self.execute(command) => result,
        }
    }
}

#[async_trait]
impl<S: Shell + ?Sized> Shell for Box<S> {
    async fn execute(&mut self, command: &str) -> Result<ExecutionResult, ShellError> {
        (**self).execute(command).await
    }

    async fn close(&mut self) -> Result<(), ShellError> {
        (**self).close().await
    }
}

/// Trait for establishing new shell sessions.
///
/// Credentials, TLS and the shell protocol handshake live behind this seam.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Shell: Shell + 'static;

    /// Open a new session.
    async fn connect(&self) -> Result<Self::Shell, ShellError>;
}
