//! Remote client capability and its pooled and direct implementations.

use std::sync::Arc;

use async_trait::async_trait;
use hvremote_core::{Connector, ExecutionResult, Script, Shell};
use hvremote_session::{PooledSession, SessionPool};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::executor::{ExecError, ScriptExecutor, check, decode_result};

/// Runs scripts and moves files on one remote host.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Run `script` and return its result whatever the exit code.
    async fn run_raw(
        &self,
        cancel: &CancellationToken,
        script: &Script,
    ) -> Result<ExecutionResult, ExecError>;

    /// Upload `payload` to `destination`, returning the absolute remote path.
    async fn upload(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        destination: &str,
    ) -> Result<String, ExecError>;

    /// Delete a remote file if present.
    async fn delete(&self, cancel: &CancellationToken, path: &str) -> Result<(), ExecError>;

    /// Run `script` for its side effects.
    ///
    /// Non-zero exit code or any stderr output is an error.
    async fn run(&self, cancel: &CancellationToken, script: &Script) -> Result<(), ExecError> {
        check(self.run_raw(cancel, script).await?).map(|_| ())
    }
}

/// Structured results on top of [`RemoteClient`].
#[async_trait]
pub trait RemoteClientExt: RemoteClient {
    /// Run `script` and decode its trimmed stdout as one JSON document.
    async fn run_with_result<T>(
        &self,
        cancel: &CancellationToken,
        script: &Script,
    ) -> Result<T, ExecError>
    where
        T: DeserializeOwned + Send,
    {
        decode_result(check(self.run_raw(cancel, script).await?)?)
    }
}

impl<C: RemoteClient + ?Sized> RemoteClientExt for C {}

#[async_trait]
impl<C: RemoteClient + ?Sized> RemoteClient for Arc<C> {
    async fn run_raw(
        &self,
        cancel: &CancellationToken,
        script: &Script,
    ) -> Result<ExecutionResult, ExecError> {
        (**self).run_raw(cancel, script).await
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        destination: &str,
    ) -> Result<String, ExecError> {
        (**self).upload(cancel, payload, destination).await
    }

    async fn delete(&self, cancel: &CancellationToken, path: &str) -> Result<(), ExecError> {
        (**self).delete(cancel, path).await
    }
}

/// Client borrowing a session from a pool for every operation.
pub struct PooledClient<C: Connector> {
    pool: Arc<SessionPool<C>>,
    executor: ScriptExecutor,
}

impl<C: Connector + 'static> PooledClient<C> {
    /// Create a client over `pool`.
    #[must_use]
    pub const fn new(pool: Arc<SessionPool<C>>, executor: ScriptExecutor) -> Self {
        Self { pool, executor }
    }

    /// The pool sessions are borrowed from.
    #[must_use]
    pub const fn pool(&self) -> &Arc<SessionPool<C>> {
        &self.pool
    }

    /// Hand the session back, discarding it after a transport error.
    /// A failed return never masks the operation's own error.
    async fn finish<T: Send>(
        &self,
        mut session: PooledSession<C::Shell>,
        outcome: Result<T, ExecError>,
    ) -> Result<T, ExecError> {
        if outcome.as_ref().is_err_and(ExecError::is_transport) {
            tracing::debug!(session = %session.id(), "discarding session after transport error");
            session.mark_broken();
        }
        let returned = self.pool.give_back(session).await.map_err(ExecError::from);
        ExecError::combine(outcome, returned)
    }
}

#[async_trait]
impl<C: Connector + 'static> RemoteClient for PooledClient<C> {
    async fn run_raw(
        &self,
        cancel: &CancellationToken,
        script: &Script,
    ) -> Result<ExecutionResult, ExecError> {
        let mut session = self.pool.borrow(cancel).await?;
        let outcome = self.executor.execute(&mut *session, cancel, script).await;
        self.finish(session, outcome).await
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        destination: &str,
    ) -> Result<String, ExecError> {
        let mut session = self.pool.borrow(cancel).await?;
        let outcome = self
            .executor
            .upload(&mut *session, cancel, payload, destination)
            .await;
        self.finish(session, outcome).await
    }

    async fn delete(&self, cancel: &CancellationToken, path: &str) -> Result<(), ExecError> {
        let mut session = self.pool.borrow(cancel).await?;
        let outcome = self.executor.delete(&mut *session, cancel, path).await;
        self.finish(session, outcome).await
    }
}

/// Client owning a single session.
///
/// Operations are serialized on the session.
pub struct DirectClient<S: Shell> {
    shell: Mutex<S>,
    executor: ScriptExecutor,
}

impl<S: Shell> DirectClient<S> {
    /// Create a client over an open session.
    #[must_use]
    pub fn new(shell: S, executor: ScriptExecutor) -> Self {
        Self {
            shell: Mutex::new(shell),
            executor,
        }
    }

    /// Close the session.
    ///
    /// # Errors
    /// Returns error if the session fails to close.
    pub async fn close(self) -> Result<(), ExecError> {
        Ok(self.shell.into_inner().close().await?)
    }
}

#[async_trait]
impl<S: Shell> RemoteClient for DirectClient<S> {
    async fn run_raw(
        &self,
        cancel: &CancellationToken,
        script: &Script,
    ) -> Result<ExecutionResult, ExecError> {
        let mut shell = self.shell.lock().await;
        self.executor.execute(&mut *shell, cancel, script).await
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        destination: &str,
    ) -> Result<String, ExecError> {
        let mut shell = self.shell.lock().await;
        self.executor
            .upload(&mut *shell, cancel, payload, destination)
            .await
    }

    async fn delete(&self, cancel: &CancellationToken, path: &str) -> Result<(), ExecError> {
        let mut shell = self.shell.lock().await;
        self.executor.delete(&mut *shell, cancel, path).await
    }
}
