//! Bounded pool of reusable shell sessions.

use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use hvremote_core::{Connector, SessionId, Shell, ShellError};
use serde::Serialize;
use tokio::{
    runtime::Handle,
    sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConfigError, PoolConfig};

/// Session pool error.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Pool exhausted: all {max_total} sessions are in use")]
    Exhausted { max_total: usize },
    #[error("Timed out after {0:?} waiting for a session")]
    Timeout(Duration),
    #[error("Borrow cancelled")]
    Cancelled,
    #[error("Pool is closed")]
    Closed,
    #[error("Failed to open session: {0}")]
    Connect(#[source] ShellError),
    #[error("Failed to return session {id}: {source}")]
    Return {
        id: SessionId,
        #[source]
        source: ShellError,
    },
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Sessions currently borrowed.
    pub active: usize,
    /// Sessions waiting for reuse.
    pub idle: usize,
    /// Borrow capacity.
    pub max_total: usize,
}

struct IdleSession<S> {
    id: SessionId,
    shell: S,
    idle_since: Instant,
}

/// A borrowed session.
///
/// Hand it back with [`SessionPool::give_back`]. Dropping it instead
/// discards the session and still frees its slot.
pub struct PooledSession<S> {
    id: SessionId,
    shell: S,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<S> PooledSession<S> {
    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Mark the session as unusable so it is closed instead of reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the session was marked broken.
    #[must_use]
    pub const fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<S> fmt::Debug for PooledSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<S> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.shell
    }
}

impl<S> DerefMut for PooledSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.shell
    }
}

/// Bounded pool of shell sessions.
pub struct SessionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleSession<C::Shell>>>,
    closed: AtomicBool,
}

impl<C: Connector + 'static> SessionPool<C> {
    /// Create a pool and, inside a Tokio runtime, start its eviction sweep.
    ///
    /// The sweep holds only a weak reference and stops once the pool is
    /// dropped or closed.
    ///
    /// # Errors
    /// Returns error if the configuration is inconsistent.
    pub fn new(connector: C, config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let pool = Arc::new(Self {
            connector,
            permits: Arc::new(Semaphore::new(config.max_total)),
            idle: Mutex::new(VecDeque::with_capacity(config.max_idle)),
            closed: AtomicBool::new(false),
            config,
        });

        let interval = pool.config.eviction_interval;
        if !interval.is_zero() {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(run_evictor(Arc::downgrade(&pool), interval));
            }
        }
        Ok(pool)
    }
}

impl<C: Connector> SessionPool<C> {
    /// Pool configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current counters.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active: self
                .config
                .max_total
                .saturating_sub(self.permits.available_permits()),
            idle: self.lock_idle().len(),
            max_total: self.config.max_total,
        }
    }

    /// Borrow a session, reusing an idle one when possible.
    ///
    /// # Errors
    /// Returns error if the pool is exhausted (non-blocking mode), the wait
    /// times out, `cancel` fires, the pool is closed, or a new session
    /// cannot be opened.
    pub async fn borrow(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledSession<C::Shell>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = if self.config.block_when_exhausted {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PoolError::Cancelled),
                permit = self.acquire() => permit?,
            }
        } else {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    return Err(PoolError::Exhausted {
                        max_total: self.config.max_total,
                    });
                }
                Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            }
        };

        let (reused, expired) = self.checkout_idle();
        self.close_all(expired, "expired on borrow").await;

        if let Some(idle) = reused {
            tracing::debug!(session = %idle.id, "reusing idle session");
            return Ok(PooledSession {
                id: idle.id,
                shell: idle.shell,
                broken: false,
                _permit: permit,
            });
        }

        let shell = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PoolError::Cancelled),
            shell = self.connector.connect() => shell.map_err(PoolError::Connect)?,
        };
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, "opened session");
        Ok(PooledSession {
            id,
            shell,
            broken: false,
            _permit: permit,
        })
    }

    /// Return a borrowed session.
    ///
    /// The slot is released even when closing the session fails, so a dead
    /// connection never blocks later borrowers.
    ///
    /// # Errors
    /// Returns error if the session had to be closed and closing failed.
    pub async fn give_back(&self, session: PooledSession<C::Shell>) -> Result<(), PoolError> {
        let PooledSession {
            id,
            mut shell,
            broken,
            _permit,
        } = session;

        if !broken && !self.is_closed() {
            let mut idle = self.lock_idle();
            if idle.len() < self.config.max_idle {
                idle.push_back(IdleSession {
                    id,
                    shell,
                    idle_since: Instant::now(),
                });
                return Ok(());
            }
        }

        tracing::debug!(session = %id, broken, "closing returned session");
        shell
            .close()
            .await
            .map_err(|source| PoolError::Return { id, source })
    }

    /// Close expired idle sessions, then top the idle set up to `min_idle`.
    ///
    /// Returns the number of sessions evicted.
    pub async fn evict(&self) -> usize {
        let expired = self.take_expired();
        let evicted = expired.len();
        self.close_all(expired, "evicted").await;
        self.ensure_min_idle().await;
        evicted
    }

    /// Close every idle session and refuse further borrows.
    ///
    /// Borrowed sessions are closed as they are given back.
    ///
    /// # Errors
    /// Returns the first failure to close an idle session.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.closed.store(true, Ordering::Release);
        self.permits.close();

        let drained: Vec<_> = self.lock_idle().drain(..).collect();
        let mut first_error = None;
        for mut idle in drained {
            if let Err(source) = idle.shell.close().await {
                tracing::warn!(session = %idle.id, %source, "failed to close idle session");
                first_error.get_or_insert(PoolError::Return {
                    id: idle.id,
                    source,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        match self.config.max_wait {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| PoolError::Timeout(limit))?
                .map_err(|_| PoolError::Closed),
            None => acquire.await.map_err(|_| PoolError::Closed),
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleSession<C::Shell>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, idle: &IdleSession<C::Shell>, now: Instant) -> bool {
        self.config
            .effective_idle_timeout()
            .is_some_and(|timeout| now.duration_since(idle.idle_since) >= timeout)
    }

    /// Pop the most recently returned live session, collecting expired ones
    /// passed over on the way.
    fn checkout_idle(&self) -> (Option<IdleSession<C::Shell>>, Vec<IdleSession<C::Shell>>) {
        let now = Instant::now();
        let mut idle = self.lock_idle();
        let mut expired = Vec::new();
        while let Some(candidate) = idle.pop_back() {
            if self.is_expired(&candidate, now) {
                expired.push(candidate);
            } else {
                return (Some(candidate), expired);
            }
        }
        (None, expired)
    }

    fn take_expired(&self) -> Vec<IdleSession<C::Shell>> {
        let now = Instant::now();
        let mut idle = self.lock_idle();
        let (expired, live): (Vec<_>, Vec<_>) =
            idle.drain(..).partition(|s| self.is_expired(s, now));
        idle.extend(live);
        expired
    }

    async fn close_all(&self, sessions: Vec<IdleSession<C::Shell>>, reason: &'static str) {
        for mut idle in sessions {
            tracing::debug!(session = %idle.id, reason, "closing idle session");
            if let Err(source) = idle.shell.close().await {
                tracing::warn!(session = %idle.id, %source, reason, "failed to close idle session");
            }
        }
    }

    async fn ensure_min_idle(&self) {
        while !self.is_closed() {
            let status = self.status();
            if status.idle >= self.config.min_idle
                || status.idle + status.active >= self.config.max_total
            {
                break;
            }
            let Ok(_permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            match self.connector.connect().await {
                Ok(shell) => {
                    let id = Uuid::new_v4();
                    tracing::debug!(session = %id, "opened warm session");
                    self.lock_idle().push_back(IdleSession {
                        id,
                        shell,
                        idle_since: Instant::now(),
                    });
                }
                Err(source) => {
                    tracing::warn!(%source, "failed to open warm session");
                    break;
                }
            }
        }
    }
}

async fn run_evictor<C: Connector + 'static>(pool: Weak<SessionPool<C>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_closed() {
            break;
        }
        let evicted = pool.evict().await;
        if evicted > 0 {
            tracing::debug!(evicted, "idle sweep closed sessions");
        }
    }
}
