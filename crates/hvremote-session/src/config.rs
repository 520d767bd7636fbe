//! Session pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pool configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_total must be at least 1")]
    ZeroCapacity,
    #[error("min_idle ({min_idle}) exceeds max_idle ({max_idle})")]
    MinIdleAboveMaxIdle { min_idle: usize, max_idle: usize },
    #[error("max_idle ({max_idle}) exceeds max_total ({max_total})")]
    MaxIdleAboveMaxTotal { max_idle: usize, max_total: usize },
}

/// Session pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of sessions borrowed at once.
    pub max_total: usize,
    /// Maximum number of idle sessions kept for reuse.
    pub max_idle: usize,
    /// Number of idle sessions the eviction sweep keeps warm.
    pub min_idle: usize,
    /// How often the eviction sweep runs. Zero disables the sweep.
    #[serde(with = "hvremote_core::duration_secs")]
    pub eviction_interval: Duration,
    /// How long a session may sit idle before it is closed.
    /// Defaults to the eviction interval.
    #[serde(with = "hvremote_core::duration_secs::option")]
    pub idle_timeout: Option<Duration>,
    /// Block borrowers when every session is in use instead of failing.
    pub block_when_exhausted: bool,
    /// Upper bound on a blocked borrow.
    #[serde(with = "hvremote_core::duration_secs::option")]
    pub max_wait: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 5,
            max_idle: 5,
            min_idle: 0,
            eviction_interval: Duration::from_secs(60),
            idle_timeout: None,
            block_when_exhausted: true,
            max_wait: None,
        }
    }
}

impl PoolConfig {
    /// Set the maximum number of borrowed sessions.
    #[must_use]
    pub const fn max_total(mut self, max_total: usize) -> Self {
        self.max_total = max_total;
        self
    }

    /// Set the maximum number of idle sessions.
    #[must_use]
    pub const fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the warm idle target.
    #[must_use]
    pub const fn min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set the eviction sweep interval.
    #[must_use]
    pub const fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Choose between blocking and failing when exhausted.
    #[must_use]
    pub const fn block_when_exhausted(mut self, block: bool) -> Self {
        self.block_when_exhausted = block;
        self
    }

    /// Bound how long a blocked borrow may wait.
    #[must_use]
    pub const fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = Some(wait);
        self
    }

    /// Effective idle timeout. `None` means idle sessions never expire.
    #[must_use]
    pub fn effective_idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
            .or(Some(self.eviction_interval))
            .filter(|d| !d.is_zero())
    }

    /// Check the configuration for contradictions.
    ///
    /// # Errors
    /// Returns error if the limits are inconsistent.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.min_idle > self.max_idle {
            return Err(ConfigError::MinIdleAboveMaxIdle {
                min_idle: self.min_idle,
                max_idle: self.max_idle,
            });
        }
        if self.max_idle > self.max_total {
            return Err(ConfigError::MaxIdleAboveMaxTotal {
                max_idle: self.max_idle,
                max_total: self.max_total,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(PoolConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_inconsistent_limits() {
        assert_eq!(
            PoolConfig::default().max_total(0).validate(),
            Err(ConfigError::ZeroCapacity)
        );
        assert!(matches!(
            PoolConfig::default().max_idle(2).min_idle(3).validate(),
            Err(ConfigError::MinIdleAboveMaxIdle { .. })
        ));
        assert!(matches!(
            PoolConfig::default().max_total(2).max_idle(3).validate(),
            Err(ConfigError::MaxIdleAboveMaxTotal { .. })
        ));
    }

    #[test]
    fn durations_are_whole_seconds() {
        let config: PoolConfig = serde_json::from_str(
            r#"{"max_total": 3, "max_idle": 2, "eviction_interval": 30, "max_wait": 5}"#,
        )
        .unwrap();
        assert_eq!(config.max_total, 3);
        assert_eq!(config.eviction_interval, Duration::from_secs(30));
        assert_eq!(config.max_wait, Some(Duration::from_secs(5)));
        assert_eq!(config.idle_timeout, None);
        assert!(config.block_when_exhausted);
        assert_eq!(config.effective_idle_timeout(), Some(Duration::from_secs(30)));
    }
}
