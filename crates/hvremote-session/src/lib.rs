//! Session pooling for remote shells.
//!
//! Provides:
//! - `SessionPool` - Bounded, blocking pool with idle eviction
//! - `PoolConfig` - Pool limits and timings
//! - `MemoryHost` - In-memory simulated remote host (feature: memory)

pub mod config;
pub mod pool;

#[cfg(feature = "memory")]
pub mod memory;

pub use config::{ConfigError, PoolConfig};
pub use pool::{PoolError, PoolStatus, PooledSession, SessionPool};

#[cfg(feature = "memory")]
pub use memory::{MemoryConnector, MemoryHost, MemoryShell};
