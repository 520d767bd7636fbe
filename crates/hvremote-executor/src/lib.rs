//! Remote script execution.
//!
//! Provides:
//! - `ScriptExecutor` - Render, upload, run and clean up one script
//! - `ElevatedRunner` - Run a command line as another principal via a
//!   scheduled task
//! - `RemoteClient` - Capability trait with pooled and direct clients
//! - Result decoding for scripts that print one JSON document

pub mod client;
pub mod config;
pub mod elevation;
pub mod executor;

pub use client::{DirectClient, PooledClient, RemoteClient, RemoteClientExt};
pub use config::{Elevation, ExecutorConfig};
pub use elevation::{ElevatedRunner, ElevationError, ElevationStep};
pub use executor::{ExecError, ScriptExecutor, check, decode_result};
