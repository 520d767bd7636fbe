//! Core abstractions for driving a remote hypervisor shell.
//!
//! This crate provides the shared vocabulary:
//! - `Shell` / `Connector` - Remote session seams
//! - `ExecutionResult` - Exit code, stdout and stderr of one command
//! - `Script` - Trusted skeleton plus escaped values
//! - `OutputLog` - Broadcast + history of incremental remote output
//! - `powershell` - Command-line encoding helpers
//! - `duration_secs` - Serde codec for whole-second durations

pub mod duration_secs;
pub mod output;
pub mod powershell;
pub mod script;
pub mod traits;

pub use output::{OutputLine, OutputLog};
pub use script::{RenderError, Script, ScriptValue};
pub use traits::{Connector, ExecutionResult, SessionId, Shell, ShellError};
