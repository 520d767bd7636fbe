//! Declarative convergence of remote Hyper-V resources.
//!
//! Provides:
//! - `reconcile` - Positional create/update/delete of ordered sub-resources
//! - `ScriptedCollection` - Sub-resource target driven by caller scripts
//! - `wait_for_state` - Polling convergence with one corrective action
//! - `VmPowerTarget` - VM power state convergence
//! - `wait_for_addresses` - Wait for a VM to report network addresses

pub mod address;
pub mod collection;
pub mod engine;
pub mod poller;
pub mod power;

pub use address::{AddressState, AddressTarget, wait_for_addresses};
pub use collection::{CollectionScripts, ScriptedCollection};
pub use engine::{PositionalTarget, ReconcileError, ReconcileReport, Step, plan, reconcile};
pub use poller::{
    Classify, ConvergeError, ConvergenceTarget, StateClass, WaitOptions, wait_for_state,
};
pub use power::{PowerAction, PowerState, VmPowerTarget};
