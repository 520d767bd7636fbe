//! Virtual machine power state convergence.

use async_trait::async_trait;
use hvremote_core::Script;
use hvremote_executor::{ExecError, RemoteClient, RemoteClientExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::poller::{Classify, ConvergeError, ConvergenceTarget, StateClass, WaitOptions, wait_for_state};

/// Hyper-V virtual machine state, as `Get-VM` names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Off,
    Stopping,
    Saved,
    Paused,
    Starting,
    Reset,
    Saving,
    Pausing,
    Resuming,
    FastSaved,
    FastSaving,
    ForceShutdown,
    ForceReboot,
    Hibernated,
    ComponentServicing,
    RunningCritical,
    OffCritical,
    StoppingCritical,
    SavedCritical,
    PausedCritical,
    StartingCritical,
    ResetCritical,
    SavingCritical,
    PausingCritical,
    ResumingCritical,
    FastSavedCritical,
    FastSavingCritical,
    #[serde(other)]
    Other,
}

impl Classify for PowerState {
    fn classify(&self) -> StateClass {
        match self {
            Self::Running
            | Self::Off
            | Self::Saved
            | Self::Paused
            | Self::FastSaved
            | Self::Hibernated => StateClass::Terminal,
            Self::Stopping
            | Self::Starting
            | Self::Reset
            | Self::Saving
            | Self::Pausing
            | Self::Resuming
            | Self::FastSaving
            | Self::ForceShutdown
            | Self::ForceReboot
            | Self::ComponentServicing => StateClass::Transitional,
            // Critical states mean the VM's storage is unreachable.
            _ => StateClass::RequiresManualIntervention,
        }
    }
}

/// Power operation moving a VM between terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Start,
    Resume,
    /// Graceful guest shutdown.
    Stop,
    /// Immediate power off.
    TurnOff,
    Suspend,
    Save,
}

impl PowerAction {
    /// Action leading from `current` to `desired`, if one exists.
    #[must_use]
    pub const fn between(current: PowerState, desired: PowerState) -> Option<Self> {
        use PowerState::{FastSaved, Hibernated, Off, Paused, Running, Saved};
        match (current, desired) {
            (Off | Saved | FastSaved | Hibernated, Running) => Some(Self::Start),
            (Paused, Running) => Some(Self::Resume),
            (Running, Off) => Some(Self::Stop),
            (Paused | Saved | FastSaved | Hibernated, Off) => Some(Self::TurnOff),
            (Running, Paused) => Some(Self::Suspend),
            (Running | Paused, Saved) => Some(Self::Save),
            _ => None,
        }
    }

    fn skeleton(self) -> &'static str {
        match self {
            Self::Start => "Start-VM -Name {{Name}}",
            Self::Resume => "Resume-VM -Name {{Name}}",
            Self::Stop => "Stop-VM -Name {{Name}} -Force",
            Self::TurnOff => "Stop-VM -Name {{Name}} -TurnOff -Force",
            Self::Suspend => "Suspend-VM -Name {{Name}}",
            Self::Save => "Save-VM -Name {{Name}}",
        }
    }
}

const OBSERVE: &str = "$vm = Get-VM -Name {{Name}} -ErrorAction Stop
@{ State = \"$($vm.State)\" } | ConvertTo-Json -Compress";

#[derive(Deserialize)]
struct Observed {
    #[serde(rename = "State")]
    state: PowerState,
}

/// Power state of one named VM.
pub struct VmPowerTarget<C> {
    client: C,
    name: String,
}

impl<C: RemoteClient> VmPowerTarget<C> {
    /// Target the VM called `name`.
    #[must_use]
    pub fn new(client: C, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }

    /// VM name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drive the VM to `desired`.
    ///
    /// # Errors
    /// See [`wait_for_state`].
    pub async fn ensure(
        &self,
        cancel: &CancellationToken,
        desired: PowerState,
        options: WaitOptions,
    ) -> Result<PowerState, ConvergeError<PowerState, ExecError>> {
        wait_for_state(self, cancel, desired, options).await
    }
}

#[async_trait]
impl<C: RemoteClient> ConvergenceTarget for VmPowerTarget<C> {
    type State = PowerState;
    type Action = PowerAction;
    type Error = ExecError;

    async fn observe(&self, cancel: &CancellationToken) -> Result<PowerState, ExecError> {
        let script = Script::new(OBSERVE).string("Name", &self.name);
        let observed: Observed = self.client.run_with_result(cancel, &script).await?;
        tracing::debug!(vm = %self.name, state = ?observed.state, "observed power state");
        Ok(observed.state)
    }

    fn corrective_action(&self, current: &PowerState, desired: &PowerState) -> Option<PowerAction> {
        PowerAction::between(*current, *desired)
    }

    async fn apply(&self, cancel: &CancellationToken, action: &PowerAction) -> Result<(), ExecError> {
        let script = Script::new(action.skeleton()).string("Name", &self.name);
        self.client.run(cancel, &script).await
    }
}
