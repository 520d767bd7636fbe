//! Waiting for a VM to report network addresses.

use std::net::IpAddr;

use async_trait::async_trait;
use hvremote_core::Script;
use hvremote_executor::{ExecError, RemoteClient, RemoteClientExt};
use tokio_util::sync::CancellationToken;

use crate::poller::{Classify, ConvergeError, ConvergenceTarget, StateClass, WaitOptions, wait_for_state};

const OBSERVE: &str = "$addresses = @(Get-VMNetworkAdapter -VMName {{Name}} -ErrorAction Stop | ForEach-Object { $_.IPAddresses })
ConvertTo-Json -InputObject $addresses -Compress";

/// Addresses reported by the VM's adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressState {
    /// No usable address yet.
    Pending,
    /// At least one usable address.
    Assigned(Vec<IpAddr>),
}

impl AddressState {
    fn from_reported(reported: &[String]) -> Self {
        let usable: Vec<IpAddr> = reported
            .iter()
            .filter_map(|a| a.parse::<IpAddr>().ok())
            .filter(|ip| !is_link_local(ip))
            .collect();
        if usable.is_empty() {
            Self::Pending
        } else {
            Self::Assigned(usable)
        }
    }

    /// Usable addresses; empty while pending.
    #[must_use]
    pub fn into_addresses(self) -> Vec<IpAddr> {
        match self {
            Self::Pending => Vec::new(),
            Self::Assigned(addresses) => addresses,
        }
    }
}

impl Classify for AddressState {
    fn classify(&self) -> StateClass {
        match self {
            Self::Pending => StateClass::Transitional,
            Self::Assigned(_) => StateClass::Terminal,
        }
    }
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unicast_link_local() || v6.is_unspecified(),
    }
}

/// Network addresses of one named VM.
pub struct AddressTarget<C> {
    client: C,
    name: String,
}

impl<C: RemoteClient> AddressTarget<C> {
    /// Target the VM called `name`.
    #[must_use]
    pub fn new(client: C, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<C: RemoteClient> ConvergenceTarget for AddressTarget<C> {
    type State = AddressState;
    type Action = ();
    type Error = ExecError;

    async fn observe(&self, cancel: &CancellationToken) -> Result<AddressState, ExecError> {
        let script = Script::new(OBSERVE).string("Name", &self.name);
        let reported: Vec<String> = self.client.run_with_result(cancel, &script).await?;
        tracing::debug!(vm = %self.name, ?reported, "observed addresses");
        Ok(AddressState::from_reported(&reported))
    }

    fn corrective_action(&self, _current: &AddressState, _desired: &AddressState) -> Option<()> {
        None
    }

    async fn apply(&self, _cancel: &CancellationToken, _action: &()) -> Result<(), ExecError> {
        Ok(())
    }

    /// Any assigned address will do.
    fn reached(&self, current: &AddressState, _desired: &AddressState) -> bool {
        matches!(current, AddressState::Assigned(_))
    }
}

/// Wait until the VM called `name` reports a usable address.
///
/// # Errors
/// Returns `ConvergeError::Timeout` if no address appears in time, or the
/// error of a failed observation.
pub async fn wait_for_addresses<C: RemoteClient>(
    client: C,
    cancel: &CancellationToken,
    name: &str,
    options: WaitOptions,
) -> Result<Vec<IpAddr>, ConvergeError<AddressState, ExecError>> {
    let target = AddressTarget::new(client, name);
    let state = wait_for_state(&target, cancel, AddressState::Assigned(Vec::new()), options).await?;
    Ok(state.into_addresses())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvremote_core::ExecutionResult;
    use hvremote_executor::{DirectClient, ScriptExecutor};
    use hvremote_session::MemoryHost;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    #[test]
    fn link_local_addresses_do_not_count() {
        let state = AddressState::from_reported(&["fe80::1".into(), "169.254.3.4".into(), "garbage".into()]);
        assert_eq!(state, AddressState::Pending);

        let state = AddressState::from_reported(&["fe80::1".into(), "10.0.0.5".into()]);
        assert_eq!(state.into_addresses(), vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn waits_until_an_address_appears() {
        let host = MemoryHost::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        host.on_script("Get-VMNetworkAdapter", move |script| {
            assert!(script.contains("-VMName 'web'"));
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => ExecutionResult::ok("[]"),
                1 => ExecutionResult::ok("[\"fe80::215:5dff:fe00:1\"]"),
                _ => ExecutionResult::ok("[\"fe80::215:5dff:fe00:1\",\"192.168.1.20\"]\r\n"),
            }
        });
        let client = DirectClient::new(host.shell(), ScriptExecutor::default());
        let options = WaitOptions::new(Duration::from_secs(5), Duration::from_millis(2));

        let addresses = wait_for_addresses(client, &CancellationToken::new(), "web", options)
            .await
            .unwrap();

        assert_eq!(addresses, vec!["192.168.1.20".parse::<IpAddr>().unwrap()]);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_at_the_deadline() {
        let host = MemoryHost::new();
        host.on_script("Get-VMNetworkAdapter", |_| ExecutionResult::ok("[]"));
        let client = DirectClient::new(host.shell(), ScriptExecutor::default());
        let options = WaitOptions::new(Duration::from_millis(40), Duration::from_millis(10));

        let err = wait_for_addresses(client, &CancellationToken::new(), "web", options)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Timeout { last: Some(AddressState::Pending), .. }));
    }
}
