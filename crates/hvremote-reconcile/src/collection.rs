//! Positional target driven by caller-supplied scripts.

use std::marker::PhantomData;

use async_trait::async_trait;
use hvremote_core::Script;
use hvremote_executor::{ExecError, RemoteClient};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::engine::PositionalTarget;

/// Script skeletons for one kind of sub-resource.
///
/// Every skeleton may use `{{Key}}` (string) and `{{Position}}` (integer).
/// Create and update get `{{Desired}}`, update and delete get `{{Current}}`,
/// both as single-quoted JSON for `ConvertFrom-Json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionScripts {
    pub create: String,
    pub update: String,
    pub delete: String,
}

/// A sub-resource collection (adapters, disks, drives, GPU partitions)
/// reconciled through a remote client.
pub struct ScriptedCollection<C, T> {
    client: C,
    scripts: CollectionScripts,
    _item: PhantomData<fn() -> T>,
}

impl<C: RemoteClient, T> ScriptedCollection<C, T> {
    /// Create a collection target.
    #[must_use]
    pub const fn new(client: C, scripts: CollectionScripts) -> Self {
        Self {
            client,
            scripts,
            _item: PhantomData,
        }
    }

    fn script(skeleton: &str, key: &str, position: usize) -> Script {
        Script::new(skeleton)
            .string("Key", key)
            .int("Position", i64::try_from(position).unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl<C, T> PositionalTarget for ScriptedCollection<C, T>
where
    C: RemoteClient,
    T: PartialEq + Serialize + Send + Sync,
{
    type Item = T;
    type Error = ExecError;

    async fn create(
        &self,
        cancel: &CancellationToken,
        key: &str,
        position: usize,
        desired: &T,
    ) -> Result<(), ExecError> {
        let script = Self::script(&self.scripts.create, key, position).serialized("Desired", desired)?;
        self.client.run(cancel, &script).await
    }

    async fn update(
        &self,
        cancel: &CancellationToken,
        key: &str,
        position: usize,
        current: &T,
        desired: &T,
    ) -> Result<(), ExecError> {
        let script = Self::script(&self.scripts.update, key, position)
            .serialized("Current", current)?
            .serialized("Desired", desired)?;
        self.client.run(cancel, &script).await
    }

    async fn delete(
        &self,
        cancel: &CancellationToken,
        key: &str,
        position: usize,
        current: &T,
    ) -> Result<(), ExecError> {
        let script = Self::script(&self.scripts.delete, key, position).serialized("Current", current)?;
        self.client.run(cancel, &script).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ReconcileError, Step, reconcile};
    use hvremote_core::ExecutionResult;
    use hvremote_executor::{DirectClient, ScriptExecutor};
    use hvremote_session::MemoryHost;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Disk {
        path: String,
        controller: u8,
    }

    fn disk(path: &str) -> Disk {
        Disk {
            path: path.to_string(),
            controller: 0,
        }
    }

    fn scripts() -> CollectionScripts {
        CollectionScripts {
            create: "Add-VMHardDiskDrive -VMName {{Key}} -Position {{Position}} -Disk ({{Desired}} | ConvertFrom-Json)".into(),
            update: "Set-VMHardDiskDrive -VMName {{Key}} -Position {{Position}} -From ({{Current}} | ConvertFrom-Json) -To ({{Desired}} | ConvertFrom-Json)".into(),
            delete: "Remove-VMHardDiskDrive -VMName {{Key}} -Position {{Position}} -Disk ({{Current}} | ConvertFrom-Json)".into(),
        }
    }

    #[tokio::test]
    async fn shrinking_disk_list_runs_scripts_in_order() {
        let host = MemoryHost::new();
        let client = DirectClient::new(host.shell(), ScriptExecutor::default());
        let target = ScriptedCollection::new(client, scripts());

        let current = vec![disk("C:\\a.vhdx"), disk("C:\\b.vhdx"), disk("C:\\c.vhdx")];
        let desired = vec![disk("C:\\z.vhdx")];
        let report = reconcile(&target, &CancellationToken::new(), "web", &current, &desired)
            .await
            .unwrap();
        assert_eq!(report.applied, vec![Step::Delete(2), Step::Delete(1), Step::Update(0)]);

        let ran = host.commands().iter().filter(|c| c.contains("-File ")).count();
        assert_eq!(ran, 3);

        let bodies: Vec<String> = host
            .scripts()
            .into_iter()
            .filter(|s| s.contains("VMHardDiskDrive"))
            .collect();
        assert!(bodies.is_empty(), "script bodies travel as files, not inline");
    }

    #[tokio::test]
    async fn renders_key_position_and_items() {
        let host = MemoryHost::new();
        host.on_script("Add-VMHardDiskDrive", |script| {
            assert!(script.contains("-VMName 'web' -Position 1"));
            assert!(script.contains(r#"'{"controller":0,"path":"C:\\d's.vhdx"}'"#.replace("'s", "''s").as_str()));
            ExecutionResult::ok("")
        });
        let client = DirectClient::new(host.shell(), ScriptExecutor::default());
        let target = ScriptedCollection::new(client, scripts());

        let current = vec![disk("C:\\a.vhdx")];
        let desired = vec![disk("C:\\a.vhdx"), disk("C:\\d's.vhdx")];
        let report = reconcile(&target, &CancellationToken::new(), "web", &current, &desired)
            .await
            .unwrap();
        assert_eq!(report.applied, vec![Step::Create(1)]);
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn failing_script_aborts_with_execution_error() {
        let host = MemoryHost::new();
        host.on_script("Remove-VMHardDiskDrive", |_| {
            ExecutionResult::new(1, "", "The disk is in use.")
        });
        let client = DirectClient::new(host.shell(), ScriptExecutor::default());
        let target = ScriptedCollection::new(client, scripts());

        let current = vec![disk("C:\\a.vhdx"), disk("C:\\b.vhdx")];
        let err = reconcile(&target, &CancellationToken::new(), "web", &current, &[])
            .await
            .unwrap_err();

        let ReconcileError::Step { step, applied, source, .. } = err else {
            panic!("expected a failed step");
        };
        assert_eq!(step, Step::Delete(1));
        assert_eq!(applied, 0);
        assert!(matches!(source, ExecError::Execution(_)));
    }
}
