//! Positional reconciliation of ordered sub-resource lists.
//!
//! Items have no identity beyond their index. Converging `current` to
//! `desired` therefore runs in a fixed order:
//!
//! 1. delete surplus items from the tail backward,
//! 2. update every overlapping position whose item differs,
//! 3. create the remaining desired items in order.
//!
//! A failed step stops the run. Steps already applied stay applied.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One planned change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "position", rename_all = "snake_case")]
pub enum Step {
    Delete(usize),
    Update(usize),
    Create(usize),
}

impl Step {
    /// Position the step targets.
    #[must_use]
    pub const fn position(self) -> usize {
        match self {
            Self::Delete(p) | Self::Update(p) | Self::Create(p) => p,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete(p) => write!(f, "delete at {p}"),
            Self::Update(p) => write!(f, "update at {p}"),
            Self::Create(p) => write!(f, "create at {p}"),
        }
    }
}

/// Reconciliation error.
#[derive(Debug, Error)]
pub enum ReconcileError<E> {
    #[error("{step} failed after {applied} of {planned} steps: {source}")]
    Step {
        step: Step,
        applied: usize,
        planned: usize,
        #[source]
        source: E,
    },
    #[error("Reconciliation cancelled after {applied} of {planned} steps")]
    Cancelled { applied: usize, planned: usize },
}

impl<E> ReconcileError<E> {
    /// Number of steps applied before the run stopped.
    #[must_use]
    pub const fn applied(&self) -> usize {
        match self {
            Self::Step { applied, .. } | Self::Cancelled { applied, .. } => *applied,
        }
    }
}

/// What a run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Steps applied, in order.
    pub applied: Vec<Step>,
    /// Overlapping positions left alone because they already matched.
    pub unchanged: usize,
}

/// A remote collection addressed by position.
#[async_trait]
pub trait PositionalTarget: Send + Sync {
    /// Item descriptor.
    type Item: PartialEq + Send + Sync;
    /// Failure of a single primitive.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Add `desired` at `position`, which is always the current length.
    async fn create(
        &self,
        cancel: &CancellationToken,
        key: &str,
        position: usize,
        desired: &Self::Item,
    ) -> Result<(), Self::Error>;

    /// Make the item at `position` match `desired`.
    async fn update(
        &self,
        cancel: &CancellationToken,
        key: &str,
        position: usize,
        current: &Self::Item,
        desired: &Self::Item,
    ) -> Result<(), Self::Error>;

    /// Remove the item at `position`, which is always the last one.
    async fn delete(
        &self,
        cancel: &CancellationToken,
        key: &str,
        position: usize,
        current: &Self::Item,
    ) -> Result<(), Self::Error>;
}

/// Compute the steps converging `current` to `desired`.
#[must_use]
pub fn plan<T: PartialEq>(current: &[T], desired: &[T]) -> Vec<Step> {
    let overlap = current.len().min(desired.len());
    let deletes = (desired.len()..current.len()).rev().map(Step::Delete);
    let updates = (0..overlap)
        .filter(|&i| current[i] != desired[i])
        .map(Step::Update);
    let creates = (current.len()..desired.len()).map(Step::Create);
    deletes.chain(updates).chain(creates).collect()
}

/// Converge the collection identified by `key` from `current` to `desired`.
///
/// Cancellation is checked between steps; a step in flight observes the
/// token through the target.
///
/// # Errors
/// Returns the first failed step, with how many steps were applied before
/// it, or `Cancelled` if the token fired between steps.
pub async fn reconcile<P: PositionalTarget + ?Sized>(
    target: &P,
    cancel: &CancellationToken,
    key: &str,
    current: &[P::Item],
    desired: &[P::Item],
) -> Result<ReconcileReport, ReconcileError<P::Error>> {
    let steps = plan(current, desired);
    let planned = steps.len();
    let unchanged = current.len().min(desired.len()) - steps.iter().filter(|s| matches!(s, Step::Update(_))).count();
    tracing::debug!(key, current = current.len(), desired = desired.len(), planned, unchanged, "reconciling");

    let mut applied = Vec::with_capacity(planned);
    for step in steps {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled {
                applied: applied.len(),
                planned,
            });
        }
        let outcome = match step {
            Step::Delete(p) => target.delete(cancel, key, p, &current[p]).await,
            Step::Update(p) => target.update(cancel, key, p, &current[p], &desired[p]).await,
            Step::Create(p) => target.create(cancel, key, p, &desired[p]).await,
        };
        if let Err(source) = outcome {
            return Err(ReconcileError::Step {
                step,
                applied: applied.len(),
                planned,
                source,
            });
        }
        tracing::info!(key, %step, "reconcile step applied");
        applied.push(step);
    }

    Ok(ReconcileReport { applied, unchanged })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Error)]
    #[error("injected failure at {0}")]
    struct Injected(Step);

    /// In-memory list enforcing the positional contract.
    #[derive(Default)]
    struct ListTarget {
        items: Mutex<Vec<u32>>,
        log: Mutex<Vec<Step>>,
        fail_on: Option<Step>,
    }

    impl ListTarget {
        fn with(items: &[u32]) -> Self {
            Self {
                items: Mutex::new(items.to_vec()),
                ..Self::default()
            }
        }

        fn record(&self, step: Step) -> Result<(), Injected> {
            if self.fail_on == Some(step) {
                return Err(Injected(step));
            }
            self.log.lock().unwrap().push(step);
            Ok(())
        }

        fn items(&self) -> Vec<u32> {
            self.items.lock().unwrap().clone()
        }

        fn log(&self) -> Vec<Step> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PositionalTarget for ListTarget {
        type Item = u32;
        type Error = Injected;

        async fn create(&self, _: &CancellationToken, _: &str, position: usize, desired: &u32) -> Result<(), Injected> {
            self.record(Step::Create(position))?;
            let mut items = self.items.lock().unwrap();
            assert_eq!(position, items.len(), "create must append");
            items.push(*desired);
            Ok(())
        }

        async fn update(&self, _: &CancellationToken, _: &str, position: usize, current: &u32, desired: &u32) -> Result<(), Injected> {
            self.record(Step::Update(position))?;
            let mut items = self.items.lock().unwrap();
            assert_eq!(items[position], *current);
            items[position] = *desired;
            Ok(())
        }

        async fn delete(&self, _: &CancellationToken, _: &str, position: usize, current: &u32) -> Result<(), Injected> {
            self.record(Step::Delete(position))?;
            let mut items = self.items.lock().unwrap();
            assert_eq!(position + 1, items.len(), "delete must remove the tail");
            assert_eq!(items.pop(), Some(*current));
            Ok(())
        }
    }

    fn list(len: usize, salt: u32) -> Vec<u32> {
        (0..len).map(|i| u32::try_from(i).unwrap() * 10 + salt * (u32::try_from(i).unwrap() % 2)).collect()
    }

    #[tokio::test]
    async fn converges_for_every_length_pair() {
        for n in 0..=6 {
            for m in 0..=6 {
                let current = list(n, 0);
                let desired = list(m, 1);
                let target = ListTarget::with(&current);

                let report = reconcile(&target, &CancellationToken::new(), "vm", &current, &desired)
                    .await
                    .unwrap();

                assert_eq!(target.items(), desired, "{n} -> {m}");
                assert_eq!(report.applied, target.log());

                let deletes: Vec<usize> = report
                    .applied
                    .iter()
                    .filter_map(|s| match s {
                        Step::Delete(p) => Some(*p),
                        _ => None,
                    })
                    .collect();
                assert!(deletes.iter().all(|&p| p >= m));
                assert!(deletes.windows(2).all(|w| w[0] > w[1]));
            }
        }
    }

    #[tokio::test]
    async fn identical_lists_need_nothing() {
        for n in 0..=5 {
            let items = list(n, 3);
            let target = ListTarget::with(&items);
            let report = reconcile(&target, &CancellationToken::new(), "vm", &items, &items)
                .await
                .unwrap();
            assert!(report.applied.is_empty());
            assert_eq!(report.unchanged, n);
        }
    }

    #[test]
    fn shrinking_disks_deletes_tail_then_updates() {
        assert_eq!(
            plan(&[100, 200, 300], &[150]),
            vec![Step::Delete(2), Step::Delete(1), Step::Update(0)]
        );
        assert_eq!(plan(&[100, 200, 300], &[100]), vec![Step::Delete(2), Step::Delete(1)]);
    }

    #[test]
    fn full_overlap_is_considered() {
        assert_eq!(
            plan(&[1, 2, 3], &[1, 5, 6, 7]),
            vec![Step::Update(1), Step::Update(2), Step::Create(3)]
        );
        assert_eq!(plan(&[1, 2], &[3, 4]), vec![Step::Update(0), Step::Update(1)]);
    }

    #[tokio::test]
    async fn failure_stops_remaining_steps() {
        let current = [1, 2, 3];
        let desired = [9];
        let target = ListTarget {
            fail_on: Some(Step::Delete(1)),
            ..ListTarget::with(&current)
        };

        let err = reconcile(&target, &CancellationToken::new(), "vm", &current, &desired)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Step { step: Step::Delete(1), applied: 1, planned: 3, .. }
        ));
        assert_eq!(target.items(), vec![1, 2]);
        assert_eq!(target.log(), vec![Step::Delete(2)]);
    }

    #[tokio::test]
    async fn cancelled_token_applies_nothing() {
        let target = ListTarget::with(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reconcile(&target, &cancel, "vm", &[], &[1, 2]).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled { applied: 0, planned: 2 }));
        assert!(target.items().is_empty());
    }

    #[test]
    fn steps_serialize_with_their_position() {
        assert_eq!(
            serde_json::to_string(&Step::Delete(2)).unwrap(),
            r#"{"op":"delete","position":2}"#
        );
    }
}
