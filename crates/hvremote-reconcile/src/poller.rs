//! Polling convergence toward a desired remote state.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a sampled state relates to progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    /// Moving on its own; sample again later.
    Transitional,
    /// Stable. Either the desired state or one a corrective action can
    /// leave.
    Terminal,
    /// Stuck in a way only an operator can fix.
    RequiresManualIntervention,
}

/// States that can classify themselves.
pub trait Classify {
    fn classify(&self) -> StateClass;
}

/// A remote resource whose state can be sampled and nudged.
#[async_trait]
pub trait ConvergenceTarget: Send + Sync {
    type State: Classify + PartialEq + fmt::Debug + Send + Sync;
    type Action: fmt::Debug + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sample the current state.
    async fn observe(&self, cancel: &CancellationToken) -> Result<Self::State, Self::Error>;

    /// Action moving a terminal `current` state toward `desired`, if any.
    fn corrective_action(&self, current: &Self::State, desired: &Self::State)
    -> Option<Self::Action>;

    /// Apply a corrective action.
    async fn apply(
        &self,
        cancel: &CancellationToken,
        action: &Self::Action,
    ) -> Result<(), Self::Error>;

    /// Whether `current` satisfies `desired`.
    fn reached(&self, current: &Self::State, desired: &Self::State) -> bool {
        current == desired
    }
}

/// Bounds of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOptions {
    #[serde(with = "hvremote_core::duration_secs")]
    pub timeout: Duration,
    #[serde(with = "hvremote_core::duration_secs")]
    pub poll_period: Duration,
}

impl WaitOptions {
    /// Options from durations.
    #[must_use]
    pub const fn new(timeout: Duration, poll_period: Duration) -> Self {
        Self {
            timeout,
            poll_period,
        }
    }

    /// Options from whole seconds.
    #[must_use]
    pub const fn from_secs(timeout: u64, poll_period: u64) -> Self {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(poll_period))
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from_secs(300, 5)
    }
}

/// Convergence error.
#[derive(Debug, Error)]
pub enum ConvergeError<S, E> {
    #[error("Timed out after {waited:?}; last state {last:?}")]
    Timeout { waited: Duration, last: Option<S> },
    #[error("State {0:?} requires manual intervention")]
    ManualIntervention(S),
    #[error("No action leads from {current:?} to {desired:?}")]
    Unreachable { current: S, desired: S },
    #[error("Still in {current:?} after corrective action toward {desired:?}")]
    Diverged { current: S, desired: S },
    #[error("Failed to observe state: {0}")]
    Observe(#[source] E),
    #[error("Corrective action {action} failed: {source}")]
    Correct {
        action: String,
        #[source]
        source: E,
    },
    #[error("Wait cancelled")]
    Cancelled,
}

/// Poll `target` until it reaches `desired`.
///
/// Transitional states are waited out. A terminal state other than the
/// desired one triggers exactly one corrective action; meeting a terminal
/// mismatch again afterwards fails with `Diverged`. A hung observation or
/// action is abandoned one poll period past the deadline.
///
/// # Errors
/// Returns error on timeout, cancellation, a state needing manual
/// intervention, a mismatch with no corrective action, a repeated mismatch,
/// or a failure to observe or correct.
pub async fn wait_for_state<T: ConvergenceTarget + ?Sized>(
    target: &T,
    cancel: &CancellationToken,
    desired: T::State,
    options: WaitOptions,
) -> Result<T::State, ConvergeError<T::State, T::Error>> {
    let started = Instant::now();
    let deadline = started + options.timeout;
    let limit = deadline + options.poll_period;
    let mut corrected = false;
    let mut last = None;

    loop {
        let observed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ConvergeError::Cancelled),
            observed = tokio::time::timeout_at(limit, target.observe(cancel)) => observed,
        };
        let Ok(state) = observed else {
            tracing::warn!(elapsed = ?started.elapsed(), "observation overran the deadline");
            return Err(ConvergeError::Timeout {
                waited: started.elapsed(),
                last,
            });
        };
        let state = state.map_err(ConvergeError::Observe)?;
        if target.reached(&state, &desired) {
            tracing::debug!(?state, elapsed = ?started.elapsed(), "desired state reached");
            return Ok(state);
        }

        match state.classify() {
            StateClass::RequiresManualIntervention => {
                return Err(ConvergeError::ManualIntervention(state));
            }
            StateClass::Terminal if corrected => {
                return Err(ConvergeError::Diverged {
                    current: state,
                    desired,
                });
            }
            StateClass::Terminal => {
                let Some(action) = target.corrective_action(&state, &desired) else {
                    return Err(ConvergeError::Unreachable {
                        current: state,
                        desired,
                    });
                };
                tracing::info!(?state, ?desired, ?action, "applying corrective action");
                let Ok(applied) = tokio::time::timeout_at(limit, target.apply(cancel, &action)).await
                else {
                    tracing::warn!(?action, "corrective action overran the deadline");
                    return Err(ConvergeError::Timeout {
                        waited: started.elapsed(),
                        last: Some(state),
                    });
                };
                applied.map_err(|source| ConvergeError::Correct {
                    action: format!("{action:?}"),
                    source,
                })?;
                corrected = true;
            }
            StateClass::Transitional => {
                tracing::debug!(?state, "waiting for transition");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ConvergeError::Timeout {
                waited: now - started,
                last: Some(state),
            });
        }
        let pause = options.poll_period.min(deadline - now);
        last = Some(state);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ConvergeError::Cancelled),
            () = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, sync::Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Off,
        Warming,
        On,
        Broken,
    }

    impl Classify for Light {
        fn classify(&self) -> StateClass {
            match self {
                Self::Off | Self::On => StateClass::Terminal,
                Self::Warming => StateClass::Transitional,
                Self::Broken => StateClass::RequiresManualIntervention,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Switch {
        Flip,
    }

    #[derive(Debug, Error)]
    #[error("bulb unreachable")]
    struct Unreachable;

    /// Replays scripted observations; the last one repeats.
    struct Lamp {
        states: Mutex<VecDeque<Light>>,
        applied: Mutex<Vec<Switch>>,
        offer_action: bool,
        delay: Duration,
    }

    impl Lamp {
        fn new(states: &[Light]) -> Self {
            Self {
                states: Mutex::new(states.iter().copied().collect()),
                applied: Mutex::new(Vec::new()),
                offer_action: true,
                delay: Duration::ZERO,
            }
        }

        fn applied(&self) -> Vec<Switch> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConvergenceTarget for Lamp {
        type State = Light;
        type Action = Switch;
        type Error = Unreachable;

        async fn observe(&self, _: &CancellationToken) -> Result<Light, Unreachable> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                states.pop_front().ok_or(Unreachable)
            } else {
                states.front().copied().ok_or(Unreachable)
            }
        }

        fn corrective_action(&self, current: &Light, desired: &Light) -> Option<Switch> {
            (self.offer_action && current != desired).then_some(Switch::Flip)
        }

        async fn apply(&self, _: &CancellationToken, action: &Switch) -> Result<(), Unreachable> {
            self.applied.lock().unwrap().push(*action);
            Ok(())
        }
    }

    fn fast() -> WaitOptions {
        WaitOptions::new(Duration::from_millis(500), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn waits_out_transitions() {
        let lamp = Lamp::new(&[Light::Warming, Light::Warming, Light::On]);
        let state = wait_for_state(&lamp, &CancellationToken::new(), Light::On, fast())
            .await
            .unwrap();
        assert_eq!(state, Light::On);
        assert!(lamp.applied().is_empty());
    }

    #[tokio::test]
    async fn corrects_a_terminal_mismatch_once() {
        let lamp = Lamp::new(&[Light::Off, Light::Warming, Light::On]);
        wait_for_state(&lamp, &CancellationToken::new(), Light::On, fast())
            .await
            .unwrap();
        assert_eq!(lamp.applied(), vec![Switch::Flip]);
    }

    #[tokio::test]
    async fn repeated_mismatch_diverges() {
        let lamp = Lamp::new(&[Light::Off, Light::Warming, Light::Off]);
        let err = wait_for_state(&lamp, &CancellationToken::new(), Light::On, fast())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Diverged { current: Light::Off, desired: Light::On }));
        assert_eq!(lamp.applied(), vec![Switch::Flip]);
    }

    #[tokio::test]
    async fn no_action_is_unreachable() {
        let lamp = Lamp {
            offer_action: false,
            ..Lamp::new(&[Light::Off])
        };
        let err = wait_for_state(&lamp, &CancellationToken::new(), Light::On, fast())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn manual_intervention_is_reported() {
        let lamp = Lamp::new(&[Light::Warming, Light::Broken]);
        let err = wait_for_state(&lamp, &CancellationToken::new(), Light::On, fast())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::ManualIntervention(Light::Broken)));
    }

    #[tokio::test]
    async fn timeout_is_bounded_by_one_period() {
        let lamp = Lamp::new(&[Light::Warming]);
        let options = WaitOptions::new(Duration::from_millis(60), Duration::from_millis(20));
        let started = std::time::Instant::now();

        let err = wait_for_state(&lamp, &CancellationToken::new(), Light::On, options)
            .await
            .unwrap_err();

        assert!(matches!(err, ConvergeError::Timeout { last: Some(Light::Warming), .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < options.timeout + options.poll_period + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn slow_observation_still_times_out() {
        let lamp = Lamp {
            delay: Duration::from_millis(800),
            ..Lamp::new(&[Light::Warming])
        };
        let options = WaitOptions::new(Duration::from_millis(50), Duration::from_millis(10));
        let started = std::time::Instant::now();

        let err = wait_for_state(&lamp, &CancellationToken::new(), Light::On, options)
            .await
            .unwrap_err();

        assert!(matches!(err, ConvergeError::Timeout { last: None, .. }));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_sleep() {
        let lamp = Lamp::new(&[Light::Warming]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let options = WaitOptions::new(Duration::from_secs(60), Duration::from_secs(30));
        let err = wait_for_state(&lamp, &cancel, Light::On, options).await.unwrap_err();
        assert!(matches!(err, ConvergeError::Cancelled));
    }

    #[test]
    fn options_use_whole_seconds() {
        let options: WaitOptions = serde_json::from_str(r#"{"timeout": 120, "poll_period": 3}"#).unwrap();
        assert_eq!(options, WaitOptions::from_secs(120, 3));
    }
}
