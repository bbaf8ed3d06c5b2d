//! Execution mode controller.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::env::JitPolicy;
use crate::error::ModeTransitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Eager,
    Compiled,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Eager => f.write_str("eager"),
            ExecutionMode::Compiled => f.write_str("compiled"),
        }
    }
}

/// Tracks the default execution mode and how many region calls are on a call stack.
///
/// The mode and the in-flight counter share one lock so a transition can never interleave
/// with a region entering or leaving.
#[derive(Debug)]
pub struct ExecutionModeController {
    policy: JitPolicy,
    state: Mutex<ControllerState>,
}

#[derive(Debug)]
struct ControllerState {
    mode: ExecutionMode,
    in_flight: usize,
}

impl ExecutionModeController {
    pub fn new(policy: JitPolicy) -> Self {
        let mode = match policy {
            JitPolicy::ForceCompiled => ExecutionMode::Compiled,
            JitPolicy::ForceEager | JitPolicy::PerRegion => ExecutionMode::Eager,
        };
        Self {
            policy,
            state: Mutex::new(ControllerState { mode, in_flight: 0 }),
        }
    }

    pub fn policy(&self) -> JitPolicy {
        self.policy
    }

    /// Current default mode.
    pub fn mode(&self) -> ExecutionMode {
        self.state.lock().mode
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Mode for one region call: a forced policy wins, then the per-call override, then the
    /// region annotation, then the default.
    pub fn resolve(
        &self,
        call_override: Option<ExecutionMode>,
        annotation: Option<ExecutionMode>,
    ) -> ExecutionMode {
        match self.policy {
            JitPolicy::ForceCompiled => ExecutionMode::Compiled,
            JitPolicy::ForceEager => ExecutionMode::Eager,
            JitPolicy::PerRegion => call_override
                .or(annotation)
                .unwrap_or_else(|| self.mode()),
        }
    }

    /// Changes the default mode.
    pub fn transition(&self, to: ExecutionMode) -> Result<(), ModeTransitionError> {
        let pinned = match self.policy {
            JitPolicy::ForceCompiled => Some(ExecutionMode::Compiled),
            JitPolicy::ForceEager => Some(ExecutionMode::Eager),
            JitPolicy::PerRegion => None,
        };
        if let Some(mode) = pinned {
            if mode != to {
                return Err(ModeTransitionError::Pinned {
                    policy: self.policy,
                    requested: to,
                });
            }
        }

        let mut state = self.state.lock();
        if state.in_flight > 0 {
            return Err(ModeTransitionError::RegionInFlight {
                from: state.mode,
                to,
                in_flight: state.in_flight,
            });
        }
        if state.mode != to {
            tracing::debug!(from = %state.mode, to = %to, "execution mode transition");
            state.mode = to;
        }
        Ok(())
    }

    /// Marks a region call as in flight until the returned guard drops.
    pub fn enter_region(&self) -> RegionGuard<'_> {
        self.state.lock().in_flight += 1;
        RegionGuard { controller: self }
    }
}

/// RAII marker for an in-flight region call.
pub struct RegionGuard<'a> {
    controller: &'a ExecutionModeController,
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_mode_follows_policy() {
        assert_eq!(
            ExecutionModeController::new(JitPolicy::ForceCompiled).mode(),
            ExecutionMode::Compiled
        );
        assert_eq!(
            ExecutionModeController::new(JitPolicy::ForceEager).mode(),
            ExecutionMode::Eager
        );
        assert_eq!(
            ExecutionModeController::new(JitPolicy::PerRegion).mode(),
            ExecutionMode::Eager
        );
    }

    #[test]
    fn forced_policy_wins_over_overrides() {
        let forced = ExecutionModeController::new(JitPolicy::ForceCompiled);
        assert_eq!(
            forced.resolve(Some(ExecutionMode::Eager), Some(ExecutionMode::Eager)),
            ExecutionMode::Compiled
        );
        let eager = ExecutionModeController::new(JitPolicy::ForceEager);
        assert_eq!(
            eager.resolve(Some(ExecutionMode::Compiled), Some(ExecutionMode::Compiled)),
            ExecutionMode::Eager
        );
    }

    #[test]
    fn per_region_resolution_order() {
        let controller = ExecutionModeController::new(JitPolicy::PerRegion);
        assert_eq!(
            controller.resolve(Some(ExecutionMode::Eager), Some(ExecutionMode::Compiled)),
            ExecutionMode::Eager
        );
        assert_eq!(
            controller.resolve(None, Some(ExecutionMode::Compiled)),
            ExecutionMode::Compiled
        );
        assert_eq!(controller.resolve(None, None), ExecutionMode::Eager);
        controller.transition(ExecutionMode::Compiled).unwrap();
        assert_eq!(controller.resolve(None, None), ExecutionMode::Compiled);
    }

    #[test]
    fn transition_rejected_while_region_in_flight() {
        let controller = ExecutionModeController::new(JitPolicy::PerRegion);
        {
            let _guard = controller.enter_region();
            assert_eq!(controller.in_flight(), 1);
            let err = controller.transition(ExecutionMode::Compiled).unwrap_err();
            assert_eq!(
                err,
                ModeTransitionError::RegionInFlight {
                    from: ExecutionMode::Eager,
                    to: ExecutionMode::Compiled,
                    in_flight: 1,
                }
            );
        }
        assert_eq!(controller.in_flight(), 0);
        controller.transition(ExecutionMode::Compiled).unwrap();
        assert_eq!(controller.mode(), ExecutionMode::Compiled);
    }

    #[test]
    fn pinned_policy_rejects_other_mode() {
        let controller = ExecutionModeController::new(JitPolicy::ForceEager);
        assert!(matches!(
            controller.transition(ExecutionMode::Compiled),
            Err(ModeTransitionError::Pinned { .. })
        ));
        controller.transition(ExecutionMode::Eager).unwrap();
    }
}
