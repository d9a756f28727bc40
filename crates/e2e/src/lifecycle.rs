//! Per-scenario lifecycle state machine
//!
//! ```text
//! Detecting ──Detected──▶ SetupAttempt(1, m)
//!                          │   ▲  ConnectivityFailed (attempt 1 only) ─▶ SetupAttempt(1, fallback)
//!          SetupSucceeded  │   │  SetupFailed / ValidationFailed, n < max
//!                          ▼   │
//!                     Validating(n, m) ──ValidationPassed──▶ Attached(m)
//!                                                             │ ScenarioFinished
//!                                                             ▼
//!                                   Done ◀──CleanupFinished── CleaningUp(m)
//!
//! SetupFailed / ValidationFailed with n == max, or a non-recoverable
//! failure, moves to Aborted.
//! ```
//!
//! Transitions are pure; the orchestrator owns the side effects.

use serde::{Deserialize, Serialize};
use std::fmt;

use fieldsvc_common::TestMode;

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Detecting,
    SetupAttempt { attempt: u32, mode: TestMode },
    Validating { attempt: u32, mode: TestMode },
    Attached { mode: TestMode },
    CleaningUp { mode: TestMode },
    Done,
    Aborted { attempts: u32, final_mode: TestMode },
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Done | LifecycleState::Aborted { .. })
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Detecting => write!(f, "detecting"),
            LifecycleState::SetupAttempt { attempt, mode } => write!(f, "setup({}, {})", attempt, mode),
            LifecycleState::Validating { attempt, mode } => write!(f, "validating({}, {})", attempt, mode),
            LifecycleState::Attached { mode } => write!(f, "attached({})", mode),
            LifecycleState::CleaningUp { mode } => write!(f, "cleaning_up({})", mode),
            LifecycleState::Done => write!(f, "done"),
            LifecycleState::Aborted { attempts, final_mode } => {
                write!(f, "aborted({}, {})", attempts, final_mode)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
pub enum LifecycleInput {
    Detected { mode: TestMode },
    ConnectivityFailed { fallback: Option<TestMode> },
    SetupSucceeded,
    SetupFailed { fallback: Option<TestMode>, recoverable: bool },
    ValidationPassed,
    ValidationFailed { fallback: Option<TestMode> },
    ScenarioFinished,
    CleanupFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleMachine {
    max_attempts: u32,
}

impl LifecycleMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn transition(&self, state: LifecycleState, input: LifecycleInput) -> E2eResult<LifecycleState> {
        use LifecycleInput as I;
        use LifecycleState as S;

        let next = match (state, input) {
            (S::Detecting, I::Detected { mode }) => S::SetupAttempt { attempt: 1, mode },

            (S::SetupAttempt { attempt: 1, mode }, I::ConnectivityFailed { fallback }) => S::SetupAttempt {
                attempt: 1,
                mode: fallback.unwrap_or(mode),
            },

            (S::SetupAttempt { attempt, mode }, I::SetupSucceeded) => S::Validating { attempt, mode },

            (S::SetupAttempt { attempt, mode }, I::SetupFailed { fallback, recoverable }) => {
                if recoverable {
                    self.retry_or_abort(attempt, mode, fallback)
                } else {
                    S::Aborted {
                        attempts: attempt,
                        final_mode: mode,
                    }
                }
            }

            (S::Validating { mode, .. }, I::ValidationPassed) => S::Attached { mode },

            (S::Validating { attempt, mode }, I::ValidationFailed { fallback }) => {
                self.retry_or_abort(attempt, mode, fallback)
            }

            (S::Attached { mode }, I::ScenarioFinished) => S::CleaningUp { mode },

            (S::CleaningUp { .. }, I::CleanupFinished) => S::Done,

            (state, input) => {
                return Err(E2eError::InvalidTransition {
                    from: state.to_string(),
                    input: format!("{:?}", input),
                })
            }
        };
        Ok(next)
    }

    fn retry_or_abort(&self, attempt: u32, mode: TestMode, fallback: Option<TestMode>) -> LifecycleState {
        if attempt >= self.max_attempts {
            LifecycleState::Aborted {
                attempts: attempt,
                final_mode: mode,
            }
        } else {
            LifecycleState::SetupAttempt {
                attempt: attempt + 1,
                mode: fallback.unwrap_or(mode),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleInput as I;
    use LifecycleState as S;

    #[test]
    fn test_happy_path() {
        let m = LifecycleMachine::new(3);
        let mut state = S::Detecting;
        for input in [
            I::Detected { mode: TestMode::Dual },
            I::SetupSucceeded,
            I::ValidationPassed,
            I::ScenarioFinished,
            I::CleanupFinished,
        ] {
            state = m.transition(state, input).unwrap();
        }
        assert_eq!(state, S::Done);
    }

    #[test]
    fn test_fallback_then_abort_after_max_attempts() {
        let m = LifecycleMachine::new(3);
        let mut state = m
            .transition(S::Detecting, I::Detected { mode: TestMode::Production })
            .unwrap();

        let failed = I::SetupFailed {
            fallback: Some(TestMode::Isolated),
            recoverable: true,
        };
        state = m.transition(state, failed).unwrap();
        assert_eq!(state, S::SetupAttempt { attempt: 2, mode: TestMode::Isolated });

        state = m.transition(state, I::SetupFailed { fallback: None, recoverable: true }).unwrap();
        state = m.transition(state, I::SetupFailed { fallback: None, recoverable: true }).unwrap();
        assert_eq!(
            state,
            S::Aborted {
                attempts: 3,
                final_mode: TestMode::Isolated
            }
        );
        assert!(state.is_terminal());
    }

    #[test]
    fn test_connectivity_fallback_keeps_first_attempt() {
        let m = LifecycleMachine::new(3);
        let state = S::SetupAttempt { attempt: 1, mode: TestMode::Production };
        let next = m
            .transition(state, I::ConnectivityFailed { fallback: Some(TestMode::Isolated) })
            .unwrap();
        assert_eq!(next, S::SetupAttempt { attempt: 1, mode: TestMode::Isolated });

        let later = S::SetupAttempt { attempt: 2, mode: TestMode::Production };
        assert!(m.transition(later, I::ConnectivityFailed { fallback: None }).is_err());
    }

    #[test]
    fn test_unrecoverable_failure_aborts_immediately() {
        let m = LifecycleMachine::new(3);
        let state = S::SetupAttempt { attempt: 1, mode: TestMode::Isolated };
        let next = m
            .transition(state, I::SetupFailed { fallback: None, recoverable: false })
            .unwrap();
        assert_eq!(next, S::Aborted { attempts: 1, final_mode: TestMode::Isolated });
    }

    #[test]
    fn test_validation_failure_retries() {
        let m = LifecycleMachine::new(2);
        let state = S::Validating { attempt: 1, mode: TestMode::Dual };
        let next = m
            .transition(state, I::ValidationFailed { fallback: Some(TestMode::Isolated) })
            .unwrap();
        assert_eq!(next, S::SetupAttempt { attempt: 2, mode: TestMode::Isolated });
    }

    #[test]
    fn test_done_accepts_nothing() {
        let m = LifecycleMachine::new(3);
        assert!(m.transition(S::Done, I::ScenarioFinished).is_err());
        assert!(m.transition(S::Detecting, I::SetupSucceeded).is_err());
    }
}
