//! Lifecycle events
//!
//! The orchestrator reports every decision it makes as a [`LifecycleEvent`].
//! The default observer turns them into structured `tracing` records; tests
//! record them for assertions.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use fieldsvc_common::TestMode;

use crate::mode::DetectionSource;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ModeDetected {
        test_id: String,
        mode: TestMode,
        confidence: f64,
        source: DetectionSource,
        fallback_reason: Option<String>,
    },
    ConnectivityFallback {
        test_id: String,
        from: TestMode,
        to: TestMode,
        issues: Vec<String>,
    },
    SetupAttempt {
        test_id: String,
        attempt: u32,
        mode: TestMode,
    },
    SetupFailed {
        test_id: String,
        attempt: u32,
        mode: TestMode,
        error: String,
    },
    ValidationFailed {
        test_id: String,
        attempt: u32,
        mode: TestMode,
        issues: Vec<String>,
    },
    RetryScheduled {
        test_id: String,
        next_attempt: u32,
        mode: TestMode,
        delay_ms: u64,
    },
    ContextAttached {
        test_id: String,
        mode: TestMode,
        test_run_id: String,
        attempts: u32,
    },
    SetupAborted {
        test_id: String,
        original_mode: TestMode,
        final_mode: TestMode,
        attempts: u32,
        error: String,
    },
    SafetyViolation {
        test_id: String,
        mode: TestMode,
        error: String,
    },
    CleanupCompleted {
        test_id: String,
        mode: TestMode,
        test_run_id: String,
        tasks: usize,
    },
    CleanupSkipped {
        test_id: String,
    },
    CleanupFailed {
        test_id: String,
        mode: TestMode,
        error: String,
    },
    RosterEnsured {
        created: usize,
    },
    OrphansReclaimed {
        runs: usize,
        entities: usize,
    },
    EmergencySweep {
        contexts: usize,
    },
}

pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

/// Structured log output
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::ModeDetected {
                test_id,
                mode,
                confidence,
                source,
                fallback_reason,
            } => match fallback_reason {
                Some(reason) => warn!(%test_id, %mode, confidence, %source, "Mode fallback: {}", reason),
                None => info!(%test_id, %mode, confidence, %source, "Mode detected"),
            },
            LifecycleEvent::ConnectivityFallback { test_id, from, to, issues } => {
                warn!(%test_id, %from, %to, "Connectivity check failed: {}", issues.join("; "))
            }
            LifecycleEvent::SetupAttempt { test_id, attempt, mode } => {
                info!(%test_id, attempt, %mode, "Setting up data context")
            }
            LifecycleEvent::SetupFailed { test_id, attempt, mode, error } => {
                warn!(%test_id, attempt, %mode, "Setup failed: {}", error)
            }
            LifecycleEvent::ValidationFailed { test_id, attempt, mode, issues } => {
                warn!(%test_id, attempt, %mode, "Context validation failed: {}", issues.join("; "))
            }
            LifecycleEvent::RetryScheduled { test_id, next_attempt, mode, delay_ms } => {
                info!(%test_id, next_attempt, %mode, delay_ms, "Retrying setup")
            }
            LifecycleEvent::ContextAttached { test_id, mode, test_run_id, attempts } => {
                info!(%test_id, %mode, %test_run_id, attempts, "Data context attached")
            }
            LifecycleEvent::SetupAborted {
                test_id,
                original_mode,
                final_mode,
                attempts,
                error,
            } => error!(
                %test_id,
                %original_mode,
                %final_mode,
                attempts,
                "Giving up on data context: {}",
                error
            ),
            LifecycleEvent::SafetyViolation { test_id, mode, error } => {
                error!(%test_id, %mode, "{}", error)
            }
            LifecycleEvent::CleanupCompleted { test_id, mode, test_run_id, tasks } => {
                info!(%test_id, %mode, %test_run_id, tasks, "Data context cleaned")
            }
            LifecycleEvent::CleanupSkipped { test_id } => {
                info!(%test_id, "No data context to clean")
            }
            LifecycleEvent::CleanupFailed { test_id, mode, error } => {
                error!(%test_id, %mode, "Cleanup failed: {}", error)
            }
            LifecycleEvent::RosterEnsured { created } => info!(created, "Roster ensured"),
            LifecycleEvent::OrphansReclaimed { runs, entities } => {
                info!(runs, entities, "Orphaned runs reclaimed")
            }
            LifecycleEvent::EmergencySweep { contexts } => {
                warn!(contexts, "Emergency cleanup of leftover contexts")
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}
