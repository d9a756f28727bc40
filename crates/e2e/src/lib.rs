//! Field-service test-data lifecycle
//!
//! This crate decides, per browser scenario, which data environment the
//! scenario runs against and owns that environment's lifecycle:
//! - Detects the mode from Gherkin tags and the `TEST_MODE` override
//! - Restores a snapshot database for isolated scenarios
//! - Seeds and shares a marked roster for production scenarios
//! - Retries setup with linear backoff and falls back to isolated mode
//! - Guarantees exactly-once teardown, even when the scenario panics
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                ScenarioRunner (hooks + bodies)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ContextLifecycleOrchestrator                               │
//! │    ├── before_all()          roster seed, orphan sweep      │
//! │    ├── before_scenario(ctx)  -> DataContext                 │
//! │    │     ├── ModeDetector    tags > TEST_MODE > isolated    │
//! │    │     ├── probe, setup, validate, retry/fallback         │
//! │    │     └── ModeFailureReport on abort                     │
//! │    ├── after_scenario(id)    exactly-once cleanup           │
//! │    └── after_all()           emergency sweep                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ContextManager                                             │
//! │    ├── DatabaseContextManager     snapshot restore/reset    │
//! │    └── ProductionTestDataManager  roster upsert, derived    │
//! │                                   cleanup, safety guard     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BackupProvider / ProductionDataStore (SQLite)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cleanup;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod events;
pub mod isolation;
pub mod lifecycle;
pub mod mode;
pub mod orchestrator;
pub mod production;
pub mod registry;
pub mod report;
pub mod runner;
pub mod safety;
pub mod spec;
pub mod store;

pub use cleanup::{CleanupQueue, CleanupReport, CleanupTask, CleanupTaskType};
pub use config::{
    CleanupPolicy, DatabaseConfig, EnvSource, LifecycleConfig, ProcessEnv, ProductionConfig, ResetPolicy,
    TagConflictPolicy, TestConfig,
};
pub use context::{CleanupOutcome, ConnectionInfo, ContextManager, DataContext};
pub use database::DatabaseContextManager;
pub use error::{E2eError, E2eResult};
pub use events::{LifecycleEvent, LifecycleObserver, RecordingObserver, TracingObserver};
pub use isolation::IsolationManager;
pub use lifecycle::{LifecycleInput, LifecycleMachine, LifecycleState};
pub use mode::{DetectionSource, ModeDetectionResult, ModeDetector, TestContext};
pub use orchestrator::ContextLifecycleOrchestrator;
pub use production::ProductionTestDataManager;
pub use report::{ModeFailureReport, ModeFailureReporter};
pub use runner::{RunnerConfig, ScenarioBody, ScenarioResult, ScenarioRunner, SuiteResult};
pub use safety::{OperationKind, ProductionSafetyValidator};
pub use spec::ScenarioSpec;
pub use store::{BackupProvider, ProductionDataStore, SqliteBackupProvider, SqliteProductionStore};

/// Install the `tracing` subscriber used by the lifecycle harness.
///
/// Honors `RUST_LOG`; defaults to `info`. Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
