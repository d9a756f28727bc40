//! Scenario lifecycle orchestration
//!
//! Maps the runner's hooks onto the context managers:
//!
//! - `before_all`: seed the roster, reclaim orphaned runs
//! - `before_scenario`: detect, probe, set up, validate, retry with fallback
//! - `after_scenario`: tear down exactly once, never fail the scenario
//!   (`Attached -> CleaningUp -> Done`)
//! - `after_all`: sweep whatever is still registered

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fieldsvc_common::TestMode;

use crate::config::{EnvSource, LifecycleConfig, ProcessEnv, TestConfig};
use crate::context::{cleanup_quietly, CleanupOutcome, ContextManager, DataContext};
use crate::database::DatabaseContextManager;
use crate::error::{E2eError, E2eResult};
use crate::events::{LifecycleEvent, LifecycleObserver, TracingObserver};
use crate::isolation::{IsolationManager, OrphanSweep};
use crate::lifecycle::{LifecycleInput, LifecycleMachine, LifecycleState};
use crate::mode::{ConnectivityProbe, ModeDetectionResult, ModeDetector, TestContext};
use crate::production::ProductionTestDataManager;
use crate::registry::{ContextRegistry, Reservation};
use crate::report::ModeFailureReporter;
use crate::store::{AllProbes, HttpHealthProbe, SnapshotProbe, SqliteBackupProvider, SqliteProductionStore, StoreProbe};

pub struct ContextLifecycleOrchestrator {
    config: LifecycleConfig,
    detector: ModeDetector,
    database: Option<Arc<DatabaseContextManager>>,
    production: Option<Arc<ProductionTestDataManager>>,
    registry: ContextRegistry,
    observer: Arc<dyn LifecycleObserver>,
    machine: LifecycleMachine,
}

impl ContextLifecycleOrchestrator {
    /// Bare orchestrator; attach managers and a detector before use
    pub fn new(config: LifecycleConfig) -> Self {
        let detector = ModeDetector::new()
            .conflict_policy(config.tag_conflict_policy)
            .probe_timeout(config.connectivity_timeout());
        Self {
            machine: LifecycleMachine::new(config.max_setup_attempts),
            config,
            detector,
            database: None,
            production: None,
            registry: ContextRegistry::new(),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Wire SQLite-backed managers and probes for every configured section
    pub fn from_config(config: LifecycleConfig, env: Arc<dyn EnvSource>) -> E2eResult<Self> {
        let mut detector = ModeDetector::with_env(env)
            .conflict_policy(config.tag_conflict_policy)
            .probe_timeout(config.connectivity_timeout());

        let database = match &config.database {
            Some(db) => {
                let provider = Arc::new(SqliteBackupProvider::new());
                detector = detector.database_probe(Arc::new(SnapshotProbe::new(provider.clone(), db.clone())));
                Some(Arc::new(DatabaseContextManager::new(provider)))
            }
            None => None,
        };

        let production = match &config.production {
            Some(p) => {
                let store = Arc::new(SqliteProductionStore::new(&p.store_path));
                let mut probes: Vec<Arc<dyn ConnectivityProbe>> = vec![Arc::new(StoreProbe::new(store.clone()))];
                if let Some(url) = &p.health_url {
                    probes.push(Arc::new(HttpHealthProbe::new(url.clone(), config.connectivity_timeout())?));
                }
                detector = detector.production_probe(Arc::new(AllProbes::new(probes)));
                Some(Arc::new(ProductionTestDataManager::new(store)))
            }
            None => None,
        };

        Ok(Self {
            machine: LifecycleMachine::new(config.max_setup_attempts),
            config,
            detector,
            database,
            production,
            registry: ContextRegistry::new(),
            observer: Arc::new(TracingObserver),
        })
    }

    /// `from_config` reading the process environment
    pub fn from_env(config: LifecycleConfig) -> E2eResult<Self> {
        let config = config.apply_env(&ProcessEnv)?;
        Self::from_config(config, Arc::new(ProcessEnv))
    }

    pub fn with_detector(mut self, detector: ModeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_database(mut self, manager: Arc<DatabaseContextManager>) -> Self {
        self.database = Some(manager);
        self
    }

    pub fn with_production(mut self, manager: Arc<ProductionTestDataManager>) -> Self {
        self.production = Some(manager);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn database(&self) -> Option<&Arc<DatabaseContextManager>> {
        self.database.as_ref()
    }

    pub fn production(&self) -> Option<&Arc<ProductionTestDataManager>> {
        self.production.as_ref()
    }

    fn emit(&self, event: LifecycleEvent) {
        self.observer.on_event(&event);
    }

    /// Manager serving `mode`. Dual prefers the snapshot database.
    pub fn manager_for(&self, mode: TestMode) -> Option<Arc<dyn ContextManager>> {
        let database = self.database.clone().map(|m| m as Arc<dyn ContextManager>);
        let production = self.production.clone().map(|m| m as Arc<dyn ContextManager>);
        match mode {
            TestMode::Isolated => database,
            TestMode::Production => production,
            TestMode::Dual => database.or(production),
        }
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Suite start. Failures here are logged; scenarios retry seeding.
    pub async fn before_all(&self) -> E2eResult<()> {
        let Some(production) = &self.production else {
            return Ok(());
        };

        match production.ensure_test_data_exists().await {
            Ok(created) => self.emit(LifecycleEvent::RosterEnsured { created }),
            Err(e @ E2eError::ProductionSafetyViolation { .. }) => return Err(e),
            Err(e) => warn!("Roster seeding deferred: {}", e),
        }

        if self.config.reclaim_orphans {
            if let Err(e) = self.reclaim_orphans().await {
                warn!("Orphan sweep failed: {}", e);
            }
        }
        Ok(())
    }

    async fn reclaim_orphans(&self) -> E2eResult<OrphanSweep> {
        let Some(production) = &self.production else {
            return Ok(OrphanSweep::default());
        };
        let mut active = self.registry.active_run_ids();
        active.extend(production.active_run_ids());

        let sweep = IsolationManager::reclaim_orphans(
            production.store().as_ref(),
            &active,
            Duration::from_secs(self.config.orphan_max_age_secs),
        )
        .await?;
        self.emit(LifecycleEvent::OrphansReclaimed {
            runs: sweep.reclaimed_runs.len(),
            entities: sweep.entities_removed,
        });
        Ok(sweep)
    }

    /// Establish and register a validated data context for one scenario.
    /// The test id is reserved before detection, so a duplicate call fails
    /// without touching any store.
    pub async fn before_scenario(&self, context: &TestContext) -> E2eResult<DataContext> {
        let reservation = self.registry.reserve(&context.test_id)?;
        self.establish(context, reservation).await
    }

    fn advance(
        &self,
        reservation: &Reservation<'_>,
        state: LifecycleState,
        input: LifecycleInput,
    ) -> E2eResult<LifecycleState> {
        let next = self.machine.transition(state, input)?;
        reservation.set_state(next);
        Ok(next)
    }

    async fn establish(&self, context: &TestContext, reservation: Reservation<'_>) -> E2eResult<DataContext> {
        let detection = self.detector.detect_mode(context)?;
        self.emit(LifecycleEvent::ModeDetected {
            test_id: context.test_id.clone(),
            mode: detection.mode,
            confidence: detection.confidence,
            source: detection.source,
            fallback_reason: detection.fallback_reason.clone(),
        });

        let original_mode = detection.mode;
        let mut state = self.advance(
            &reservation,
            LifecycleState::Detecting,
            LifecycleInput::Detected { mode: original_mode },
        )?;

        if original_mode.uses_production() {
            let report = self.detector.validate_database_connectivity(original_mode).await;
            if !report.is_valid {
                let fallback = ModeDetector::get_fallback_mode(original_mode);
                state = self.advance(&reservation, state, LifecycleInput::ConnectivityFailed { fallback })?;
                if let Some(to) = fallback {
                    self.emit(LifecycleEvent::ConnectivityFallback {
                        test_id: context.test_id.clone(),
                        from: original_mode,
                        to,
                        issues: report.issues,
                    });
                }
            }
        }

        let mut last_error: Option<E2eError> = None;
        loop {
            let (attempt, mode) = match state {
                LifecycleState::SetupAttempt { attempt, mode } => (attempt, mode),
                LifecycleState::Aborted { attempts, final_mode } => {
                    return Err(self.abort(context, &detection, attempts, final_mode, last_error));
                }
                other => {
                    return Err(E2eError::InvalidTransition {
                        from: other.to_string(),
                        input: "setup loop".to_string(),
                    })
                }
            };

            self.emit(LifecycleEvent::SetupAttempt {
                test_id: context.test_id.clone(),
                attempt,
                mode,
            });

            let fallback = ModeDetector::get_fallback_mode(mode);
            state = match self.attempt_setup(context, mode).await {
                Ok((manager, ctx)) => {
                    state = self.advance(&reservation, state, LifecycleInput::SetupSucceeded)?;
                    let issues = manager.validation_issues(&ctx);
                    if issues.is_empty() {
                        state = self.advance(&reservation, state, LifecycleInput::ValidationPassed)?;
                        debug!(test_id = %context.test_id, %state, "Lifecycle state");
                        return self.attach(reservation, manager, ctx, state, attempt).await;
                    }

                    self.emit(LifecycleEvent::ValidationFailed {
                        test_id: context.test_id.clone(),
                        attempt,
                        mode,
                        issues: issues.clone(),
                    });
                    // Roll back whatever the rejected context set up
                    manager.cleanup_context(&ctx).await;
                    last_error = Some(E2eError::Validation { mode, issues });
                    self.advance(&reservation, state, LifecycleInput::ValidationFailed { fallback })?
                }
                Err(e @ E2eError::ProductionSafetyViolation { .. }) => {
                    self.emit(LifecycleEvent::SafetyViolation {
                        test_id: context.test_id.clone(),
                        mode,
                        error: e.to_string(),
                    });
                    self.advance(
                        &reservation,
                        state,
                        LifecycleInput::SetupFailed {
                            fallback: None,
                            recoverable: false,
                        },
                    )?;
                    return Err(e);
                }
                Err(e) => {
                    self.emit(LifecycleEvent::SetupFailed {
                        test_id: context.test_id.clone(),
                        attempt,
                        mode,
                        error: e.to_string(),
                    });
                    let recoverable = e.is_retryable();
                    last_error = Some(e);
                    self.advance(
                        &reservation,
                        state,
                        LifecycleInput::SetupFailed {
                            fallback,
                            recoverable,
                        },
                    )?
                }
            };

            if let LifecycleState::SetupAttempt { attempt: next, mode: next_mode } = state {
                let delay = self.config.backoff_delay(attempt);
                self.emit(LifecycleEvent::RetryScheduled {
                    test_id: context.test_id.clone(),
                    next_attempt: next,
                    mode: next_mode,
                    delay_ms: delay.as_millis() as u64,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn attempt_setup(
        &self,
        context: &TestContext,
        mode: TestMode,
    ) -> E2eResult<(Arc<dyn ContextManager>, DataContext)> {
        let manager = self.manager_for(mode).ok_or_else(|| {
            E2eError::Configuration(format!("no context manager available for {} mode", mode))
        })?;
        let test_config = TestConfig::for_mode(mode, &context.test_id, &self.config)?;
        let ctx = manager.setup_context(mode, &test_config).await?;
        Ok((manager, ctx))
    }

    async fn attach(
        &self,
        reservation: Reservation<'_>,
        manager: Arc<dyn ContextManager>,
        ctx: DataContext,
        state: LifecycleState,
        attempts: u32,
    ) -> E2eResult<DataContext> {
        if let Err(e) = reservation.attach(ctx.clone(), state) {
            manager.cleanup_context(&ctx).await;
            return Err(e);
        }
        self.emit(LifecycleEvent::ContextAttached {
            test_id: ctx.test_id().to_string(),
            mode: ctx.mode(),
            test_run_id: ctx.test_run_id().to_string(),
            attempts,
        });
        Ok(ctx)
    }

    fn abort(
        &self,
        context: &TestContext,
        detection: &ModeDetectionResult,
        attempts: u32,
        final_mode: TestMode,
        last_error: Option<E2eError>,
    ) -> E2eError {
        let error = last_error.unwrap_or_else(|| E2eError::Setup {
            mode: final_mode,
            reason: "no setup attempt completed".to_string(),
        });
        let report = ModeFailureReporter::create_failure_report(
            context,
            detection.mode,
            final_mode,
            &error,
            detection,
        )
        .with_attempts(attempts);

        self.emit(LifecycleEvent::SetupAborted {
            test_id: context.test_id.clone(),
            original_mode: report.original_mode,
            final_mode,
            attempts,
            error: report.error.clone(),
        });
        E2eError::ModeSetupFailed(Box::new(report))
    }

    /// Tear down the scenario's context. Never fails; a missing context is
    /// a no-op.
    pub async fn after_scenario(&self, test_id: &str) -> CleanupOutcome {
        let Some((ctx, state)) = self.registry.begin_cleanup(test_id, &self.machine) else {
            self.emit(LifecycleEvent::CleanupSkipped {
                test_id: test_id.to_string(),
            });
            return CleanupOutcome::AlreadyCleaned;
        };
        let outcome = self.finish(&ctx).await;
        self.settle(&ctx, state);
        outcome
    }

    /// Lifecycle state of a scenario: live, or the state it ended in
    pub fn scenario_state(&self, test_id: &str) -> Option<LifecycleState> {
        self.registry.state(test_id)
    }

    fn settle(&self, ctx: &DataContext, state: LifecycleState) {
        let done = self
            .machine
            .transition(state, LifecycleInput::CleanupFinished)
            .unwrap_or_else(|e| {
                warn!(test_id = ctx.test_id(), "{}", e);
                LifecycleState::Done
            });
        debug!(test_id = ctx.test_id(), state = %done, "Lifecycle state");
        self.registry.complete(ctx.test_id(), done);
    }

    async fn finish(&self, ctx: &DataContext) -> CleanupOutcome {
        let outcome = cleanup_quietly(ctx).await;
        match &outcome {
            CleanupOutcome::Cleaned { report } if report.is_clean() => {
                self.emit(LifecycleEvent::CleanupCompleted {
                    test_id: ctx.test_id().to_string(),
                    mode: ctx.mode(),
                    test_run_id: ctx.test_run_id().to_string(),
                    tasks: report.completed.len(),
                })
            }
            CleanupOutcome::Cleaned { report } => self.emit(LifecycleEvent::CleanupFailed {
                test_id: ctx.test_id().to_string(),
                mode: ctx.mode(),
                error: format!("{} cleanup task(s) exhausted their retries", report.exhausted.len()),
            }),
            CleanupOutcome::AlreadyCleaned => self.emit(LifecycleEvent::CleanupSkipped {
                test_id: ctx.test_id().to_string(),
            }),
            CleanupOutcome::Failed { error } => self.emit(LifecycleEvent::CleanupFailed {
                test_id: ctx.test_id().to_string(),
                mode: ctx.mode(),
                error: error.clone(),
            }),
        }
        outcome
    }

    /// Suite end: clean every context still registered
    pub async fn after_all(&self) -> Vec<(String, CleanupOutcome)> {
        let leftovers = self.registry.drain_attached(&self.machine);
        let mut outcomes = Vec::new();
        if !leftovers.is_empty() {
            self.emit(LifecycleEvent::EmergencySweep {
                contexts: leftovers.len(),
            });
        }
        for (ctx, state) in leftovers {
            let outcome = self.finish(&ctx).await;
            self.settle(&ctx, state);
            outcomes.push((ctx.test_id().to_string(), outcome));
        }

        if let Some(production) = &self.production {
            for (test_id, outcome) in production.cleanup_all_contexts().await {
                if outcome != CleanupOutcome::AlreadyCleaned {
                    outcomes.push((test_id, outcome));
                }
            }
            if self.config.reclaim_orphans {
                if let Err(e) = self.reclaim_orphans().await {
                    warn!("Orphan sweep failed: {}", e);
                }
            }
        }

        info!(swept = outcomes.len(), "Lifecycle shut down");
        outcomes
    }
}
