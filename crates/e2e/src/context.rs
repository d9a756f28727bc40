//! Per-scenario data context
//!
//! A [`DataContext`] is the handle a scenario uses to reach its test data.
//! It owns the cleanup queue for everything the scenario creates and an
//! idempotent `cleanup()` that runs the owning manager's teardown exactly
//! once, no matter how many times or from which path it is called.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use fieldsvc_common::{TestDataSet, TestEntity, TestMetadata, TestMode};

use crate::cleanup::{CleanupQueue, CleanupReport, CleanupTask};
use crate::config::TestConfig;
use crate::error::E2eResult;
use crate::safety::{OperationKind, ProductionSafetyValidator};

/// How a context reaches its backing store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Database connection string or store location
    pub connection_string: String,
    pub is_test_connection: bool,
    /// Only marked entities may be touched through this connection
    pub production_safe: bool,
    pub test_run_id: String,
}

/// Result of a teardown request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Cleaned { report: CleanupReport },
    /// Cleanup already ran, or no context was registered
    AlreadyCleaned,
    Failed { error: String },
}

impl CleanupOutcome {
    pub fn is_failure(&self) -> bool {
        match self {
            CleanupOutcome::Cleaned { report } => !report.is_clean(),
            CleanupOutcome::AlreadyCleaned => false,
            CleanupOutcome::Failed { .. } => true,
        }
    }
}

/// Teardown bound into a context by the manager that built it
#[async_trait]
pub trait ContextFinalizer: Send + Sync {
    async fn finalize(&self, context: &DataContext) -> E2eResult<CleanupReport>;
}

#[derive(Clone)]
pub struct DataContext {
    test_id: String,
    test_data: Arc<TestDataSet>,
    connection_info: ConnectionInfo,
    manager: &'static str,
    tasks: Arc<Mutex<CleanupQueue>>,
    created: Arc<Mutex<Vec<TestEntity>>>,
    finalizer: Arc<dyn ContextFinalizer>,
    cleaned: Arc<AtomicBool>,
}

impl fmt::Debug for DataContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataContext")
            .field("test_id", &self.test_id)
            .field("mode", &self.mode())
            .field("test_run_id", &self.test_run_id())
            .field("manager", &self.manager)
            .field("pending_tasks", &self.tasks.lock().len())
            .field("cleaned", &self.is_cleaned())
            .finish()
    }
}

impl DataContext {
    pub fn new(
        test_id: impl Into<String>,
        test_data: TestDataSet,
        connection_info: ConnectionInfo,
        manager: &'static str,
        finalizer: Arc<dyn ContextFinalizer>,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            test_data: Arc::new(test_data),
            connection_info,
            manager,
            tasks: Arc::new(Mutex::new(CleanupQueue::new())),
            created: Arc::new(Mutex::new(Vec::new())),
            finalizer,
            cleaned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn mode(&self) -> TestMode {
        self.test_data.metadata.mode
    }

    pub fn test_data(&self) -> &TestDataSet {
        &self.test_data
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    pub fn metadata(&self) -> &TestMetadata {
        &self.test_data.metadata
    }

    pub fn test_run_id(&self) -> &str {
        &self.test_data.metadata.test_run_id
    }

    /// Name of the manager that built this context
    pub fn manager(&self) -> &'static str {
        self.manager
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Register an entity the scenario created so teardown removes it.
    ///
    /// Production-safe contexts refuse entities without the test marker.
    pub fn track_created(&self, entity: &TestEntity) -> E2eResult<()> {
        if self.connection_info.production_safe {
            ProductionSafetyValidator::validate_test_operation(
                self.mode(),
                OperationKind::Create,
                entity,
            )?;
        }

        self.tasks
            .lock()
            .push(CleanupTask::delete(entity.kind(), vec![entity.id().to_string()]));
        self.created.lock().push(entity.clone());
        debug!(test_id = %self.test_id, kind = %entity.kind(), id = entity.id(), "Tracking created entity");
        Ok(())
    }

    /// Register an existing entity the scenario mutated.
    ///
    /// Shared stores rewrite the canonical row; snapshot databases restore
    /// from the baseline.
    pub fn track_updated(&self, entity: &TestEntity) -> E2eResult<()> {
        let ids = vec![entity.id().to_string()];
        let task = if self.connection_info.production_safe {
            ProductionSafetyValidator::validate_test_operation(self.mode(), OperationKind::Update, entity)?;
            CleanupTask::update(entity.kind(), ids)
        } else {
            // Whole-file restore, not retried
            CleanupTask::restore(entity.kind(), ids).with_max_retries(1)
        };
        self.tasks.lock().push(task);
        debug!(test_id = %self.test_id, kind = %entity.kind(), id = entity.id(), "Tracking updated entity");
        Ok(())
    }

    pub fn push_task(&self, task: CleanupTask) {
        self.tasks.lock().push(task);
    }

    pub fn pending_tasks(&self) -> Vec<CleanupTask> {
        self.tasks.lock().ordered()
    }

    /// Take every pending task in execution order
    pub fn drain_cleanup_tasks(&self) -> Vec<CleanupTask> {
        self.tasks.lock().drain()
    }

    pub fn created_entities(&self) -> Vec<TestEntity> {
        self.created.lock().clone()
    }

    /// Run teardown. Only the first call does any work.
    pub async fn cleanup(&self) -> E2eResult<CleanupOutcome> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            debug!(test_id = %self.test_id, "Context already cleaned");
            return Ok(CleanupOutcome::AlreadyCleaned);
        }

        let report = self.finalizer.finalize(self).await?;
        Ok(CleanupOutcome::Cleaned { report })
    }
}

/// Run a context's cleanup, converting any error into a logged outcome
pub async fn cleanup_quietly(context: &DataContext) -> CleanupOutcome {
    match context.cleanup().await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                test_id = %context.test_id(),
                mode = %context.mode(),
                test_run_id = %context.test_run_id(),
                "Cleanup failed: {}",
                e
            );
            CleanupOutcome::Failed { error: e.to_string() }
        }
    }
}

/// Builds, validates and tears down data contexts for the modes it serves
#[async_trait]
pub trait ContextManager: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, mode: TestMode) -> bool;

    async fn setup_context(&self, mode: TestMode, config: &TestConfig) -> E2eResult<DataContext>;

    /// Reasons a freshly built context is unusable; empty when valid
    fn validation_issues(&self, context: &DataContext) -> Vec<String>;

    fn validate_context(&self, context: &DataContext) -> bool {
        self.validation_issues(context).is_empty()
    }

    /// Never fails; errors are logged and reported in the outcome
    async fn cleanup_context(&self, context: &DataContext) -> CleanupOutcome {
        cleanup_quietly(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupTaskType;
    use crate::error::E2eError;
    use fieldsvc_common::{EntityKind, TestCustomer, TestDataMarker};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFinalizer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ContextFinalizer for CountingFinalizer {
        async fn finalize(&self, context: &DataContext) -> E2eResult<CleanupReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(E2eError::Cleanup {
                    test_id: context.test_id().to_string(),
                    mode: context.mode(),
                    reason: "store offline".to_string(),
                });
            }
            let completed = context.drain_cleanup_tasks().into_iter().map(|t| t.id).collect();
            Ok(CleanupReport {
                completed,
                exhausted: Vec::new(),
                passes: 1,
            })
        }
    }

    fn context(mode: TestMode, production_safe: bool, finalizer: Arc<CountingFinalizer>) -> DataContext {
        let metadata = TestMetadata::new(mode, "isolated-1700000000000-deadbeef");
        DataContext::new(
            "tickets.feature:12",
            TestDataSet::empty(metadata),
            ConnectionInfo {
                connection_string: "memory".to_string(),
                is_test_connection: true,
                production_safe,
                test_run_id: "isolated-1700000000000-deadbeef".to_string(),
            },
            "test",
            finalizer,
        )
    }

    fn customer(name: &str) -> TestEntity {
        TestEntity::Customer(TestCustomer {
            id: format!("id-{}", name.len()),
            name: name.to_string(),
            email: "x@example.com".to_string(),
            phone: None,
            service_address: None,
            is_test_data: TestDataMarker,
        })
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_across_clones() {
        let finalizer = Arc::new(CountingFinalizer::default());
        let ctx = context(TestMode::Isolated, false, finalizer.clone());
        let clone = ctx.clone();

        assert!(matches!(ctx.cleanup().await.unwrap(), CleanupOutcome::Cleaned { .. }));
        assert_eq!(clone.cleanup().await.unwrap(), CleanupOutcome::AlreadyCleaned);
        assert_eq!(cleanup_quietly(&ctx).await, CleanupOutcome::AlreadyCleaned);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 1);
        assert!(clone.is_cleaned());
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_reported_not_raised() {
        let finalizer = Arc::new(CountingFinalizer {
            fail: true,
            ..Default::default()
        });
        let ctx = context(TestMode::Isolated, false, finalizer.clone());

        let outcome = cleanup_quietly(&ctx).await;
        assert!(outcome.is_failure());
        assert_eq!(cleanup_quietly(&ctx).await, CleanupOutcome::AlreadyCleaned);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tracking_respects_production_safety() {
        let safe = context(TestMode::Production, true, Arc::new(CountingFinalizer::default()));
        assert!(safe.track_created(&customer("Acme Corp")).is_err());
        safe.track_created(&customer("Road Runner - looneyTunesTest")).unwrap();
        assert_eq!(safe.pending_tasks().len(), 1);
        assert_eq!(safe.pending_tasks()[0].entity_type, EntityKind::Customer);

        let isolated = context(TestMode::Isolated, false, Arc::new(CountingFinalizer::default()));
        isolated.track_created(&customer("Acme Corp")).unwrap();
        assert_eq!(isolated.created_entities().len(), 1);
    }

    #[test]
    fn test_updates_map_to_store_specific_tasks() {
        let safe = context(TestMode::Production, true, Arc::new(CountingFinalizer::default()));
        assert!(safe.track_updated(&customer("Acme Corp")).is_err());
        safe.track_updated(&customer("Road Runner - looneyTunesTest")).unwrap();
        assert_eq!(safe.pending_tasks()[0].task_type, CleanupTaskType::Update);

        let isolated = context(TestMode::Isolated, false, Arc::new(CountingFinalizer::default()));
        isolated.track_updated(&customer("Acme Corp")).unwrap();
        assert_eq!(isolated.pending_tasks()[0].task_type, CleanupTaskType::Restore);
        assert_eq!(isolated.pending_tasks()[0].max_retries, 1);
        assert!(isolated.created_entities().is_empty());
    }
}
