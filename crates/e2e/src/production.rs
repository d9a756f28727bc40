//! Production-mode context manager
//!
//! Production contexts share one store with every other worker. The roster
//! is upserted idempotently and persists across runs; scenarios only ever
//! delete what they derived, and every touch of the store goes through the
//! production safety guard.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use fieldsvc_common::{is_test_entity, roster, TestAssignment, TestEntity, TestMetadata, TestMode, TestTicket};

use crate::cleanup::{execute_tasks, CleanupExecutor, CleanupReport, CleanupTask, CleanupTaskType};
use crate::config::{CleanupPolicy, TestConfig};
use crate::context::{cleanup_quietly, CleanupOutcome, ConnectionInfo, ContextFinalizer, ContextManager, DataContext};
use crate::error::{E2eError, E2eResult};
use crate::isolation::IsolationManager;
use crate::safety::{OperationKind, ProductionSafetyValidator};
use crate::store::ProductionDataStore;

type ActiveContexts = Arc<RwLock<HashMap<String, DataContext>>>;

pub struct ProductionTestDataManager {
    store: Arc<dyn ProductionDataStore>,
    active: ActiveContexts,
}

impl ProductionTestDataManager {
    pub const NAME: &'static str = "production";

    pub fn new(store: Arc<dyn ProductionDataStore>) -> Self {
        Self {
            store,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn ProductionDataStore> {
        &self.store
    }

    /// Upsert the roster; returns how many entities were newly written.
    /// Racing workers converge on one copy of each entity.
    pub async fn ensure_test_data_exists(&self) -> E2eResult<usize> {
        let mut created = 0;
        for entity in roster::entities() {
            ProductionSafetyValidator::validate_test_operation(
                TestMode::Production,
                OperationKind::Create,
                &entity,
            )?;
            if self.store.upsert(&entity).await? {
                created += 1;
            }
        }
        if created > 0 {
            info!(created, store = %self.store.describe(), "Seeded roster");
        }
        Ok(created)
    }

    pub fn create_connection_info(&self, test_run_id: &str) -> ConnectionInfo {
        ConnectionInfo {
            connection_string: self.store.describe(),
            is_test_connection: true,
            production_safe: true,
            test_run_id: test_run_id.to_string(),
        }
    }

    pub fn create_test_metadata(&self, mode: TestMode, test_run_id: &str) -> TestMetadata {
        TestMetadata::new(mode, test_run_id)
    }

    /// Test ids of contexts built here and not yet cleaned
    pub fn get_active_contexts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_run_ids(&self) -> Vec<String> {
        self.active
            .read()
            .values()
            .map(|ctx| ctx.test_run_id().to_string())
            .collect()
    }

    /// Emergency teardown of every context still open
    pub async fn cleanup_all_contexts(&self) -> Vec<(String, CleanupOutcome)> {
        let contexts: Vec<DataContext> = self.active.write().drain().map(|(_, ctx)| ctx).collect();
        if !contexts.is_empty() {
            warn!(count = contexts.len(), "Cleaning up contexts left open");
        }

        let mut outcomes = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            let outcome = cleanup_quietly(&ctx).await;
            outcomes.push((ctx.test_id().to_string(), outcome));
        }
        outcomes
    }

    /// Persist a run-scoped ticket and register it for teardown
    pub async fn create_derived_ticket(
        &self,
        context: &DataContext,
        base_title: &str,
        customer_id: &str,
        route_id: Option<&str>,
    ) -> E2eResult<TestTicket> {
        let ticket = IsolationManager::derived_ticket(context, base_title, customer_id, route_id);
        let entity = TestEntity::Ticket(ticket.clone());
        ProductionSafetyValidator::validate_test_operation(context.mode(), OperationKind::Create, &entity)?;
        self.store.insert_derived(&entity, context.test_run_id()).await?;
        context.track_created(&entity)?;
        Ok(ticket)
    }

    pub async fn create_derived_assignment(
        &self,
        context: &DataContext,
        ticket_id: &str,
        route_id: &str,
        character: &str,
    ) -> E2eResult<TestAssignment> {
        let assignment = IsolationManager::derived_assignment(context, ticket_id, route_id, character);
        let entity = TestEntity::Assignment(assignment.clone());
        ProductionSafetyValidator::validate_test_operation(context.mode(), OperationKind::Create, &entity)?;
        self.store.insert_derived(&entity, context.test_run_id()).await?;
        context.track_created(&entity)?;
        Ok(assignment)
    }
}

#[async_trait]
impl ContextManager for ProductionTestDataManager {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports(&self, mode: TestMode) -> bool {
        mode.uses_production()
    }

    #[instrument(skip(self, config), fields(test_id = %config.test_id()))]
    async fn setup_context(&self, mode: TestMode, config: &TestConfig) -> E2eResult<DataContext> {
        if !self.supports(mode) {
            return Err(E2eError::Setup {
                mode,
                reason: format!("{} manager does not serve {} mode", Self::NAME, mode),
            });
        }
        let production = config.production().ok_or_else(|| {
            E2eError::Configuration(format!("{} mode requires a production configuration", mode))
        })?;

        self.ensure_test_data_exists().await?;

        let test_run_id = IsolationManager::generate_test_run_id(mode);
        let metadata = self.create_test_metadata(mode, &test_run_id);
        let data = self.store.get_production_test_data(metadata).await?;
        let entities = data.entities();
        ProductionSafetyValidator::validate_all(mode, OperationKind::Read, &entities)?;

        info!(
            %mode,
            %test_run_id,
            entities = data.total_entities(),
            "Production context ready"
        );

        let finalizer = Arc::new(DerivedDataCleanup {
            store: self.store.clone(),
            policy: production.cleanup_policy,
            active: self.active.clone(),
        });
        let ctx = DataContext::new(
            config.test_id(),
            data,
            self.create_connection_info(&test_run_id),
            Self::NAME,
            finalizer,
        );
        self.active
            .write()
            .insert(ctx.test_id().to_string(), ctx.clone());
        Ok(ctx)
    }

    fn validation_issues(&self, context: &DataContext) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.supports(context.mode()) {
            issues.push(format!("{} mode is not served by the production manager", context.mode()));
        }
        if !context.connection_info().production_safe {
            issues.push("connection is not flagged production-safe".to_string());
        }
        if !IsolationManager::is_valid_test_run_id(context.test_run_id()) {
            issues.push(format!("test run id '{}' is malformed", context.test_run_id()));
        }
        for entity in context.test_data().entities() {
            if !is_test_entity(&entity) {
                issues.push(format!("{} '{}' is not marked as test data", entity.kind(), entity.name()));
            }
        }
        if context.test_data().customers.is_empty() {
            issues.push("roster contains no customers".to_string());
        }
        issues
    }
}

/// Teardown bound into production contexts
struct DerivedDataCleanup {
    store: Arc<dyn ProductionDataStore>,
    policy: CleanupPolicy,
    active: ActiveContexts,
}

#[async_trait]
impl ContextFinalizer for DerivedDataCleanup {
    async fn finalize(&self, context: &DataContext) -> E2eResult<CleanupReport> {
        self.active.write().remove(context.test_id());

        let mut tasks = context.drain_cleanup_tasks();
        if self.policy == CleanupPolicy::Purge {
            for entity in roster::entities() {
                tasks.push(CleanupTask::delete(entity.kind(), vec![entity.id().to_string()]));
            }
        }

        let executor = ProductionTaskExecutor {
            store: self.store.as_ref(),
            test_id: context.test_id(),
            mode: context.mode(),
            policy: self.policy,
        };
        let report = execute_tasks(tasks, &executor).await;

        // Rows inserted under the run id but never tracked
        let swept = self.store.delete_run(context.test_run_id()).await?;
        debug!(
            test_id = context.test_id(),
            test_run_id = context.test_run_id(),
            completed = report.completed.len(),
            swept,
            "Production context cleaned"
        );
        Ok(report)
    }
}

struct ProductionTaskExecutor<'a> {
    store: &'a dyn ProductionDataStore,
    test_id: &'a str,
    mode: TestMode,
    policy: CleanupPolicy,
}

impl ProductionTaskExecutor<'_> {
    fn cleanup_error(&self, reason: String) -> E2eError {
        E2eError::Cleanup {
            test_id: self.test_id.to_string(),
            mode: self.mode,
            reason,
        }
    }

    async fn delete(&self, task: &CleanupTask) -> E2eResult<()> {
        for id in &task.entity_ids {
            if self.policy == CleanupPolicy::Preserve && roster::is_roster_id(id) {
                debug!(id = %id, "Preserving roster entity");
                continue;
            }
            let Some(entity) = self.store.get(task.entity_type, id).await? else {
                continue;
            };
            ProductionSafetyValidator::validate_test_operation(self.mode, OperationKind::Delete, &entity)?;
            self.store.delete(task.entity_type, id).await?;
        }
        Ok(())
    }

    /// Rewrite mutated roster rows with their canonical values
    async fn reset_to_roster(&self, task: &CleanupTask) -> E2eResult<()> {
        let canonical = roster::entities();
        for id in &task.entity_ids {
            let entity = canonical
                .iter()
                .find(|e| e.kind() == task.entity_type && e.id() == id.as_str())
                .ok_or_else(|| {
                    self.cleanup_error(format!("{} '{}' has no canonical roster row", task.entity_type, id))
                })?;
            ProductionSafetyValidator::validate_test_operation(self.mode, OperationKind::Update, entity)?;
            self.store.delete(task.entity_type, id).await?;
            self.store.upsert(entity).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CleanupExecutor for ProductionTaskExecutor<'_> {
    async fn execute(&self, task: &CleanupTask) -> E2eResult<()> {
        match task.task_type {
            CleanupTaskType::Delete => self.delete(task).await,
            CleanupTaskType::Update => self.reset_to_roster(task).await,
            CleanupTaskType::Restore => Err(self.cleanup_error(format!(
                "snapshot restore of {} {:?} is not available against the shared store",
                task.entity_type, task.entity_ids
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, ProductionConfig};
    use crate::store::SqliteProductionStore;
    use fieldsvc_common::{Database, EntityKind, TestCustomer, TestDataMarker};
    use tempfile::TempDir;

    fn setup(policy: CleanupPolicy) -> (TempDir, LifecycleConfig, ProductionTestDataManager) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let mut production = ProductionConfig::new(&path);
        production.cleanup_policy = policy;
        let config = LifecycleConfig {
            production: Some(production),
            ..Default::default()
        };
        let manager = ProductionTestDataManager::new(Arc::new(SqliteProductionStore::new(&path)));
        (dir, config, manager)
    }

    #[tokio::test]
    async fn test_roster_upsert_is_idempotent() {
        let (_dir, _config, manager) = setup(CleanupPolicy::Preserve);
        assert_eq!(manager.ensure_test_data_exists().await.unwrap(), 7);
        assert_eq!(manager.ensure_test_data_exists().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_preserve_policy_keeps_roster() {
        let (dir, config, manager) = setup(CleanupPolicy::Preserve);
        let test_config = TestConfig::for_mode(TestMode::Production, "p.feature:3", &config).unwrap();

        let ctx = manager.setup_context(TestMode::Production, &test_config).await.unwrap();
        assert!(manager.validate_context(&ctx));
        assert_eq!(manager.get_active_contexts(), vec!["p.feature:3".to_string()]);

        let customer = ctx.test_data().customers[0].id.clone();
        let route = ctx.test_data().routes[0].id.clone();
        manager
            .create_derived_ticket(&ctx, "Gate sensor", &customer, Some(&route))
            .await
            .unwrap();
        ctx.push_task(CleanupTask::delete(EntityKind::Customer, vec![customer.clone()]));

        let outcome = manager.cleanup_context(&ctx).await;
        assert!(!outcome.is_failure(), "{outcome:?}");
        assert!(manager.get_active_contexts().is_empty());

        let db = Database::open(dir.path().join("shared.db")).unwrap();
        assert_eq!(db.count("customers").unwrap(), 4);
        assert_eq!(db.count("routes").unwrap(), 3);
        assert_eq!(db.count("tickets").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_policy_removes_roster() {
        let (dir, config, manager) = setup(CleanupPolicy::Purge);
        let test_config = TestConfig::for_mode(TestMode::Production, "p.feature:3", &config).unwrap();
        let ctx = manager.setup_context(TestMode::Production, &test_config).await.unwrap();

        manager.cleanup_context(&ctx).await;

        let db = Database::open(dir.path().join("shared.db")).unwrap();
        assert_eq!(db.count("customers").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unmarked_entity_blocks_derived_write() {
        let (_dir, config, manager) = setup(CleanupPolicy::Preserve);
        let test_config = TestConfig::for_mode(TestMode::Production, "p.feature:9", &config).unwrap();
        let ctx = manager.setup_context(TestMode::Production, &test_config).await.unwrap();

        let acme = TestEntity::Customer(TestCustomer {
            id: "cust-acme".to_string(),
            name: "Acme Corp".to_string(),
            email: "ops@acme.example".to_string(),
            phone: None,
            service_address: None,
            is_test_data: TestDataMarker,
        });
        let err = ctx.track_created(&acme).unwrap_err();
        assert!(matches!(err, E2eError::ProductionSafetyViolation { .. }));

        let outcomes = manager.cleanup_all_contexts().await;
        assert_eq!(outcomes.len(), 1);
        assert!(ctx.is_cleaned());
    }

    #[tokio::test]
    async fn test_assignment_is_swept_with_its_ticket() {
        let (dir, config, manager) = setup(CleanupPolicy::Preserve);
        let test_config = TestConfig::for_mode(TestMode::Production, "p.feature:12", &config).unwrap();
        let ctx = manager.setup_context(TestMode::Production, &test_config).await.unwrap();

        let customer = ctx.test_data().customers[0].id.clone();
        let route = ctx.test_data().routes[0].id.clone();
        let ticket = manager
            .create_derived_ticket(&ctx, "Pump check", &customer, Some(&route))
            .await
            .unwrap();
        let assignment = manager
            .create_derived_assignment(&ctx, &ticket.id, &route, "Bugs Bunny")
            .await
            .unwrap();
        assert!(assignment.technician.contains("Bugs Bunny"));

        let db = Database::open(dir.path().join("shared.db")).unwrap();
        assert_eq!(db.count("assignments").unwrap(), 1);

        let outcome = manager.cleanup_context(&ctx).await;
        assert!(!outcome.is_failure(), "{outcome:?}");
        assert_eq!(db.count("assignments").unwrap(), 0);
        assert_eq!(db.count("tickets").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_updated_roster_row_is_rewritten() {
        let (dir, config, manager) = setup(CleanupPolicy::Preserve);
        let test_config = TestConfig::for_mode(TestMode::Production, "p.feature:15", &config).unwrap();
        let ctx = manager.setup_context(TestMode::Production, &test_config).await.unwrap();

        let original = ctx.test_data().customers[0].clone();
        let mut mutated = original.clone();
        mutated.phone = Some("555-0100".to_string());
        let store = manager.store();
        store.delete(EntityKind::Customer, &original.id).await.unwrap();
        store.upsert(&TestEntity::Customer(mutated.clone())).await.unwrap();
        ctx.track_updated(&TestEntity::Customer(mutated)).unwrap();

        let outcome = manager.cleanup_context(&ctx).await;
        assert!(!outcome.is_failure(), "{outcome:?}");

        match store.get(EntityKind::Customer, &original.id).await.unwrap() {
            Some(TestEntity::Customer(restored)) => assert_eq!(restored.phone, original.phone),
            other => panic!("expected the roster customer back, got {other:?}"),
        }
        let db = Database::open(dir.path().join("shared.db")).unwrap();
        assert_eq!(db.count("customers").unwrap(), 4);
    }

    #[tokio::test]
    async fn test_restore_task_is_rejected_on_shared_store() {
        let (_dir, config, manager) = setup(CleanupPolicy::Preserve);
        let test_config = TestConfig::for_mode(TestMode::Production, "p.feature:18", &config).unwrap();
        let ctx = manager.setup_context(TestMode::Production, &test_config).await.unwrap();

        let route = ctx.test_data().routes[0].id.clone();
        ctx.push_task(CleanupTask::restore(EntityKind::Route, vec![route]));

        match manager.cleanup_context(&ctx).await {
            CleanupOutcome::Cleaned { report } => {
                assert_eq!(report.exhausted.len(), 1);
                let error = &report.exhausted[0].error;
                assert!(error.starts_with("Cleanup failed for p.feature:18"), "{error}");
            }
            other => panic!("expected a report with an exhausted task, got {other:?}"),
        }
    }
}
