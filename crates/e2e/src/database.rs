//! Isolated-mode context manager
//!
//! Each context starts from a freshly restored snapshot, so scenarios may
//! mutate anything. Teardown either restores the snapshot again or deletes
//! just the tracked entities, depending on the configured reset policy.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use fieldsvc_common::{TestAssignment, TestEntity, TestMetadata, TestMode, TestTicket};

use crate::cleanup::{execute_tasks, CleanupExecutor, CleanupReport, CleanupTask, CleanupTaskType};
use crate::config::{DatabaseConfig, ResetPolicy, TestConfig};
use crate::context::{ConnectionInfo, ContextFinalizer, ContextManager, DataContext};
use crate::error::{E2eError, E2eResult};
use crate::isolation::IsolationManager;
use crate::store::BackupProvider;

pub struct DatabaseContextManager {
    provider: Arc<dyn BackupProvider>,
}

impl DatabaseContextManager {
    pub const NAME: &'static str = "database";

    pub fn new(provider: Arc<dyn BackupProvider>) -> Self {
        Self { provider }
    }

    async fn restore_snapshot(provider: &dyn BackupProvider, config: &DatabaseConfig) -> E2eResult<()> {
        match tokio::time::timeout(config.restore_timeout(), provider.restore(config)).await {
            Ok(result) => result,
            Err(_) => Err(E2eError::Timeout {
                what: format!("snapshot restore from {}", config.backup_path.display()),
                millis: config.restore_timeout_ms,
            }),
        }
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
        self.provider
            .insert(
                &context.connection_info().connection_string,
                &entity,
                context.test_run_id(),
            )
            .await?;
        context.track_created(&entity)?;
        Ok(ticket)
    }

    /// Put a roster technician on a ticket for the life of the context
    pub async fn create_derived_assignment(
        &self,
        context: &DataContext,
        ticket_id: &str,
        route_id: &str,
        character: &str,
    ) -> E2eResult<TestAssignment> {
        let assignment = IsolationManager::derived_assignment(context, ticket_id, route_id, character);
        let entity = TestEntity::Assignment(assignment.clone());
        self.provider
            .insert(
                &context.connection_info().connection_string,
                &entity,
                context.test_run_id(),
            )
            .await?;
        context.track_created(&entity)?;
        Ok(assignment)
    }
}

#[async_trait]
impl ContextManager for DatabaseContextManager {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports(&self, mode: TestMode) -> bool {
        mode.uses_database()
    }

    #[instrument(skip(self, config), fields(test_id = %config.test_id()))]
    async fn setup_context(&self, mode: TestMode, config: &TestConfig) -> E2eResult<DataContext> {
        if !self.supports(mode) {
            return Err(E2eError::Setup {
                mode,
                reason: format!("{} manager does not serve {} mode", Self::NAME, mode),
            });
        }
        let db_config = config.database().ok_or_else(|| {
            E2eError::Configuration(format!("{} mode requires a database configuration", mode))
        })?;

        Self::restore_snapshot(self.provider.as_ref(), db_config).await?;

        let mut shortfalls = Vec::new();
        for query in &db_config.verification_queries {
            let rows = self
                .provider
                .count_rows(&db_config.connection_string, &query.table)
                .await?;
            if rows < query.min_rows {
                shortfalls.push(format!(
                    "{} has {} rows, expected at least {}",
                    query.table, rows, query.min_rows
                ));
            }
        }
        if !shortfalls.is_empty() {
            return Err(E2eError::Setup {
                mode,
                reason: format!("baseline verification failed: {}", shortfalls.join("; ")),
            });
        }

        let test_run_id = IsolationManager::generate_test_run_id(mode);
        let metadata = TestMetadata::new(mode, test_run_id.clone());
        let data = self
            .provider
            .load_baseline(&db_config.connection_string, metadata)
            .await?;

        info!(
            %mode,
            %test_run_id,
            entities = data.total_entities(),
            "Isolated context ready"
        );

        let connection_info = ConnectionInfo {
            connection_string: db_config.connection_string.clone(),
            is_test_connection: true,
            production_safe: false,
            test_run_id,
        };
        let finalizer = Arc::new(SnapshotReset {
            provider: self.provider.clone(),
            config: db_config.clone(),
        });

        Ok(DataContext::new(
            config.test_id(),
            data,
            connection_info,
            Self::NAME,
            finalizer,
        ))
    }

    fn validation_issues(&self, context: &DataContext) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.supports(context.mode()) {
            issues.push(format!("{} mode is not served by the database manager", context.mode()));
        }
        if !context.connection_info().is_test_connection {
            issues.push("connection is not flagged as a test connection".to_string());
        }
        if context.test_run_id().is_empty() {
            issues.push("test run id is empty".to_string());
        }
        issues
    }
}

/// Teardown bound into isolated contexts
struct SnapshotReset {
    provider: Arc<dyn BackupProvider>,
    config: DatabaseConfig,
}

#[async_trait]
impl ContextFinalizer for SnapshotReset {
    async fn finalize(&self, context: &DataContext) -> E2eResult<CleanupReport> {
        let tasks = context.drain_cleanup_tasks();

        match self.config.reset_policy {
            ResetPolicy::FullReset => {
                DatabaseContextManager::restore_snapshot(self.provider.as_ref(), &self.config).await?;
                debug!(test_id = context.test_id(), "Snapshot restored");
                Ok(CleanupReport {
                    completed: tasks.into_iter().map(|t| t.id).collect(),
                    exhausted: Vec::new(),
                    passes: 1,
                })
            }
            ResetPolicy::DeleteCreated => {
                let executor = DatabaseTaskExecutor {
                    provider: self.provider.as_ref(),
                    config: &self.config,
                    test_id: context.test_id(),
                    mode: context.mode(),
                };
                Ok(execute_tasks(tasks, &executor).await)
            }
        }
    }
}

struct DatabaseTaskExecutor<'a> {
    provider: &'a dyn BackupProvider,
    config: &'a DatabaseConfig,
    test_id: &'a str,
    mode: TestMode,
}

#[async_trait]
impl CleanupExecutor for DatabaseTaskExecutor<'_> {
    async fn execute(&self, task: &CleanupTask) -> E2eResult<()> {
        match task.task_type {
            CleanupTaskType::Delete => {
                self.provider
                    .delete(&self.config.connection_string, task.entity_type, &task.entity_ids)
                    .await?;
                Ok(())
            }
            CleanupTaskType::Restore => {
                DatabaseContextManager::restore_snapshot(self.provider, self.config).await
            }
            CleanupTaskType::Update => Err(E2eError::Cleanup {
                test_id: self.test_id.to_string(),
                mode: self.mode,
                reason: format!(
                    "update cleanup of {} {:?} needs a snapshot restore",
                    task.entity_type, task.entity_ids
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::store::SqliteBackupProvider;
    use fieldsvc_common::{naming, roster, Database, EntityKind};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: LifecycleConfig,
        manager: DatabaseContextManager,
        provider: Arc<SqliteBackupProvider>,
    }

    fn fixture(policy: ResetPolicy) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("isolated.db");
        let snapshot = dir.path().join("baseline.db");

        let seed = Database::open(&db_path).unwrap();
        for entity in roster::entities() {
            seed.insert_entity(&entity, None).unwrap();
        }
        seed.backup_to(&snapshot).unwrap();

        let mut db_config = DatabaseConfig::new(db_path.display().to_string(), snapshot);
        db_config.reset_policy = policy;
        let config = LifecycleConfig {
            database: Some(db_config),
            ..Default::default()
        };
        let provider = Arc::new(SqliteBackupProvider::new());
        Fixture {
            _dir: dir,
            config,
            manager: DatabaseContextManager::new(provider.clone()),
            provider,
        }
    }

    #[tokio::test]
    async fn test_setup_loads_baseline_and_validates() {
        let fx = fixture(ResetPolicy::FullReset);
        let test_config = TestConfig::for_mode(TestMode::Isolated, "a.feature:1", &fx.config).unwrap();

        let ctx = fx.manager.setup_context(TestMode::Isolated, &test_config).await.unwrap();
        assert_eq!(ctx.mode(), TestMode::Isolated);
        assert_eq!(ctx.test_data().customers.len(), 4);
        assert!(ctx.connection_info().is_test_connection);
        assert!(IsolationManager::is_valid_test_run_id(ctx.test_run_id()));
        assert!(fx.manager.validate_context(&ctx));
    }

    #[tokio::test]
    async fn test_full_reset_discards_scenario_writes() {
        let fx = fixture(ResetPolicy::FullReset);
        let test_config = TestConfig::for_mode(TestMode::Isolated, "a.feature:1", &fx.config).unwrap();
        let ctx = fx.manager.setup_context(TestMode::Isolated, &test_config).await.unwrap();

        let customer = ctx.test_data().customers[0].id.clone();
        let ticket = fx
            .manager
            .create_derived_ticket(&ctx, "Leaky faucet", &customer, None)
            .await
            .unwrap();
        assert!(ticket.title.contains(ctx.test_run_id()));

        let conn = ctx.connection_info().connection_string.clone();
        assert_eq!(fx.provider.count_rows(&conn, "tickets").await.unwrap(), 1);

        fx.manager.cleanup_context(&ctx).await;
        assert_eq!(fx.provider.count_rows(&conn, "tickets").await.unwrap(), 0);
        assert_eq!(fx.provider.count_rows(&conn, "customers").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_delete_created_removes_only_tracked_rows() {
        let fx = fixture(ResetPolicy::DeleteCreated);
        let test_config = TestConfig::for_mode(TestMode::Isolated, "a.feature:1", &fx.config).unwrap();
        let ctx = fx.manager.setup_context(TestMode::Isolated, &test_config).await.unwrap();

        let customer = ctx.test_data().customers[0].id.clone();
        fx.manager
            .create_derived_ticket(&ctx, "Broken gate", &customer, None)
            .await
            .unwrap();

        let outcome = fx.manager.cleanup_context(&ctx).await;
        assert!(!outcome.is_failure());

        let conn = ctx.connection_info().connection_string.clone();
        assert_eq!(fx.provider.count_rows(&conn, "tickets").await.unwrap(), 0);
        assert_eq!(fx.provider.count_rows(&conn, "routes").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_baseline_fails_verification() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("isolated.db");
        let snapshot = dir.path().join("empty.db");
        Database::open(&db_path).unwrap().backup_to(&snapshot).unwrap();

        let config = LifecycleConfig {
            database: Some(DatabaseConfig::new(db_path.display().to_string(), snapshot)),
            ..Default::default()
        };
        let manager = DatabaseContextManager::new(Arc::new(SqliteBackupProvider::new()));
        let test_config = TestConfig::for_mode(TestMode::Isolated, "a.feature:1", &config).unwrap();

        let err = manager.setup_context(TestMode::Isolated, &test_config).await.unwrap_err();
        assert!(matches!(err, E2eError::Setup { .. }));
        assert!(err.to_string().contains("customers has 0 rows"));
    }

    #[tokio::test]
    async fn test_empty_baseline_accepted_without_row_checks() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("isolated.db");
        let snapshot = dir.path().join("empty.db");
        Database::open(&db_path).unwrap().backup_to(&snapshot).unwrap();

        let mut db_config = DatabaseConfig::new(db_path.display().to_string(), snapshot);
        db_config.verification_queries.clear();
        let config = LifecycleConfig {
            database: Some(db_config),
            ..Default::default()
        };
        let manager = DatabaseContextManager::new(Arc::new(SqliteBackupProvider::new()));
        let test_config = TestConfig::for_mode(TestMode::Isolated, "a.feature:1", &config).unwrap();

        let ctx = manager.setup_context(TestMode::Isolated, &test_config).await.unwrap();
        assert!(ctx.test_data().customers.is_empty());
        assert!(manager.validation_issues(&ctx).is_empty());
        manager.cleanup_context(&ctx).await;
    }

    #[tokio::test]
    async fn test_assignment_is_tracked_and_removed() {
        let fx = fixture(ResetPolicy::DeleteCreated);
        let test_config = TestConfig::for_mode(TestMode::Isolated, "a.feature:4", &fx.config).unwrap();
        let ctx = fx.manager.setup_context(TestMode::Isolated, &test_config).await.unwrap();

        let customer = ctx.test_data().customers[0].id.clone();
        let route = ctx.test_data().routes[0].id.clone();
        let ticket = fx
            .manager
            .create_derived_ticket(&ctx, "Fence repair", &customer, Some(&route))
            .await
            .unwrap();
        let assignment = fx
            .manager
            .create_derived_assignment(&ctx, &ticket.id, &route, "Daffy Duck")
            .await
            .unwrap();
        assert_eq!(assignment.ticket_id, ticket.id);
        assert_eq!(assignment.technician, naming::display_name("Daffy Duck"));
        assert_eq!(ctx.created_entities().len(), 2);

        let conn = ctx.connection_info().connection_string.clone();
        assert_eq!(fx.provider.count_rows(&conn, "assignments").await.unwrap(), 1);

        let outcome = fx.manager.cleanup_context(&ctx).await;
        assert!(!outcome.is_failure(), "{outcome:?}");
        assert_eq!(fx.provider.count_rows(&conn, "assignments").await.unwrap(), 0);
        assert_eq!(fx.provider.count_rows(&conn, "tickets").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_updated_row_is_restored_from_snapshot() {
        let fx = fixture(ResetPolicy::DeleteCreated);
        let test_config = TestConfig::for_mode(TestMode::Isolated, "a.feature:5", &fx.config).unwrap();
        let ctx = fx.manager.setup_context(TestMode::Isolated, &test_config).await.unwrap();

        let conn = ctx.connection_info().connection_string.clone();
        let customer = TestEntity::Customer(ctx.test_data().customers[0].clone());
        Database::open(&conn)
            .unwrap()
            .delete_entity(EntityKind::Customer, customer.id())
            .unwrap();
        ctx.track_updated(&customer).unwrap();
        assert_eq!(fx.provider.count_rows(&conn, "customers").await.unwrap(), 3);

        let outcome = fx.manager.cleanup_context(&ctx).await;
        assert!(!outcome.is_failure(), "{outcome:?}");
        assert_eq!(fx.provider.count_rows(&conn, "customers").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_update_task_fails_as_cleanup_error_in_context_mode() {
        let fx = fixture(ResetPolicy::DeleteCreated);
        let db_config = fx.config.database.clone().unwrap();
        let executor = DatabaseTaskExecutor {
            provider: fx.provider.as_ref(),
            config: &db_config,
            test_id: "d.feature:2",
            mode: TestMode::Dual,
        };

        let task = CleanupTask::update(EntityKind::Route, vec!["route-1".to_string()]);
        match executor.execute(&task).await.unwrap_err() {
            E2eError::Cleanup { test_id, mode, .. } => {
                assert_eq!(test_id, "d.feature:2");
                assert_eq!(mode, TestMode::Dual);
            }
            other => panic!("expected cleanup error, got {other:?}"),
        }
    }
}
