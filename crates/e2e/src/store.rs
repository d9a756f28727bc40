//! Backing stores and their connectivity probes
//!
//! Isolated contexts run against a disposable database reset from a
//! snapshot through a [`BackupProvider`]. Production contexts share one
//! long-lived [`ProductionDataStore`]. Both ship with SQLite
//! implementations; other backends plug in through the traits.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fieldsvc_common::{is_test_entity, Database, EntityKind, TestDataSet, TestEntity, TestMetadata};

use crate::config::DatabaseConfig;
use crate::error::{E2eError, E2eResult};
use crate::mode::ConnectivityProbe;

/// Run blocking SQLite work off the async runtime
async fn run_blocking<T, F>(f: F) -> E2eResult<T>
where
    F: FnOnce() -> fieldsvc_common::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| fieldsvc_common::Error::Internal(format!("blocking task failed: {}", e)))?
        .map_err(E2eError::from)
}

/// Accepts bare paths and `sqlite://` URLs
fn sqlite_path(connection_string: &str) -> &str {
    connection_string
        .strip_prefix("sqlite://")
        .unwrap_or(connection_string)
}

// ============================================================================
// Snapshot database
// ============================================================================

#[async_trait]
pub trait BackupProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Replace the database contents with the configured snapshot
    async fn restore(&self, config: &DatabaseConfig) -> E2eResult<()>;

    async fn count_rows(&self, connection_string: &str, table: &str) -> E2eResult<i64>;

    /// Every baseline entity currently in the database
    async fn load_baseline(&self, connection_string: &str, metadata: TestMetadata) -> E2eResult<TestDataSet>;

    async fn insert(&self, connection_string: &str, entity: &TestEntity, test_run_id: &str) -> E2eResult<()>;

    async fn delete(&self, connection_string: &str, kind: EntityKind, ids: &[String]) -> E2eResult<usize>;

    async fn ping(&self, connection_string: &str) -> E2eResult<()>;
}

/// Snapshot provider over SQLite's online backup API
#[derive(Default)]
pub struct SqliteBackupProvider {
    handles: Mutex<HashMap<String, Database>>,
}

impl SqliteBackupProvider {
    pub fn new() -> Self {
        Self::default()
    }

    async fn database(&self, connection_string: &str) -> E2eResult<Database> {
        if let Some(db) = self.handles.lock().get(connection_string) {
            return Ok(db.clone());
        }

        let path = sqlite_path(connection_string).to_string();
        let db = run_blocking(move || Database::open(path)).await?;
        Ok(self
            .handles
            .lock()
            .entry(connection_string.to_string())
            .or_insert(db)
            .clone())
    }
}

#[async_trait]
impl BackupProvider for SqliteBackupProvider {
    fn name(&self) -> &str {
        "sqlite-snapshot"
    }

    async fn restore(&self, config: &DatabaseConfig) -> E2eResult<()> {
        let db = self.database(&config.connection_string).await?;
        let backup = config.backup_path.clone();
        run_blocking(move || db.restore_from(backup)).await
    }

    async fn count_rows(&self, connection_string: &str, table: &str) -> E2eResult<i64> {
        let db = self.database(connection_string).await?;
        let table = table.to_string();
        run_blocking(move || db.count(&table)).await
    }

    async fn load_baseline(&self, connection_string: &str, metadata: TestMetadata) -> E2eResult<TestDataSet> {
        let db = self.database(connection_string).await?;
        let entities = run_blocking(move || {
            let mut entities = Vec::new();
            for kind in EntityKind::ALL {
                entities.extend(db.list_entities(kind)?.into_iter().map(|row| row.entity));
            }
            Ok(entities)
        })
        .await?;
        Ok(TestDataSet::from_entities(entities, metadata))
    }

    async fn insert(&self, connection_string: &str, entity: &TestEntity, test_run_id: &str) -> E2eResult<()> {
        let db = self.database(connection_string).await?;
        let entity = entity.clone();
        let run_id = test_run_id.to_string();
        run_blocking(move || db.create_entity(&entity, Some(&run_id))).await
    }

    async fn delete(&self, connection_string: &str, kind: EntityKind, ids: &[String]) -> E2eResult<usize> {
        let db = self.database(connection_string).await?;
        let ids = ids.to_vec();
        run_blocking(move || {
            let mut removed = 0;
            for id in &ids {
                if db.delete_entity(kind, id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }

    async fn ping(&self, connection_string: &str) -> E2eResult<()> {
        let db = self.database(connection_string).await?;
        run_blocking(move || db.ping()).await
    }
}

// ============================================================================
// Shared production store
// ============================================================================

/// A run that left derived rows behind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFootprint {
    pub test_run_id: String,
    /// Unix seconds of the oldest row the run created
    pub oldest_created_at: i64,
}

#[async_trait]
pub trait ProductionDataStore: Send + Sync {
    fn describe(&self) -> String;

    async fn ping(&self) -> E2eResult<()>;

    /// Roster entities visible to a new context. Derived rows belonging to
    /// other runs and anything without the test marker are left out.
    async fn get_production_test_data(&self, metadata: TestMetadata) -> E2eResult<TestDataSet>;

    /// Insert unless an entity with the same id or name exists.
    /// Returns whether a row was written.
    async fn upsert(&self, entity: &TestEntity) -> E2eResult<bool>;

    async fn insert_derived(&self, entity: &TestEntity, test_run_id: &str) -> E2eResult<()>;

    async fn get(&self, kind: EntityKind, id: &str) -> E2eResult<Option<TestEntity>>;

    async fn delete(&self, kind: EntityKind, id: &str) -> E2eResult<bool>;

    async fn list_runs(&self) -> E2eResult<Vec<RunFootprint>>;

    /// Remove every derived row tagged with the run id
    async fn delete_run(&self, test_run_id: &str) -> E2eResult<usize>;
}

/// Shared store in a SQLite file, opened on first use
pub struct SqliteProductionStore {
    path: PathBuf,
    db: Mutex<Option<Database>>,
}

impl SqliteProductionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn database(&self) -> E2eResult<Database> {
        if let Some(db) = self.db.lock().as_ref() {
            return Ok(db.clone());
        }

        let path = self.path.clone();
        let db = run_blocking(move || Database::open(path)).await?;
        info!("Opened shared store at {:?}", self.path);
        Ok(self.db.lock().get_or_insert(db).clone())
    }
}

#[async_trait]
impl ProductionDataStore for SqliteProductionStore {
    fn describe(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    async fn ping(&self) -> E2eResult<()> {
        let db = self.database().await?;
        run_blocking(move || db.ping()).await
    }

    async fn get_production_test_data(&self, metadata: TestMetadata) -> E2eResult<TestDataSet> {
        let db = self.database().await?;
        let rows = run_blocking(move || {
            let mut rows = Vec::new();
            for kind in EntityKind::ALL {
                rows.extend(db.list_entities(kind)?);
            }
            Ok(rows)
        })
        .await?;

        let mut data = TestDataSet::empty(metadata);
        for row in rows {
            if row.run_id.is_some() {
                continue;
            }
            if !is_test_entity(&row.entity) {
                warn!(
                    kind = %row.entity.kind(),
                    id = row.entity.id(),
                    "Ignoring shared-store row without the test marker"
                );
                continue;
            }
            data.push(row.entity);
        }
        Ok(data)
    }

    async fn upsert(&self, entity: &TestEntity) -> E2eResult<bool> {
        let db = self.database().await?;
        let entity = entity.clone();
        run_blocking(move || db.insert_entity(&entity, None)).await
    }

    async fn insert_derived(&self, entity: &TestEntity, test_run_id: &str) -> E2eResult<()> {
        let db = self.database().await?;
        let entity = entity.clone();
        let run_id = test_run_id.to_string();
        run_blocking(move || db.create_entity(&entity, Some(&run_id))).await
    }

    async fn get(&self, kind: EntityKind, id: &str) -> E2eResult<Option<TestEntity>> {
        let db = self.database().await?;
        let id = id.to_string();
        let row = run_blocking(move || db.get_entity(kind, &id)).await?;
        Ok(row.map(|r| r.entity))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> E2eResult<bool> {
        let db = self.database().await?;
        let id = id.to_string();
        run_blocking(move || db.delete_entity(kind, &id)).await
    }

    async fn list_runs(&self) -> E2eResult<Vec<RunFootprint>> {
        let db = self.database().await?;
        let runs = run_blocking(move || {
            let mut oldest: HashMap<String, i64> = HashMap::new();
            for kind in EntityKind::ALL {
                for (run_id, created_at) in db.run_ids(kind)? {
                    let entry = oldest.entry(run_id).or_insert(created_at);
                    *entry = (*entry).min(created_at);
                }
            }
            Ok(oldest)
        })
        .await?;

        let mut footprints: Vec<RunFootprint> = runs
            .into_iter()
            .map(|(test_run_id, oldest_created_at)| RunFootprint {
                test_run_id,
                oldest_created_at,
            })
            .collect();
        footprints.sort_by_key(|f| f.oldest_created_at);
        Ok(footprints)
    }

    async fn delete_run(&self, test_run_id: &str) -> E2eResult<usize> {
        let db = self.database().await?;
        let run_id = test_run_id.to_string();
        let removed = run_blocking(move || {
            let mut kinds = EntityKind::ALL.to_vec();
            kinds.sort_by_key(|k| std::cmp::Reverse(k.cleanup_priority()));
            let mut removed = 0;
            for kind in kinds {
                removed += db.delete_by_run(kind, &run_id)?;
            }
            Ok(removed)
        })
        .await?;
        debug!(test_run_id, removed, "Removed run rows from shared store");
        Ok(removed)
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Snapshot file present and database reachable
pub struct SnapshotProbe {
    provider: Arc<dyn BackupProvider>,
    config: DatabaseConfig,
}

impl SnapshotProbe {
    pub fn new(provider: Arc<dyn BackupProvider>, config: DatabaseConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl ConnectivityProbe for SnapshotProbe {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn check(&self) -> Result<(), String> {
        if !self.config.backup_path.exists() {
            return Err(format!(
                "snapshot {} does not exist",
                self.config.backup_path.display()
            ));
        }
        self.provider
            .ping(&self.config.connection_string)
            .await
            .map_err(|e| e.to_string())
    }
}

pub struct StoreProbe {
    store: Arc<dyn ProductionDataStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn ProductionDataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConnectivityProbe for StoreProbe {
    fn name(&self) -> &str {
        "production-store"
    }

    async fn check(&self) -> Result<(), String> {
        self.store.ping().await.map_err(|e| e.to_string())
    }
}

/// GET against the deployed application's health endpoint
pub struct HttpHealthProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> E2eResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpHealthProbe {
    fn name(&self) -> &str {
        "health-endpoint"
    }

    async fn check(&self) -> Result<(), String> {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("{} returned {}", self.url, resp.status())),
            Err(e) if e.is_connect() => Err(format!("{} refused the connection", self.url)),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Passes only when every inner probe passes
pub struct AllProbes {
    probes: Vec<Arc<dyn ConnectivityProbe>>,
}

impl AllProbes {
    pub fn new(probes: Vec<Arc<dyn ConnectivityProbe>>) -> Self {
        Self { probes }
    }
}

#[async_trait]
impl ConnectivityProbe for AllProbes {
    fn name(&self) -> &str {
        "production"
    }

    async fn check(&self) -> Result<(), String> {
        let mut issues = Vec::new();
        for probe in &self.probes {
            if let Err(issue) = probe.check().await {
                issues.push(format!("{}: {}", probe.name(), issue));
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues.join("; "))
        }
    }
}
