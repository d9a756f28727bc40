//! SQLite entity store backing both the snapshot database and the shared store

use crate::types::{EntityKind, TestEntity};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a writer waits on a lock held by another worker process
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database wrapper for entity persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A decoded entity row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub entity: TestEntity,
    /// Run that created the row; `None` for roster and baseline rows
    pub run_id: Option<String>,
    pub created_at: i64,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets parallel workers read while one of them upserts
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        debug!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        for kind in EntityKind::ALL {
            let table = kind.table();
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    spec TEXT NOT NULL,
                    run_id TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_run ON {table}(run_id);
                "#
            ))?;
        }

        debug!("Database schema initialized");
        Ok(())
    }

    /// Liveness probe
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ========================================================================
    // Entity operations
    // ========================================================================

    /// Insert an entity unless one with the same id or name already exists.
    ///
    /// Returns `true` when a row was written. Safe to call concurrently from
    /// several workers: the unique constraints turn a racing duplicate into
    /// a no-op.
    pub fn insert_entity(&self, entity: &TestEntity, run_id: Option<&str>) -> Result<bool> {
        self.insert_entity_at(entity, run_id, chrono::Utc::now().timestamp())
    }

    /// Insert with an explicit creation timestamp
    pub fn insert_entity_at(
        &self,
        entity: &TestEntity,
        run_id: Option<&str>,
        created_at: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (id, name, spec, run_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                entity.kind().table()
            ),
            params![
                entity.id(),
                entity.name(),
                serde_json::to_string(entity)?,
                run_id,
                created_at,
            ],
        )?;

        if rows > 0 {
            debug!("Inserted {} {}", entity.kind(), entity.id());
        }
        Ok(rows > 0)
    }

    /// Insert an entity, failing if its name is already taken
    pub fn create_entity(&self, entity: &TestEntity, run_id: Option<&str>) -> Result<()> {
        if self.insert_entity(entity, run_id)? {
            Ok(())
        } else {
            Err(Error::AlreadyExists {
                kind: entity.kind().to_string(),
                name: entity.name().to_string(),
            })
        }
    }

    /// Get an entity by id
    pub fn get_entity(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>> {
        let conn = self.conn.lock();

        let raw = conn
            .query_row(
                &format!(
                    "SELECT id, spec, run_id, created_at FROM {} WHERE id = ?1",
                    kind.table()
                ),
                params![id],
                RawRow::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// List all decodable entities of a kind.
    ///
    /// Rows that fail to decode (including rows not flagged as test data)
    /// are skipped rather than surfaced.
    pub fn list_entities(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT id, spec, run_id, created_at FROM {} ORDER BY created_at, name",
            kind.table()
        ))?;
        let rows = stmt.query_map([], RawRow::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            let raw = row?;
            let id = raw.id.clone();
            match raw.parse() {
                Ok(stored) => results.push(stored),
                Err(e) => warn!("Skipping {} row {}: {}", kind, id, e),
            }
        }

        Ok(results)
    }

    /// Delete an entity
    pub fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
            params![id],
        )?;

        if rows > 0 {
            debug!("Deleted {} with id {}", kind, id);
        }

        Ok(rows > 0)
    }

    /// Delete every entity of a kind created by the given run
    pub fn delete_by_run(&self, kind: EntityKind, run_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!("DELETE FROM {} WHERE run_id = ?1", kind.table()),
            params![run_id],
        )?;
        Ok(rows)
    }

    /// Distinct run ids with the oldest creation time seen for each
    pub fn run_ids(&self, kind: EntityKind) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT run_id, MIN(created_at) FROM {} WHERE run_id IS NOT NULL GROUP BY run_id",
            kind.table()
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Row count of a known entity table
    pub fn count(&self, table: &str) -> Result<i64> {
        let kind = EntityKind::from_table(table)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown table '{}'", table)))?;
        let conn = self.conn.lock();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Write a consistent snapshot of this database to `path`
    pub fn backup_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let conn = self.conn.lock();
        conn.backup(DatabaseName::Main, path.as_ref(), None)?;
        info!("Wrote snapshot to {:?}", path.as_ref());
        Ok(())
    }

    /// Replace this database's contents with the snapshot at `path`
    pub fn restore_from(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "snapshot".to_string(),
                id: path.display().to_string(),
            });
        }

        let mut conn = self.conn.lock();
        conn.restore(DatabaseName::Main, path, None::<fn(rusqlite::backup::Progress)>)?;
        info!("Restored snapshot from {:?}", path);
        Ok(())
    }
}

/// Raw database row before parsing
struct RawRow {
    id: String,
    spec: String,
    run_id: Option<String>,
    created_at: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            id: row.get(0)?,
            spec: row.get(1)?,
            run_id: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn parse(self) -> Result<StoredEntity> {
        Ok(StoredEntity {
            entity: serde_json::from_str(&self.spec)?,
            run_id: self.run_id,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster;
    use crate::types::{TestDataMarker, TestTicket};

    fn ticket(id: &str, title: &str) -> TestEntity {
        TestEntity::Ticket(TestTicket {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            customer_id: "customer-1".to_string(),
            route_id: None,
            status: Default::default(),
            is_test_data: TestDataMarker,
        })
    }

    #[test]
    fn test_insert_is_idempotent() {
        let db = Database::open_memory().unwrap();

        for entity in roster::entities() {
            assert!(db.insert_entity(&entity, None).unwrap());
        }
        for entity in roster::entities() {
            assert!(!db.insert_entity(&entity, None).unwrap());
        }

        assert_eq!(db.count("customers").unwrap(), 4);
        assert_eq!(db.count("routes").unwrap(), 3);
        assert!(db.count("users").is_err());
    }

    #[test]
    fn test_crud_and_run_scoping() {
        let db = Database::open_memory().unwrap();

        db.create_entity(&ticket("t-1", "Leak - looneyTunesTest"), Some("run-a")).unwrap();
        db.create_entity(&ticket("t-2", "Noise - looneyTunesTest"), Some("run-b")).unwrap();
        assert!(db.create_entity(&ticket("t-3", "Leak - looneyTunesTest"), None).is_err());

        let stored = db.get_entity(EntityKind::Ticket, "t-1").unwrap().unwrap();
        assert_eq!(stored.run_id.as_deref(), Some("run-a"));

        let runs = db.run_ids(EntityKind::Ticket).unwrap();
        assert_eq!(runs.len(), 2);

        assert_eq!(db.delete_by_run(EntityKind::Ticket, "run-a").unwrap(), 1);
        assert!(db.get_entity(EntityKind::Ticket, "t-1").unwrap().is_none());
        assert!(db.delete_entity(EntityKind::Ticket, "t-2").unwrap());
        assert!(!db.delete_entity(EntityKind::Ticket, "t-2").unwrap());
    }

    #[test]
    fn test_unmarked_rows_are_skipped() {
        let db = Database::open_memory().unwrap();
        db.insert_entity(&ticket("t-1", "Real - looneyTunesTest"), None).unwrap();
        {
            let conn = db.conn.lock();
            conn.execute(
                "INSERT INTO tickets (id, name, spec, run_id, created_at) VALUES ('t-2', 'Acme', ?1, NULL, 0)",
                params![r#"{"kind":"ticket","id":"t-2","title":"Acme","customer_id":"c","is_test_data":false}"#],
            )
            .unwrap();
        }

        let tickets = db.list_entities(EntityKind::Ticket).unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].entity.id(), "t-1");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("baseline.db");

        let db = Database::open(dir.path().join("work.db")).unwrap();
        for entity in roster::entities() {
            db.insert_entity(&entity, None).unwrap();
        }
        db.backup_to(&snapshot).unwrap();

        db.insert_entity(&ticket("t-1", "Scratch - looneyTunesTest"), Some("run-a")).unwrap();
        assert_eq!(db.count("tickets").unwrap(), 1);

        db.restore_from(&snapshot).unwrap();
        assert_eq!(db.count("tickets").unwrap(), 0);
        assert_eq!(db.count("customers").unwrap(), 4);
    }
}
