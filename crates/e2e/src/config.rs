//! Lifecycle configuration
//!
//! `LifecycleConfig` is loaded once per process (TOML file plus environment
//! overrides). `TestConfig` is derived from it for each scenario once the
//! mode is known and never changes afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use fieldsvc_common::TestMode;

use crate::error::{E2eError, E2eResult};

pub const ENV_TEST_MODE: &str = "TEST_MODE";
pub const ENV_DB_CONNECTION: &str = "TEST_DB_CONNECTION";
pub const ENV_DB_BACKUP: &str = "TEST_DB_BACKUP";
pub const ENV_PRODUCTION_STORE: &str = "TEST_PRODUCTION_STORE";
pub const ENV_PRODUCTION_HEALTH_URL: &str = "TEST_PRODUCTION_HEALTH_URL";
pub const ENV_RETRIES: &str = "RETRIES";
pub const ENV_TIMEOUT: &str = "TEST_TIMEOUT";

/// Source of environment variables, injectable so tests never touch the
/// process environment.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// How the snapshot database is returned to baseline after a scenario
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Restore the whole snapshot again
    #[default]
    FullReset,
    /// Delete only the entities the scenario registered
    DeleteCreated,
}

/// What production-mode cleanup may remove
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Roster entities persist; only scenario-derived data is deleted
    #[default]
    Preserve,
    /// Roster entities are deleted as well
    Purge,
}

/// Resolution of `@isolated` and `@production` on the same scenario
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagConflictPolicy {
    #[default]
    PreferProduction,
    Reject,
}

/// Baseline row-count check run after a restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationQuery {
    pub table: String,
    pub min_rows: i64,
}

impl VerificationQuery {
    pub fn new(table: impl Into<String>, min_rows: i64) -> Self {
        Self {
            table: table.into(),
            min_rows,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the working SQLite database
    pub connection_string: String,

    /// Baseline snapshot restored before each scenario
    pub backup_path: PathBuf,

    #[serde(default = "default_restore_timeout_ms")]
    pub restore_timeout_ms: u64,

    #[serde(default = "default_verification_queries")]
    pub verification_queries: Vec<VerificationQuery>,

    #[serde(default)]
    pub reset_policy: ResetPolicy,
}

fn default_restore_timeout_ms() -> u64 {
    30_000
}

fn default_verification_queries() -> Vec<VerificationQuery> {
    vec![
        VerificationQuery::new("customers", 1),
        VerificationQuery::new("routes", 1),
    ]
}

impl DatabaseConfig {
    pub fn new(connection_string: impl Into<String>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            connection_string: connection_string.into(),
            backup_path: backup_path.into(),
            restore_timeout_ms: default_restore_timeout_ms(),
            verification_queries: default_verification_queries(),
            reset_policy: ResetPolicy::default(),
        }
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionConfig {
    /// Path of the shared SQLite store
    pub store_path: PathBuf,

    /// Optional HTTP health endpoint probed before production setup
    #[serde(default)]
    pub health_url: Option<String>,

    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
}

impl ProductionConfig {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            health_url: None,
            cleanup_policy: CleanupPolicy::default(),
        }
    }
}

/// Process-wide lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Setup attempts per scenario before aborting
    pub max_setup_attempts: u32,

    /// Linear backoff base: attempt `n` waits `n * retry_backoff_ms`
    pub retry_backoff_ms: u64,

    pub connectivity_timeout_ms: u64,

    /// Scenario retry count handed to the test runner
    pub retries: u32,

    /// Per-scenario timeout handed to the test runner
    pub timeout_ms: u64,

    pub tag_conflict_policy: TagConflictPolicy,

    /// Sweep derived entities left behind by crashed runs
    pub reclaim_orphans: bool,

    pub orphan_max_age_secs: u64,

    pub database: Option<DatabaseConfig>,

    pub production: Option<ProductionConfig>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_setup_attempts: 3,
            retry_backoff_ms: 1000,
            connectivity_timeout_ms: 5000,
            retries: 0,
            timeout_ms: 30_000,
            tag_conflict_policy: TagConflictPolicy::default(),
            reclaim_orphans: true,
            orphan_max_age_secs: 3600,
            database: None,
            production: None,
        }
    }
}

impl LifecycleConfig {
    pub fn from_toml(content: &str) -> E2eResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        debug!("Loaded lifecycle config from {}", path.display());
        Self::from_toml(&content)
    }

    /// Apply environment overrides on top of the file configuration
    pub fn apply_env(mut self, env: &dyn EnvSource) -> E2eResult<Self> {
        if let Some(conn) = env.var(ENV_DB_CONNECTION) {
            let backup = env.var(ENV_DB_BACKUP).map(PathBuf::from);
            if let Some(db) = self.database.as_mut() {
                db.connection_string = conn;
                if let Some(backup) = backup {
                    db.backup_path = backup;
                }
            } else if let Some(backup) = backup {
                self.database = Some(DatabaseConfig::new(conn, backup));
            } else {
                return Err(E2eError::Configuration(format!(
                    "{} is set but no snapshot is configured; set {} or a [database] section",
                    ENV_DB_CONNECTION, ENV_DB_BACKUP
                )));
            }
        } else if let (Some(backup), Some(db)) = (env.var(ENV_DB_BACKUP), self.database.as_mut()) {
            db.backup_path = PathBuf::from(backup);
        }

        if let Some(store) = env.var(ENV_PRODUCTION_STORE) {
            match self.production.as_mut() {
                Some(production) => production.store_path = PathBuf::from(store),
                None => self.production = Some(ProductionConfig::new(store)),
            }
        }

        if let Some(url) = env.var(ENV_PRODUCTION_HEALTH_URL) {
            let production = self.production.as_mut().ok_or_else(|| {
                E2eError::Configuration(format!(
                    "{} is set but no production store is configured",
                    ENV_PRODUCTION_HEALTH_URL
                ))
            })?;
            production.health_url = Some(url);
        }

        if let Some(retries) = env.var(ENV_RETRIES) {
            self.retries = retries.trim().parse().map_err(|_| {
                E2eError::Configuration(format!("{} must be a non-negative integer, got '{}'", ENV_RETRIES, retries))
            })?;
        }

        if let Some(timeout) = env.var(ENV_TIMEOUT) {
            self.timeout_ms = timeout.trim().parse().map_err(|_| {
                E2eError::Configuration(format!("{} must be milliseconds, got '{}'", ENV_TIMEOUT, timeout))
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> E2eResult<()> {
        if self.max_setup_attempts == 0 {
            return Err(E2eError::Configuration(
                "max_setup_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(db) = &self.database {
            if db.connection_string.trim().is_empty() {
                return Err(E2eError::Configuration(
                    "database.connection_string is empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Delay before setup attempt `attempt + 1`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Immutable per-scenario configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig {
    test_id: String,
    mode: TestMode,
    retries: u32,
    timeout: Duration,
    database: Option<DatabaseConfig>,
    production: Option<ProductionConfig>,
}

impl TestConfig {
    /// Derive the configuration for one scenario running in `mode`
    pub fn for_mode(mode: TestMode, test_id: &str, config: &LifecycleConfig) -> E2eResult<Self> {
        let database = if mode.uses_database() {
            config.database.clone()
        } else {
            None
        };
        let production = if mode.uses_production() {
            config.production.clone()
        } else {
            None
        };

        let missing = match mode {
            TestMode::Isolated if database.is_none() => Some("database"),
            TestMode::Production if production.is_none() => Some("production"),
            TestMode::Dual if database.is_none() && production.is_none() => Some("database or production"),
            _ => None,
        };
        if let Some(section) = missing {
            return Err(E2eError::Configuration(format!(
                "{} mode requires a {} configuration",
                mode, section
            )));
        }

        Ok(Self {
            test_id: test_id.to_string(),
            mode,
            retries: config.retries,
            timeout: config.timeout(),
            database,
            production,
        })
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn mode(&self) -> TestMode {
        self.mode
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn database(&self) -> Option<&DatabaseConfig> {
        self.database.as_ref()
    }

    pub fn production(&self) -> Option<&ProductionConfig> {
        self.production.as_ref()
    }
}
