//! Field-service harness common library
//!
//! Shared test-data model, the synthetic-data naming convention, and the
//! SQLite entity store used by both the isolated snapshot database and the
//! shared production-like store.

pub mod db;
pub mod error;
pub mod naming;
pub mod roster;
pub mod types;

// Re-export commonly used types
pub use db::{Database, StoredEntity};
pub use error::{Error, Result};
pub use naming::{is_test_entity, TEST_MARKER};
pub use types::*;

/// Harness version, stamped into every test-data metadata record
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
