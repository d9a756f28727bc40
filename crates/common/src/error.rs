//! Error types for the shared data layer

use thiserror::Error;

/// Result type alias using the common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Data-layer error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Entity already exists: {kind} named {name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}
