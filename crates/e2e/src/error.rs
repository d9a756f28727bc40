//! Error types for the test-data lifecycle

use fieldsvc_common::{EntityKind, TestMode};
use thiserror::Error;

use crate::report::ModeFailureReport;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Setup failed in {mode} mode: {reason}")]
    Setup { mode: TestMode, reason: String },

    #[error("Context validation failed in {mode} mode: {}", .issues.join("; "))]
    Validation { mode: TestMode, issues: Vec<String> },

    #[error("Cleanup failed for {test_id} ({mode}): {reason}")]
    Cleanup {
        test_id: String,
        mode: TestMode,
        reason: String,
    },

    #[error("Production safety violation: refusing to {operation} {kind} '{entity}': {reason}")]
    ProductionSafetyViolation {
        operation: String,
        kind: EntityKind,
        entity: String,
        reason: String,
    },

    #[error(
        "Could not establish a data context for '{}' (original mode: {}, final mode: {}, detection: {} @ {:.2}): {}",
        .0.test_name, .0.original_mode, .0.final_mode, .0.detection.source, .0.detection.confidence, .0.error
    )]
    ModeSetupFailed(Box<ModeFailureReport>),

    #[error("Timeout after {millis}ms waiting for: {what}")]
    Timeout { what: String, millis: u64 },

    #[error("Invalid lifecycle transition from {from} on {input}")]
    InvalidTransition { from: String, input: String },

    #[error("Store error: {0}")]
    Store(#[from] fieldsvc_common::Error),

    #[error("Scenario spec parse error: {0}")]
    SpecParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    /// Whether the lifecycle may recover from this error by retrying or
    /// falling back to another mode.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            E2eError::Setup { .. }
                | E2eError::Validation { .. }
                | E2eError::Timeout { .. }
                | E2eError::Store(_)
                | E2eError::Io(_)
                | E2eError::Http(_)
        )
    }

    /// Short classification used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            E2eError::Configuration(_) => "configuration",
            E2eError::Setup { .. } => "setup",
            E2eError::Validation { .. } => "validation",
            E2eError::Cleanup { .. } => "cleanup",
            E2eError::ProductionSafetyViolation { .. } => "production_safety_violation",
            E2eError::ModeSetupFailed(_) => "mode_setup_failed",
            E2eError::Timeout { .. } => "timeout",
            E2eError::InvalidTransition { .. } => "invalid_transition",
            E2eError::Store(_) => "store",
            E2eError::SpecParse(_) => "spec_parse",
            E2eError::Io(_) => "io",
            E2eError::Json(_) => "json",
            E2eError::Yaml(_) => "yaml",
            E2eError::Toml(_) => "toml",
            E2eError::Http(_) => "http",
        }
    }

    /// The failure report carried by a fatal lifecycle abort
    pub fn failure_report(&self) -> Option<&ModeFailureReport> {
        match self {
            E2eError::ModeSetupFailed(report) => Some(&**report),
            _ => None,
        }
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_violation_is_never_retryable() {
        let err = E2eError::ProductionSafetyViolation {
            operation: "delete".to_string(),
            kind: EntityKind::Customer,
            entity: "Acme Corp".to_string(),
            reason: "missing test marker".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Acme Corp"));

        let err = E2eError::Setup {
            mode: TestMode::Production,
            reason: "store offline".to_string(),
        };
        assert!(err.is_retryable());
    }
}
