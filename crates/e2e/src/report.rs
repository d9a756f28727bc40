//! Mode failure reports
//!
//! When a scenario cannot get a data context, the abort carries a report
//! with everything needed to reproduce the failure: what was detected, what
//! was finally attempted, and the command line to rerun just that scenario.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use fieldsvc_common::TestMode;

use crate::config::ENV_TEST_MODE;
use crate::error::{E2eError, E2eResult};
use crate::mode::{DetectionSource, ModeDetectionResult, TestContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub mode: TestMode,
    pub confidence: f64,
    pub source: DetectionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl From<&ModeDetectionResult> for DetectionSummary {
    fn from(result: &ModeDetectionResult) -> Self {
        Self {
            mode: result.mode,
            confidence: result.confidence,
            source: result.source,
            fallback_reason: result.fallback_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeFailureReport {
    pub test_id: String,
    pub test_name: String,
    pub tags: Vec<String>,
    pub original_mode: TestMode,
    pub final_mode: TestMode,
    pub attempts: u32,
    pub error: String,
    pub error_kind: String,
    pub detection: DetectionSummary,
    /// Shell command that reruns the scenario in the mode that failed
    pub reproduction: String,
}

impl ModeFailureReport {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn to_json(&self) -> E2eResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report under `dir`, named after the test id
    pub fn write_to(&self, dir: &Path) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let file_name: String = self
            .test_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = dir.join(format!("mode-failure-{}.json", file_name));
        std::fs::write(&path, self.to_json()?)?;
        info!("Wrote mode failure report to {:?}", path);
        Ok(path)
    }
}

pub struct ModeFailureReporter;

impl ModeFailureReporter {
    pub fn create_failure_report(
        test_context: &TestContext,
        original_mode: TestMode,
        final_mode: TestMode,
        error: &E2eError,
        detection: &ModeDetectionResult,
    ) -> ModeFailureReport {
        ModeFailureReport {
            test_id: test_context.test_id.clone(),
            test_name: test_context.test_name.clone(),
            tags: test_context.tags.clone(),
            original_mode,
            final_mode,
            attempts: 0,
            error: error.to_string(),
            error_kind: error.kind().to_string(),
            detection: DetectionSummary::from(detection),
            reproduction: format!(
                "{}={} npx cucumber-js {}",
                ENV_TEST_MODE, final_mode, test_context.test_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn detection() -> ModeDetectionResult {
        ModeDetectionResult {
            mode: TestMode::Production,
            confidence: 0.9,
            source: DetectionSource::Tags,
            fallback_reason: None,
            conflicting_tags: Vec::new(),
        }
    }

    #[test]
    fn test_report_captures_modes_and_error() {
        let ctx = TestContext::new(
            "Dispatcher assigns a ticket",
            vec!["@production".to_string()],
            "features/dispatch.feature:18",
        );
        let err = E2eError::Setup {
            mode: TestMode::Isolated,
            reason: "snapshot missing".to_string(),
        };

        let report = ModeFailureReporter::create_failure_report(
            &ctx,
            TestMode::Production,
            TestMode::Isolated,
            &err,
            &detection(),
        )
        .with_attempts(3);

        assert_eq!(report.original_mode, TestMode::Production);
        assert_eq!(report.final_mode, TestMode::Isolated);
        assert_eq!(report.error_kind, "setup");
        assert!(report.error.contains("snapshot missing"));
        assert!(report.reproduction.contains("TEST_MODE=isolated"));

        let wrapped = E2eError::ModeSetupFailed(Box::new(report.clone()));
        let message = wrapped.to_string();
        assert!(message.contains("Dispatcher assigns a ticket"));
        assert!(message.contains("tags @ 0.90"));
        assert_eq!(wrapped.failure_report(), Some(&report));

        let dir = TempDir::new().unwrap();
        let path = report.write_to(dir.path()).unwrap();
        assert!(path.ends_with("mode-failure-features_dispatch_feature_18.json"));
        let parsed: ModeFailureReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, report);
    }
}
