//! Mode detection
//!
//! Decides which environment a scenario runs in from its tags and the
//! `TEST_MODE` override, and probes whether that environment is reachable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use fieldsvc_common::TestMode;

use crate::config::{EnvSource, ProcessEnv, TagConflictPolicy, ENV_TEST_MODE};
use crate::error::{E2eError, E2eResult};

pub const DUAL_TAG_CONFIDENCE: f64 = 0.95;
pub const TAG_CONFIDENCE: f64 = 0.9;
pub const ENVIRONMENT_CONFIDENCE: f64 = 1.0;
pub const FALLBACK_CONFIDENCE: f64 = 0.3;

/// Detection input for one scenario invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestContext {
    pub test_name: String,
    pub tags: Vec<String>,
    /// Unique per scenario and line, e.g. `features/tickets.feature:42`
    pub test_id: String,
}

impl TestContext {
    pub fn new(test_name: impl Into<String>, tags: Vec<String>, test_id: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            tags,
            test_id: test_id.into(),
        }
    }

    /// Tag lookup ignoring case and the leading `@`
    pub fn has_tag(&self, tag: &str) -> bool {
        let wanted = normalize_tag(tag);
        self.tags.iter().any(|t| normalize_tag(t) == wanted)
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().trim_start_matches('@').to_ascii_lowercase()
}

/// Where a detected mode came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Tags,
    Environment,
    Fallback,
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionSource::Tags => write!(f, "tags"),
            DetectionSource::Environment => write!(f, "environment"),
            DetectionSource::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeDetectionResult {
    pub mode: TestMode,
    /// In `[0, 1]`
    pub confidence: f64,
    pub source: DetectionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Explicit mode tags that disagreed, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_tags: Vec<String>,
}

impl ModeDetectionResult {
    fn from_tags(mode: TestMode, confidence: f64) -> Self {
        Self {
            mode,
            confidence,
            source: DetectionSource::Tags,
            fallback_reason: None,
            conflicting_tags: Vec::new(),
        }
    }
}

/// Outcome of probing a mode's backing store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub mode: TestMode,
    pub is_valid: bool,
    pub issues: Vec<String>,
}

/// Reachability check for a backing store
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), String>;
}

/// Static requirements a scenario declares
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRequirements {
    #[serde(default)]
    pub supported_modes: Vec<TestMode>,
    #[serde(default)]
    pub needs_roster: bool,
}

/// Static descriptor used for compatibility checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub name: String,
    pub tags: Vec<String>,
    pub supported_modes: BTreeSet<TestMode>,
    pub supports_dual: bool,
    pub requirements: TestRequirements,
}

/// Mode detector
pub struct ModeDetector {
    env: Arc<dyn EnvSource>,
    conflict_policy: TagConflictPolicy,
    database_probe: Option<Arc<dyn ConnectivityProbe>>,
    production_probe: Option<Arc<dyn ConnectivityProbe>>,
    probe_timeout: Duration,
}

impl Default for ModeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeDetector {
    /// Detector reading the real process environment
    pub fn new() -> Self {
        Self::with_env(Arc::new(ProcessEnv))
    }

    pub fn with_env(env: Arc<dyn EnvSource>) -> Self {
        Self {
            env,
            conflict_policy: TagConflictPolicy::default(),
            database_probe: None,
            production_probe: None,
            probe_timeout: Duration::from_secs(5),
        }
    }

    pub fn conflict_policy(mut self, policy: TagConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn database_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.database_probe = Some(probe);
        self
    }

    pub fn production_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.production_probe = Some(probe);
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Decide the scenario's mode.
    ///
    /// Precedence: `@dual`, `@production`, `@isolated`, `TEST_MODE`, then an
    /// isolated fallback.
    pub fn detect_mode(&self, context: &TestContext) -> E2eResult<ModeDetectionResult> {
        if context.has_tag(TestMode::Dual.tag()) {
            return Ok(ModeDetectionResult::from_tags(TestMode::Dual, DUAL_TAG_CONFIDENCE));
        }

        let production = context.has_tag(TestMode::Production.tag());
        let isolated = context.has_tag(TestMode::Isolated.tag());

        if production && isolated {
            let conflict = vec![
                TestMode::Isolated.tag().to_string(),
                TestMode::Production.tag().to_string(),
            ];
            if self.conflict_policy == TagConflictPolicy::Reject {
                return Err(E2eError::Configuration(format!(
                    "scenario '{}' is tagged both {} and {}; use @dual or pick one",
                    context.test_name, conflict[0], conflict[1]
                )));
            }
            warn!(
                test_id = %context.test_id,
                "Scenario tagged both @isolated and @production; @production takes precedence"
            );
            let mut result = ModeDetectionResult::from_tags(TestMode::Production, TAG_CONFIDENCE);
            result.conflicting_tags = conflict;
            return Ok(result);
        }

        if production {
            return Ok(ModeDetectionResult::from_tags(TestMode::Production, TAG_CONFIDENCE));
        }
        if isolated {
            return Ok(ModeDetectionResult::from_tags(TestMode::Isolated, TAG_CONFIDENCE));
        }

        let fallback_reason = match self.env.var(ENV_TEST_MODE) {
            Some(raw) => match raw.parse::<TestMode>() {
                Ok(mode) => {
                    debug!(test_id = %context.test_id, %mode, "Mode taken from {}", ENV_TEST_MODE);
                    return Ok(ModeDetectionResult {
                        mode,
                        confidence: ENVIRONMENT_CONFIDENCE,
                        source: DetectionSource::Environment,
                        fallback_reason: None,
                        conflicting_tags: Vec::new(),
                    });
                }
                Err(_) => format!(
                    "{}='{}' is not a valid mode and no mode tag was found; defaulting to isolated",
                    ENV_TEST_MODE, raw
                ),
            },
            None => "no mode tag or environment override found; defaulting to isolated".to_string(),
        };

        Ok(ModeDetectionResult {
            mode: TestMode::Isolated,
            confidence: FALLBACK_CONFIDENCE,
            source: DetectionSource::Fallback,
            fallback_reason: Some(fallback_reason),
            conflicting_tags: Vec::new(),
        })
    }

    /// Warnings about contradictory mode tags
    pub fn lint_tags(tags: &[String]) -> Vec<String> {
        let context = TestContext::new("", tags.to_vec(), "");
        let mut warnings = Vec::new();
        if context.has_tag("@isolated") && context.has_tag("@production") {
            if context.has_tag("@dual") {
                warnings.push("@dual makes @isolated and @production redundant".to_string());
            } else {
                warnings.push(
                    "@isolated and @production together are ambiguous; use @dual".to_string(),
                );
            }
        }
        warnings
    }

    /// Mode to try when `mode` cannot be serviced. Chains end after one hop.
    pub fn get_fallback_mode(mode: TestMode) -> Option<TestMode> {
        match mode {
            TestMode::Dual | TestMode::Production => Some(TestMode::Isolated),
            TestMode::Isolated => None,
        }
    }

    /// Probe the backing store the mode depends on.
    ///
    /// Dual mode is served by the snapshot database when one is configured,
    /// otherwise by the production store.
    pub async fn validate_database_connectivity(&self, mode: TestMode) -> ConnectivityReport {
        let probe = match mode {
            TestMode::Isolated => self.database_probe.as_ref(),
            TestMode::Production => self.production_probe.as_ref(),
            TestMode::Dual => self.database_probe.as_ref().or(self.production_probe.as_ref()),
        };

        let mut issues = Vec::new();
        match probe {
            None => issues.push(format!("no backing store configured for {} mode", mode)),
            Some(probe) => match tokio::time::timeout(self.probe_timeout, probe.check()).await {
                Ok(Ok(())) => {}
                Ok(Err(issue)) => issues.push(format!("{}: {}", probe.name(), issue)),
                Err(_) => issues.push(format!(
                    "{}: probe timed out after {}ms",
                    probe.name(),
                    self.probe_timeout.as_millis()
                )),
            },
        }

        ConnectivityReport {
            mode,
            is_valid: issues.is_empty(),
            issues,
        }
    }

    pub fn create_test_definition(
        name: &str,
        tags: &[String],
        requirements: TestRequirements,
    ) -> TestDefinition {
        let context = TestContext::new(name, tags.to_vec(), name);
        let mut supported_modes: BTreeSet<TestMode> = TestMode::ALL
            .into_iter()
            .filter(|m| context.has_tag(m.tag()))
            .collect();
        supported_modes.extend(requirements.supported_modes.iter().copied());
        if supported_modes.is_empty() {
            supported_modes.insert(TestMode::Isolated);
        }

        TestDefinition {
            name: name.to_string(),
            tags: tags.to_vec(),
            supports_dual: supported_modes.contains(&TestMode::Dual),
            supported_modes,
            requirements,
        }
    }

    pub fn validate_mode_compatibility(mode: TestMode, definition: &TestDefinition) -> bool {
        definition.supports_dual || definition.supported_modes.contains(&mode)
    }
}
