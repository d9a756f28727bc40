//! Scenario runner that drives bodies through the data-context lifecycle
//!
//! The runner owns the guarantee that teardown happens: whatever the body
//! does (pass, fail, time out, panic), `after_scenario` runs before the
//! next scenario starts.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use fieldsvc_common::TestMode;

use crate::context::{CleanupOutcome, DataContext};
use crate::error::{E2eError, E2eResult};
use crate::mode::ModeDetector;
use crate::orchestrator::ContextLifecycleOrchestrator;
use crate::report::ModeFailureReport;
use crate::spec::ScenarioSpec;

/// The scenario steps themselves
#[async_trait]
pub trait ScenarioBody: Send + Sync {
    async fn run(&self, scenario: &ScenarioSpec, context: &DataContext) -> E2eResult<()>;
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub test_id: String,
    pub mode: Option<TestMode>,
    pub test_run_id: Option<String>,
    pub success: bool,
    /// No data context could be established; the body never ran
    #[serde(default)]
    pub setup_failed: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Reported separately; a failed teardown never fails the scenario
    pub cleanup: Option<CleanupOutcome>,
    pub failure_report: Option<ModeFailureReport>,
}

/// Result of running all scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<ScenarioResult>,
    /// Contexts cleaned by the end-of-suite sweep
    pub emergency_cleanups: usize,
}

/// Configuration for the scenario runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub specs_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            specs_dir: PathBuf::from("tests/scenarios"),
            output_dir: PathBuf::from("test-results"),
        }
    }
}

pub struct ScenarioRunner {
    orchestrator: Arc<ContextLifecycleOrchestrator>,
    specs_dir: PathBuf,
    output_dir: PathBuf,
}

impl ScenarioRunner {
    pub fn new(orchestrator: Arc<ContextLifecycleOrchestrator>, config: RunnerConfig) -> Self {
        Self {
            orchestrator,
            specs_dir: config.specs_dir,
            output_dir: config.output_dir,
        }
    }

    pub fn orchestrator(&self) -> &Arc<ContextLifecycleOrchestrator> {
        &self.orchestrator
    }

    /// Run all scenarios in the specs directory
    pub async fn run_all(&self, body: &dyn ScenarioBody) -> E2eResult<SuiteResult> {
        let specs = ScenarioSpec::load_all(&self.specs_dir)?;
        self.run_specs(&specs, body).await
    }

    /// Run scenarios carrying a tag
    pub async fn run_tagged(&self, tag: &str, body: &dyn ScenarioBody) -> E2eResult<SuiteResult> {
        let specs = ScenarioSpec::load_all(&self.specs_dir)?;
        let filtered: Vec<ScenarioSpec> = ScenarioSpec::filter_by_tag(&specs, tag)
            .into_iter()
            .cloned()
            .collect();
        self.run_specs(&filtered, body).await
    }

    /// Run a list of scenarios between one `before_all` and one `after_all`
    pub async fn run_specs(&self, specs: &[ScenarioSpec], body: &dyn ScenarioBody) -> E2eResult<SuiteResult> {
        let start = Instant::now();
        let mut results = Vec::new();
        let mut passed = 0;
        let mut failed = 0;
        let skipped = 0;

        for warning in specs.iter().flat_map(ScenarioSpec::lint) {
            warn!("{}", warning);
        }

        self.orchestrator.before_all().await?;

        info!("Running {} scenario(s)...", specs.len());

        for spec in specs {
            let result = self.run_spec(spec, body).await;
            if result.success {
                passed += 1;
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                failed += 1;
                error!("✗ {} - {}", result.name, result.error.as_deref().unwrap_or("unknown error"));
            }
            results.push(result);
        }

        let emergency_cleanups = self.orchestrator.after_all().await.len();
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Scenario results: {} passed, {} failed, {} skipped ({} ms)",
            passed, failed, skipped, duration_ms
        );

        Ok(SuiteResult {
            total: specs.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            results,
            emergency_cleanups,
        })
    }

    /// Run one scenario, retrying failed bodies up to the configured count.
    /// Each attempt gets a fresh data context.
    pub async fn run_spec(&self, spec: &ScenarioSpec, body: &dyn ScenarioBody) -> ScenarioResult {
        let attempts = self.orchestrator.config().retries + 1;
        let mut result = self.run_once(spec, body, 1).await;
        for attempt in 2..=attempts {
            if result.success || result.setup_failed {
                break;
            }
            warn!("Retrying {} (attempt {}/{})", spec.name, attempt, attempts);
            result = self.run_once(spec, body, attempt).await;
        }
        result
    }

    async fn run_once(&self, spec: &ScenarioSpec, body: &dyn ScenarioBody, attempt: u32) -> ScenarioResult {
        let start = Instant::now();
        let test_context = spec.to_test_context();
        debug!("Running scenario: {}", spec.name);

        let mut result = ScenarioResult {
            name: spec.name.clone(),
            test_id: test_context.test_id.clone(),
            mode: None,
            test_run_id: None,
            success: false,
            setup_failed: false,
            attempts: attempt,
            duration_ms: 0,
            error: None,
            cleanup: None,
            failure_report: None,
        };

        let ctx = match self.orchestrator.before_scenario(&test_context).await {
            Ok(ctx) => ctx,
            Err(e) => {
                result.setup_failed = true;
                result.failure_report = e.failure_report().cloned();
                if let Some(report) = &result.failure_report {
                    if let Err(write_err) = report.write_to(&self.output_dir) {
                        warn!("Could not persist failure report: {}", write_err);
                    }
                }
                result.error = Some(e.to_string());
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        result.mode = Some(ctx.mode());
        result.test_run_id = Some(ctx.test_run_id().to_string());

        if !ModeDetector::validate_mode_compatibility(ctx.mode(), &spec.definition()) {
            warn!(
                test_id = %result.test_id,
                mode = %ctx.mode(),
                "Scenario does not declare support for the mode it is running in"
            );
        }

        let timeout = self.orchestrator.config().timeout();
        let outcome = AssertUnwindSafe(tokio::time::timeout(timeout, body.run(spec, &ctx)))
            .catch_unwind()
            .await;

        result.cleanup = Some(self.orchestrator.after_scenario(ctx.test_id()).await);

        match outcome {
            Ok(Ok(Ok(()))) => result.success = true,
            Ok(Ok(Err(e))) => result.error = Some(e.to_string()),
            Ok(Err(_)) => {
                result.error = Some(
                    E2eError::Timeout {
                        what: format!("scenario '{}'", spec.name),
                        millis: timeout.as_millis() as u64,
                    }
                    .to_string(),
                )
            }
            Err(panic) => result.error = Some(format!("scenario panicked: {}", panic_message(&*panic))),
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Write suite results to a JSON file
    pub fn write_results(&self, results: &SuiteResult) -> E2eResult<PathBuf> {
        write_results(&self.output_dir, results)
    }
}

pub fn write_results(output_dir: &Path, results: &SuiteResult) -> E2eResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let path = output_dir.join("lifecycle-results.json");
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(&path, json)?;

    info!("Results written to: {}", path.display());
    Ok(path)
}

/// libtest flags that take a value
const LIBTEST_VALUE_FLAGS: &[&str] = &["--test-threads", "--color", "--format", "--skip", "-Z"];

/// libtest switches `cargo test` passes to every test binary
const LIBTEST_SWITCHES: &[&str] = &[
    "--nocapture",
    "--quiet",
    "-q",
    "--exact",
    "--ignored",
    "--include-ignored",
    "--show-output",
    "--list",
    "--bench",
    "--test",
];

/// Drop libtest flags from a harness command line, keeping the program
/// name and everything the harness itself understands.
pub fn strip_libtest_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut kept = Vec::new();
    let mut args = args.into_iter();
    if let Some(program) = args.next() {
        kept.push(program);
    }
    while let Some(arg) = args.next() {
        let flag = arg.split('=').next().unwrap_or(&arg);
        if LIBTEST_SWITCHES.contains(&arg.as_str()) {
            continue;
        }
        if LIBTEST_VALUE_FLAGS.contains(&flag) {
            if !arg.contains('=') {
                args.next();
            }
            continue;
        }
        kept.push(arg);
    }
    kept
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test_case("lifecycle --nocapture --tag dispatch", "lifecycle --tag dispatch" ; "switch")]
    #[test_case("lifecycle --test-threads 4 -m dual", "lifecycle -m dual" ; "flag with separate value")]
    #[test_case("lifecycle --color=never --dry-run", "lifecycle --dry-run" ; "flag with inline value")]
    #[test_case("lifecycle -q --exact --format pretty", "lifecycle" ; "only libtest flags")]
    #[test_case("lifecycle --scenarios specs", "lifecycle --scenarios specs" ; "harness flags untouched")]
    fn test_strip_libtest_args(input: &str, expected: &str) {
        assert_eq!(strip_libtest_args(args(input)), args(expected));
    }

    #[test]
    fn test_panic_message_reads_both_payload_kinds() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*borrowed), "borrowed");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }
}
