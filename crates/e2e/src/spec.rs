//! Declarative YAML scenario descriptors
//!
//! Each file describes one Gherkin scenario as the lifecycle sees it: name,
//! tags, and where it lives. Step bodies stay in the browser suite.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{E2eError, E2eResult};
use crate::mode::{ModeDetector, TestContext, TestDefinition, TestRequirements};

/// A scenario descriptor parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Scenario title as written in the feature file
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Gherkin tags, including the `@` prefix
    #[serde(default)]
    pub tags: Vec<String>,

    /// Feature file the scenario lives in
    pub feature: String,

    /// Line of the `Scenario:` keyword
    pub line: u32,

    #[serde(default)]
    pub requirements: TestRequirements,

    /// Gherkin step lines, for reports only
    #[serde(default)]
    pub steps: Vec<String>,
}

impl ScenarioSpec {
    /// Parse a scenario spec from YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        if spec.name.trim().is_empty() {
            return Err(E2eError::SpecParse("scenario name is empty".to_string()));
        }
        Ok(spec)
    }

    /// Parse a scenario spec from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all scenario specs under a directory, in path order
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut specs = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            specs.push(Self::from_file(entry.path())?);
        }

        Ok(specs)
    }

    /// Filter specs by tag, with or without the leading `@`
    pub fn filter_by_tag<'a>(specs: &'a [Self], tag: &str) -> Vec<&'a Self> {
        specs
            .iter()
            .filter(|s| s.to_test_context().has_tag(tag))
            .collect()
    }

    /// `<feature>:<line>`, unique per scenario
    pub fn test_id(&self) -> String {
        format!("{}:{}", self.feature, self.line)
    }

    pub fn to_test_context(&self) -> TestContext {
        TestContext::new(&self.name, self.tags.clone(), self.test_id())
    }

    pub fn definition(&self) -> TestDefinition {
        ModeDetector::create_test_definition(&self.name, &self.tags, self.requirements.clone())
    }

    /// Tag warnings, each prefixed with the scenario's test id
    pub fn lint(&self) -> Vec<String> {
        ModeDetector::lint_tags(&self.tags)
            .into_iter()
            .map(|warning| format!("{}: {}", self.test_id(), warning))
            .collect()
    }
}
