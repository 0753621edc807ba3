//! Step definitions and configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::axis::AxisSet;
use crate::condition::Condition;
use crate::error::ConfigError;
use crate::job::Job;
use crate::template;

/// Pipeline phase a step belongs to. Ordering is execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    /// Environment bootstrap (package managers, interpreters, dependencies).
    Provision,

    /// Build/install of the package under test.
    Build,

    /// Test invocations, one step per selector category.
    Test,

    /// Artifact collection, coverage upload, cleanup. Always runs.
    Post,
}

impl StepCategory {
    /// Get the category name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            StepCategory::Provision => "provision",
            StepCategory::Build => "build",
            StepCategory::Test => "test",
            StepCategory::Post => "post",
        }
    }

    pub fn is_post(&self) -> bool {
        matches!(self, StepCategory::Post)
    }
}

impl std::fmt::Display for StepCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Command to execute: a shell line run via `sh -c`, or an argv list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn shell(line: impl Into<String>) -> Self {
        CommandSpec::Shell(line.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CommandSpec::Shell(line) => line.trim().is_empty(),
            CommandSpec::Argv(args) => args.first().map_or(true, |exe| exe.trim().is_empty()),
        }
    }

    /// Raw template strings, for validation.
    pub fn templates(&self) -> Vec<&str> {
        match self {
            CommandSpec::Shell(line) => vec![line.as_str()],
            CommandSpec::Argv(args) => args.iter().map(String::as_str).collect(),
        }
    }

    /// Render against a job into the argv to spawn.
    pub fn render(&self, job: &Job) -> Vec<String> {
        match self {
            CommandSpec::Shell(line) => vec![
                "sh".to_string(),
                "-c".to_string(),
                template::render(line, job),
            ],
            CommandSpec::Argv(args) => args.iter().map(|a| template::render(a, job)).collect(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandSpec::Shell(line) => f.write_str(line),
            CommandSpec::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Configuration for a pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Human-readable step name, unique within the pipeline.
    pub name: String,

    pub category: StepCategory,

    /// Command template.
    pub run: CommandSpec,

    /// Which jobs the step applies to.
    #[serde(default)]
    pub when: Condition,

    /// Timeout in seconds; falls back to the pipeline default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// A failure halts the remaining non-post steps of the job. Unset means
    /// halt, except for test steps with a selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,

    /// A failure is recorded but neither halts nor fails the job.
    #[serde(default)]
    pub allow_failure: bool,

    /// Test-selector category (e.g. `fast`, `serial`, `extended`).
    #[serde(default)]
    pub selector: Option<String>,

    /// Coverage artifact file name (template) this test step writes into the
    /// job's coverage directory.
    #[serde(default)]
    pub coverage: Option<String>,

    /// Extra environment variables; values are templates.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Whether this step is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StepConfig {
    /// Create a step that applies to every job.
    pub fn new(name: impl Into<String>, category: StepCategory, run: CommandSpec) -> Self {
        Self {
            name: name.into(),
            category,
            run,
            when: Condition::Always,
            timeout_secs: None,
            fail_fast: None,
            allow_failure: false,
            selector: None,
            coverage: None,
            env: BTreeMap::new(),
            enabled: true,
        }
    }

    /// Shorthand for a shell-line step.
    pub fn shell(name: impl Into<String>, category: StepCategory, line: impl Into<String>) -> Self {
        Self::new(name, category, CommandSpec::shell(line))
    }

    /// Test step tagged with a selector; does not halt later test categories.
    pub fn test(name: impl Into<String>, selector: impl Into<String>, line: impl Into<String>) -> Self {
        let mut step = Self::shell(name, StepCategory::Test, line);
        step.selector = Some(selector.into());
        step
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.when = condition;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn coverage(mut self, file: impl Into<String>) -> Self {
        self.coverage = Some(file.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Disable this step.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether a failure of this step halts the job's remaining non-post
    /// steps. Selector-tagged test categories keep going unless `fail_fast`
    /// is set explicitly.
    pub fn halts_on_failure(&self) -> bool {
        self.fail_fast
            .unwrap_or(!(self.category == StepCategory::Test && self.selector.is_some()))
    }

    /// Check the step against the declared axes.
    pub fn validate(&self, axes: &AxisSet) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::UnnamedStep);
        }
        if self.run.is_empty() {
            return Err(ConfigError::EmptyCommand {
                step: self.name.clone(),
            });
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidStep {
                step: self.name.clone(),
                detail: "timeout_secs must be greater than zero".to_string(),
            });
        }
        if self.coverage.is_some() && self.category != StepCategory::Test {
            return Err(ConfigError::InvalidStep {
                step: self.name.clone(),
                detail: format!(
                    "coverage artifacts are only collected from test steps, not {}",
                    self.category
                ),
            });
        }
        if let Some(file) = &self.coverage {
            check_coverage_file(&self.name, file)?;
        }

        let context = format!("step '{}'", self.name);
        self.when.validate(axes, &format!("{context} condition"))?;
        for t in self.run.templates() {
            template::validate(t, axes, &format!("{context} command"))?;
        }
        for (key, value) in &self.env {
            template::validate(value, axes, &format!("{context} env {key}"))?;
        }
        if let Some(file) = &self.coverage {
            template::validate(file, axes, &format!("{context} coverage"))?;
        }
        Ok(())
    }
}

/// A coverage file name must be a relative path below the job's coverage
/// directory. Applied to the raw template and again to each rendered name.
pub(crate) fn check_coverage_file(step: &str, file: &str) -> Result<(), ConfigError> {
    let path = Path::new(file);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if file.trim().is_empty() || escapes {
        return Err(ConfigError::InvalidStep {
            step: step.to_string(),
            detail: format!("coverage file '{file}' must stay inside the job directory"),
        });
    }
    Ok(())
}
