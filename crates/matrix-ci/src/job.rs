//! Job identity, lifecycle state and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::runner::StepResult;

/// One concrete combination of axis values plus optional flags.
///
/// Immutable once produced by the expander. Equality (and the identity
/// key) depend only on content, never on declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobSpec {
    /// Axis name -> chosen value.
    #[serde(default)]
    pub axes: BTreeMap<String, String>,

    /// Extra named toggles (e.g. `accelerated-math`).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<String>,
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: bind an axis value.
    pub fn with_axis(mut self, axis: impl Into<String>, value: impl Into<String>) -> Self {
        self.axes.insert(axis.into(), value.into());
        self
    }

    /// Builder: set a flag.
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn value(&self, axis: &str) -> Option<&str> {
        self.axes.get(axis).map(String::as_str)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Whether every pair and flag of `partial` is present in this spec.
    pub fn matches(&self, partial: &JobSpec) -> bool {
        partial
            .axes
            .iter()
            .all(|(axis, value)| self.value(axis) == Some(value.as_str()))
            && partial.flags.iter().all(|f| self.has_flag(f))
    }

    /// Stable identity: SHA-256 over sorted axis pairs and sorted flags.
    pub fn key(&self) -> JobKey {
        let mut hasher = Sha256::new();
        for (axis, value) in &self.axes {
            hasher.update(axis.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\0");
        }
        for flag in &self.flags {
            hasher.update(b"+");
            hasher.update(flag.as_bytes());
            hasher.update(b"\0");
        }
        JobKey(hex::encode(hasher.finalize()))
    }

    /// Human label, axes in `order` first, then any others, then flags.
    pub fn label(&self, order: &[String]) -> String {
        let mut parts: Vec<String> = order
            .iter()
            .filter_map(|axis| self.value(axis).map(|v| format!("{axis}={v}")))
            .collect();
        parts.extend(
            self.axes
                .iter()
                .filter(|(axis, _)| !order.contains(axis))
                .map(|(axis, value)| format!("{axis}={value}")),
        );
        parts.extend(self.flags.iter().map(|f| format!("+{f}")));
        if parts.is_empty() {
            "(default)".to_string()
        } else {
            parts.join(" ")
        }
    }

    /// `AXIS_<NAME>=<value>` for each axis, `FLAG_<NAME>=1` for each flag.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .axes
            .iter()
            .map(|(axis, value)| (env_name("AXIS", axis), value.clone()))
            .collect();
        vars.extend(
            self.flags
                .iter()
                .map(|flag| (env_name("FLAG", flag), "1".to_string())),
        );
        vars
    }
}

/// `PREFIX_NAME` with the name upper-cased and non-alphanumerics as `_`.
pub fn env_name(prefix: &str, name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}_{suffix}")
}

/// Content digest identifying a `JobSpec` across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey(String);

impl JobKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An expanded job: spec plus its position in the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// 1-based run number, stable for a given configuration.
    pub number: usize,
    pub spec: JobSpec,
    pub key: JobKey,
    pub label: String,
    /// Failure of this job does not fail the pipeline.
    pub allow_failure: bool,
}

impl Job {
    pub fn new(number: usize, spec: JobSpec, axis_order: &[String]) -> Self {
        let key = spec.key();
        let label = spec.label(axis_order);
        Self {
            number,
            spec,
            key,
            label,
            allow_failure: false,
        }
    }

    /// Builder: mark the job as allowed to fail.
    pub fn allowed_to_fail(mut self) -> Self {
        self.allow_failure = true;
        self
    }
}

/// Job lifecycle.
///
/// `Pending -> Provisioning -> Building -> Testing -> PostProcessing ->
/// {Succeeded, Failed, Cancelled}`; phases with no steps are skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Provisioning,
    Building,
    Testing,
    PostProcessing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Provisioning => "provisioning",
            JobState::Building => "building",
            JobState::Testing => "testing",
            JobState::PostProcessing => "post_processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one job. Steps are appended in execution order by the job's
/// executor only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job: Job,
    pub state: JobState,
    pub steps: Vec<StepResult>,
    /// Merged coverage artifact, if any per-category artifact was readable.
    pub coverage: Option<PathBuf>,
    /// Concatenated step outputs.
    pub log_bundle: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Job-level error outside any step, such as unwritable artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    /// Empty result for a job that has not started.
    pub fn pending(job: Job) -> Self {
        Self {
            job,
            state: JobState::Pending,
            steps: Vec::new(),
            coverage: None,
            log_bundle: None,
            started_at: Utc::now(),
            duration_ms: 0,
            error: None,
        }
    }

    /// Result for a job cancelled before any of its steps ran.
    pub fn cancelled_before_start(job: Job) -> Self {
        Self {
            state: JobState::Cancelled,
            ..Self::pending(job)
        }
    }

    pub fn passed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_failure()).count()
    }

    /// Failed and not allowed to fail: this job fails the pipeline.
    pub fn is_blocking_failure(&self) -> bool {
        self.state == JobState::Failed && !self.job.allow_failure
    }

    /// First failing step that counts against the job.
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|s| s.status.is_failure() && !s.allow_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_independent_of_insertion_order() {
        let a = JobSpec::new().with_axis("os", "linux").with_axis("python", "3.9");
        let b = JobSpec::new().with_axis("python", "3.9").with_axis("os", "linux");
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str().len(), 64);
    }

    #[test]
    fn test_key_differs_by_value_and_flag() {
        let base = JobSpec::new().with_axis("os", "linux");
        let other = JobSpec::new().with_axis("os", "osx");
        let flagged = base.clone().with_flag("accel");
        assert_ne!(base.key(), other.key());
        assert_ne!(base.key(), flagged.key());
    }

    #[test]
    fn test_matches_partial() {
        let spec = JobSpec::new()
            .with_axis("os", "osx")
            .with_axis("python", "3.6")
            .with_flag("accel");
        assert!(spec.matches(&JobSpec::new().with_axis("os", "osx")));
        assert!(spec.matches(&JobSpec::new().with_flag("accel")));
        assert!(spec.matches(&JobSpec::new()));
        assert!(!spec.matches(&JobSpec::new().with_axis("os", "linux")));
        assert!(!spec.matches(&JobSpec::new().with_axis("arch", "arm64")));
    }

    #[test]
    fn test_label_follows_axis_order() {
        let spec = JobSpec::new()
            .with_axis("python", "3.9")
            .with_axis("os", "osx")
            .with_flag("accel");
        let order = vec!["os".to_string(), "python".to_string()];
        assert_eq!(spec.label(&order), "os=osx python=3.9 +accel");
        assert_eq!(JobSpec::new().label(&order), "(default)");
    }

    #[test]
    fn test_env_vars() {
        let spec = JobSpec::new()
            .with_axis("os", "linux")
            .with_axis("python-version", "3.9")
            .with_flag("accelerated-math");
        let vars = spec.env_vars();
        assert!(vars.contains(&("AXIS_OS".to_string(), "linux".to_string())));
        assert!(vars.contains(&("AXIS_PYTHON_VERSION".to_string(), "3.9".to_string())));
        assert!(vars.contains(&("FLAG_ACCELERATED_MATH".to_string(), "1".to_string())));
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Testing.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert_eq!(JobState::PostProcessing.to_string(), "post_processing");
    }

    #[test]
    fn test_blocking_failure_respects_allow_failure() {
        let job = Job::new(1, JobSpec::new().with_axis("os", "osx"), &[]);
        let mut result = JobResult::pending(job.clone());
        result.state = JobState::Failed;
        assert!(result.is_blocking_failure());

        let mut tolerated = JobResult::pending(job.allowed_to_fail());
        tolerated.state = JobState::Failed;
        assert!(!tolerated.is_blocking_failure());
    }
}
