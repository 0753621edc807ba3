//! Environment resolution: which steps apply to a job, in which order, with
//! which rendered commands.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::axis::AxisSet;
use crate::error::ConfigError;
use crate::job::Job;
use crate::step::{check_coverage_file, StepCategory, StepConfig};
use crate::template;

/// A step bound to one job: condition already evaluated, templates rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub name: String,
    pub category: StepCategory,
    /// Rendered argv; first element is the executable.
    pub argv: Vec<String>,
    pub timeout_secs: u64,
    pub fail_fast: bool,
    pub allow_failure: bool,
    pub selector: Option<String>,
    /// Coverage file name relative to the job's coverage directory.
    pub coverage_file: Option<PathBuf>,
    /// Step-specific environment, rendered.
    pub env: Vec<(String, String)>,
}

/// Ordered, fully resolved work for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPlan {
    pub job: Job,
    pub steps: Vec<ResolvedStep>,
}

impl JobPlan {
    /// Steps of one category, in order.
    pub fn category(&self, category: StepCategory) -> impl Iterator<Item = &ResolvedStep> {
        self.steps.iter().filter(move |s| s.category == category)
    }

    /// Provisioning steps to run before build and test.
    pub fn provisioning(&self) -> impl Iterator<Item = &ResolvedStep> {
        self.category(StepCategory::Provision)
    }
}

/// Evaluates step conditions against jobs.
pub struct EnvironmentResolver<'a> {
    axes: &'a AxisSet,
    steps: &'a [StepConfig],
    default_timeout_secs: u64,
}

impl<'a> EnvironmentResolver<'a> {
    pub fn new(axes: &'a AxisSet, steps: &'a [StepConfig], default_timeout_secs: u64) -> Self {
        Self {
            axes,
            steps,
            default_timeout_secs,
        }
    }

    /// Enabled steps of `category` whose condition holds for `job`, in
    /// declaration order.
    pub fn applicable(
        &self,
        job: &Job,
        category: StepCategory,
    ) -> Result<Vec<&'a StepConfig>, ConfigError> {
        let mut applicable = Vec::new();
        for step in self.steps.iter().filter(|s| s.enabled && s.category == category) {
            step.when
                .validate(self.axes, &format!("step '{}' condition", step.name))?;
            if step.when.evaluate(&job.spec) {
                applicable.push(step);
            }
        }
        Ok(applicable)
    }

    /// Provisioning steps for `job`.
    pub fn provisioning_steps(&self, job: &Job) -> Result<Vec<&'a StepConfig>, ConfigError> {
        self.applicable(job, StepCategory::Provision)
    }

    /// Full plan: provision, build, test, post; declaration order within each.
    pub fn resolve(&self, job: &Job) -> Result<JobPlan, ConfigError> {
        let categories = [
            StepCategory::Provision,
            StepCategory::Build,
            StepCategory::Test,
            StepCategory::Post,
        ];
        let mut steps: Vec<ResolvedStep> = Vec::new();
        for category in categories {
            for step in self.applicable(job, category)? {
                step.validate(self.axes)?;
                let bound = self.bind(step, job)?;
                if let Some(file) = &bound.coverage_file {
                    if let Some(other) = steps.iter().find(|s| s.coverage_file.as_ref() == Some(file)) {
                        return Err(ConfigError::InvalidStep {
                            step: step.name.clone(),
                            detail: format!(
                                "coverage file '{}' is also written by step '{}' in job #{}",
                                file.display(),
                                other.name,
                                job.number
                            ),
                        });
                    }
                }
                steps.push(bound);
            }
        }

        debug!(
            job = job.number,
            label = %job.label,
            steps = steps.len(),
            "Resolved job plan"
        );
        Ok(JobPlan {
            job: job.clone(),
            steps,
        })
    }

    fn bind(&self, step: &StepConfig, job: &Job) -> Result<ResolvedStep, ConfigError> {
        let coverage_file = match &step.coverage {
            Some(file) => {
                let rendered = template::render(file, job);
                check_coverage_file(&step.name, &rendered)?;
                Some(PathBuf::from(rendered))
            }
            None => None,
        };
        Ok(ResolvedStep {
            name: step.name.clone(),
            category: step.category,
            argv: step.run.render(job),
            timeout_secs: step.timeout_secs.unwrap_or(self.default_timeout_secs),
            fail_fast: step.halts_on_failure(),
            allow_failure: step.allow_failure,
            selector: step.selector.clone(),
            coverage_file,
            env: step
                .env
                .iter()
                .map(|(k, v)| (k.clone(), template::render(v, job)))
                .collect(),
        })
    }
}
