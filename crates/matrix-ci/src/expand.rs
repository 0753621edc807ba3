//! Matrix expansion: axes and rules into an ordered list of jobs.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::axis::AxisSet;
use crate::error::ConfigError;
use crate::job::{Job, JobSpec};

/// Explicit matrix shaping rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatrixRules {
    /// When non-empty, the job set is exactly these specs, in order.
    pub include: Vec<JobSpec>,
    /// Cross-product jobs matching any of these are dropped.
    pub exclude: Vec<JobSpec>,
    /// Jobs matching any of these may fail without failing the pipeline.
    pub allow_failures: Vec<JobSpec>,
}

impl MatrixRules {
    /// Every rule may only name declared axes and their declared values.
    pub fn validate(&self, axes: &AxisSet) -> Result<(), ConfigError> {
        let groups = [
            ("include", &self.include),
            ("exclude", &self.exclude),
            ("allow_failures", &self.allow_failures),
        ];
        for (group, rules) in groups {
            for (idx, rule) in rules.iter().enumerate() {
                let context = format!("{group} rule #{}", idx + 1);
                for (axis, value) in &rule.axes {
                    if !axes.require(axis, &context)?.contains(value) {
                        return Err(ConfigError::UnknownValue {
                            context,
                            axis: axis.clone(),
                            value: value.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Produces jobs from an axis set and matrix rules.
pub struct JobExpander<'a> {
    axes: &'a AxisSet,
    rules: &'a MatrixRules,
}

impl<'a> JobExpander<'a> {
    pub fn new(axes: &'a AxisSet, rules: &'a MatrixRules) -> Self {
        Self { axes, rules }
    }

    /// Expand into jobs numbered from 1.
    ///
    /// - Inclusion rules present: exactly those specs, unmodified, in order.
    /// - Otherwise: full cross-product in axis order, later axes varying
    ///   fastest, minus excluded combinations.
    pub fn expand(&self) -> Result<Vec<Job>, ConfigError> {
        self.axes.validate()?;
        self.rules.validate(self.axes)?;

        let specs = if self.rules.include.is_empty() {
            self.cross_product()
                .into_iter()
                .filter(|spec| !self.rules.exclude.iter().any(|ex| spec.matches(ex)))
                .collect()
        } else {
            if !self.rules.exclude.is_empty() {
                warn!(
                    excluded = self.rules.exclude.len(),
                    "Exclusion rules are ignored when inclusion rules are present"
                );
            }
            for (idx, spec) in self.rules.include.iter().enumerate() {
                if self.rules.include[..idx].contains(spec) {
                    warn!(rule = idx + 1, "Inclusion rule repeats an earlier rule");
                }
            }
            self.rules.include.clone()
        };

        let order = self.axes.names();
        let jobs: Vec<Job> = specs
            .into_iter()
            .enumerate()
            .map(|(idx, spec)| {
                let allowed = self.rules.allow_failures.iter().any(|r| spec.matches(r));
                let job = Job::new(idx + 1, spec, &order);
                if allowed {
                    job.allowed_to_fail()
                } else {
                    job
                }
            })
            .collect();

        debug!(jobs = jobs.len(), "Expanded matrix");
        Ok(jobs)
    }

    fn cross_product(&self) -> Vec<JobSpec> {
        let mut specs = vec![JobSpec::new()];
        for axis in self.axes.iter() {
            specs = specs
                .into_iter()
                .flat_map(|spec| {
                    axis.values
                        .iter()
                        .map(move |value| spec.clone().with_axis(axis.name.clone(), value.clone()))
                })
                .collect();
        }
        specs
    }
}
