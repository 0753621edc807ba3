//! Step conditions: declarative predicates over a job's axis values.
//!
//! Written in the pipeline document as, for example:
//!
//! ```toml
//! when = { equals = { axis = "os", value = "osx" } }
//! when = { major = { axis = "python", major = 2 } }
//! when = { all = [{ flag = "accelerated-math" }, { equals = { axis = "os", value = "linux" } }] }
//! ```

use serde::{Deserialize, Serialize};

use crate::axis::AxisSet;
use crate::error::ConfigError;
use crate::job::JobSpec;

/// Predicate deciding whether a step applies to a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Always applies.
    #[default]
    Always,

    /// Axis is bound to exactly `value`.
    Equals { axis: String, value: String },

    /// Axis is bound to one of `values`.
    In { axis: String, values: Vec<String> },

    /// Leading integer of the axis value (before the first `.`) equals
    /// `major`, e.g. `2.7` has major version 2.
    Major { axis: String, major: u64 },

    /// Named flag is set on the job.
    Flag(String),

    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn equals(axis: impl Into<String>, value: impl Into<String>) -> Self {
        Condition::Equals {
            axis: axis.into(),
            value: value.into(),
        }
    }

    pub fn major(axis: impl Into<String>, major: u64) -> Self {
        Condition::Major {
            axis: axis.into(),
            major,
        }
    }

    pub fn flag(flag: impl Into<String>) -> Self {
        Condition::Flag(flag.into())
    }

    /// Reject references to axes that are not declared.
    pub fn validate(&self, axes: &AxisSet, context: &str) -> Result<(), ConfigError> {
        match self {
            Condition::Always | Condition::Flag(_) => Ok(()),
            Condition::Equals { axis, .. }
            | Condition::In { axis, .. }
            | Condition::Major { axis, .. } => axes.require(axis, context).map(|_| ()),
            Condition::Not(inner) => inner.validate(axes, context),
            Condition::All(all) | Condition::Any(all) => {
                all.iter().try_for_each(|c| c.validate(axes, context))
            }
        }
    }

    /// Evaluate against a job. An axis the job does not bind never matches.
    pub fn evaluate(&self, spec: &JobSpec) -> bool {
        match self {
            Condition::Always => true,
            Condition::Equals { axis, value } => spec.value(axis) == Some(value.as_str()),
            Condition::In { axis, values } => spec
                .value(axis)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Condition::Major { axis, major } => spec
                .value(axis)
                .and_then(major_version)
                .is_some_and(|m| m == *major),
            Condition::Flag(flag) => spec.has_flag(flag),
            Condition::Not(inner) => !inner.evaluate(spec),
            Condition::All(all) => all.iter().all(|c| c.evaluate(spec)),
            Condition::Any(any) => any.iter().any(|c| c.evaluate(spec)),
        }
    }
}

fn major_version(value: &str) -> Option<u64> {
    value.split('.').next()?.trim().parse().ok()
}
