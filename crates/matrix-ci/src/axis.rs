//! Matrix axes: the dimensions a pipeline varies over.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::ConfigError;
use crate::job::env_name;

/// One dimension of the build matrix (e.g. `os` with `linux`, `osx`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Axis {
    /// Axis name, referenced by conditions and templates.
    pub name: String,

    /// Allowed values in declaration order.
    #[serde(deserialize_with = "scalar_vec")]
    pub values: Vec<String>,
}

impl Axis {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `value` is one of this axis' declared values.
    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Ordered set of axes. Declaration order drives expansion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AxisSet {
    axes: Vec<Axis>,
}

impl AxisSet {
    pub fn new(axes: Vec<Axis>) -> Self {
        Self { axes }
    }

    /// Check axis invariants: named, unique, non-empty, no repeated values,
    /// and each axis exported under its own `AXIS_*` variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let mut exported: HashMap<String, &str> = HashMap::new();
        for axis in &self.axes {
            if axis.name.trim().is_empty() {
                return Err(ConfigError::UnnamedAxis);
            }
            if !seen.insert(axis.name.as_str()) {
                return Err(ConfigError::DuplicateAxis {
                    axis: axis.name.clone(),
                });
            }
            let var = env_name("AXIS", &axis.name);
            if let Some(first) = exported.insert(var.clone(), axis.name.as_str()) {
                return Err(ConfigError::AxisEnvCollision {
                    first: first.to_string(),
                    second: axis.name.clone(),
                    var,
                });
            }
            if axis.values.is_empty() {
                return Err(ConfigError::EmptyAxis {
                    axis: axis.name.clone(),
                });
            }
            let mut values = HashSet::new();
            for value in &axis.values {
                if !values.insert(value.as_str()) {
                    return Err(ConfigError::DuplicateValue {
                        axis: axis.name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Axis> {
        self.axes.iter().find(|a| a.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Fail with `UnknownAxis` unless `name` is declared.
    pub fn require(&self, name: &str, context: &str) -> Result<&Axis, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::UnknownAxis {
            context: context.to_string(),
            axis: name.to_string(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.axes.iter().map(|a| a.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Axis> {
        self.axes.iter()
    }

    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Size of the full cross-product.
    pub fn product_size(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }
}

/// A TOML/JSON scalar accepted wherever an axis value is expected, so
/// `python = [2.7, "3.9"]` and `toggle = [0, 1]` both work.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    pub(crate) fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

fn scalar_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Scalar>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(Scalar::into_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_python() -> AxisSet {
        AxisSet::new(vec![
            Axis::new("os", ["linux", "osx"]),
            Axis::new("python", ["2.7", "3.5", "3.6"]),
        ])
    }

    #[test]
    fn test_valid_axis_set() {
        let axes = os_python();
        axes.validate().expect("valid axes");
        assert_eq!(axes.len(), 2);
        assert_eq!(axes.product_size(), 6);
        assert_eq!(axes.names(), vec!["os", "python"]);
    }

    #[test]
    fn test_empty_axis_rejected() {
        let axes = AxisSet::new(vec![Axis::new("os", Vec::<String>::new())]);
        let err = axes.validate().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAxis { ref axis } if axis == "os"));
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let axes = AxisSet::new(vec![Axis::new("os", ["linux"]), Axis::new("os", ["osx"])]);
        assert!(matches!(
            axes.validate().unwrap_err(),
            ConfigError::DuplicateAxis { .. }
        ));
    }

    #[test]
    fn test_axes_sharing_env_var_rejected() {
        let axes = AxisSet::new(vec![
            Axis::new("python-version", ["3.9"]),
            Axis::new("python_version", ["3.10"]),
        ]);
        match axes.validate().unwrap_err() {
            ConfigError::AxisEnvCollision { first, second, var } => {
                assert_eq!(first, "python-version");
                assert_eq!(second, "python_version");
                assert_eq!(var, "AXIS_PYTHON_VERSION");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_value_rejected() {
        let axes = AxisSet::new(vec![Axis::new("os", ["linux", "linux"])]);
        assert!(matches!(
            axes.validate().unwrap_err(),
            ConfigError::DuplicateValue { .. }
        ));
    }

    #[test]
    fn test_require_unknown_axis() {
        let err = os_python().require("arch", "step 'x'").unwrap_err();
        assert!(err.to_string().contains("arch"));
    }

    #[test]
    fn test_numeric_values_deserialize_as_strings() {
        let axis: Axis = toml::from_str(
            r#"
            name = "toggle"
            values = [0, 1, "maybe", true]
            "#,
        )
        .unwrap();
        assert_eq!(axis.values, vec!["0", "1", "maybe", "true"]);
    }

    #[test]
    fn test_empty_set_product_is_one() {
        assert_eq!(AxisSet::default().product_size(), 1);
    }
}
