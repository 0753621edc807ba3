//! Pipeline document loading and validation.
//!
//! ```toml
//! [settings]
//! name = "scientific-lib"
//! max_parallel = 4
//!
//! [[axes]]
//! name = "os"
//! values = ["linux", "osx"]
//!
//! [[exclude]]
//! os = "osx"
//! python = "2.7"
//!
//! [[steps]]
//! name = "bootstrap-osx"
//! category = "provision"
//! run = "brew install libomp"
//! when = { equals = { axis = "os", value = "osx" } }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::axis::{AxisSet, Scalar};
use crate::error::ConfigError;
use crate::expand::{JobExpander, MatrixRules};
use crate::job::{Job, JobSpec};
use crate::notify::SinkConfig;
use crate::resolve::EnvironmentResolver;
use crate::step::StepConfig;

const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Run-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Pipeline name, used in logs and the pipeline notification.
    pub name: String,

    /// Concurrent jobs; defaults to available parallelism.
    pub max_parallel: Option<usize>,

    /// Timeout for steps that do not set their own.
    pub default_timeout_secs: u64,

    pub artifacts_dir: PathBuf,

    /// Working directory for every step; defaults to the directory holding
    /// the pipeline document.
    pub workdir: Option<PathBuf>,

    /// Last-known statuses for change notifications. In-memory when unset.
    pub state_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: "matrix-ci".to_string(),
            max_parallel: None,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            artifacts_dir: PathBuf::from(".matrix-ci"),
            workdir: None,
            state_file: None,
        }
    }
}

impl Settings {
    pub fn effective_max_parallel(&self) -> usize {
        self.max_parallel.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn effective_workdir(&self) -> PathBuf {
        self.workdir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(invalid_setting("name", "must not be empty"));
        }
        if self.max_parallel == Some(0) {
            return Err(invalid_setting("max_parallel", "must be at least 1"));
        }
        if self.default_timeout_secs == 0 {
            return Err(invalid_setting("default_timeout_secs", "must be greater than zero"));
        }
        Ok(())
    }

    /// Anchor relative paths at `base`.
    fn rebase(&mut self, base: &Path) {
        if self.artifacts_dir.is_relative() {
            self.artifacts_dir = base.join(&self.artifacts_dir);
        }
        self.workdir = Some(match self.workdir.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        });
        if let Some(state) = self.state_file.take() {
            self.state_file = Some(if state.is_relative() {
                base.join(state)
            } else {
                state
            });
        }
    }
}

fn invalid_setting(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        field: field.to_string(),
        detail: detail.to_string(),
    }
}

/// An include, exclude or allow-failure entry: axis pairs plus flags.
///
/// ```toml
/// [[include]]
/// os = "linux"
/// python = "3.5"
/// flags = ["accelerated-math"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleDef {
    #[serde(flatten)]
    pub axes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

impl<'de> Deserialize<'de> for RuleDef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(flatten)]
            axes: BTreeMap<String, Scalar>,
            #[serde(default)]
            flags: Vec<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        Ok(RuleDef {
            axes: raw
                .axes
                .into_iter()
                .map(|(axis, value)| (axis, value.into_string()))
                .collect(),
            flags: raw.flags,
        })
    }
}

impl RuleDef {
    pub fn to_spec(&self) -> JobSpec {
        let spec = self
            .axes
            .iter()
            .fold(JobSpec::new(), |spec, (axis, value)| spec.with_axis(axis, value));
        self.flags.iter().fold(spec, |spec, flag| spec.with_flag(flag))
    }
}

/// The whole pipeline document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub axes: AxisSet,

    #[serde(default)]
    pub include: Vec<RuleDef>,

    #[serde(default)]
    pub exclude: Vec<RuleDef>,

    #[serde(default)]
    pub allow_failures: Vec<RuleDef>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub notify: Vec<SinkConfig>,
}

impl PipelineConfig {
    /// Load and validate a pipeline document. `.json` files are parsed as
    /// JSON, everything else as TOML. Relative paths in `[settings]` are
    /// anchored at the document's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let parsed = if is_json {
            serde_json::from_str::<Self>(&text).map_err(|e| e.to_string())
        } else {
            toml::from_str::<Self>(&text).map_err(|e| e.to_string())
        };
        let mut config = parsed.map_err(|detail| ConfigError::Parse {
            path: path.to_path_buf(),
            detail,
        })?;

        let base = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        config.settings.rebase(&base);
        config.validate()?;

        debug!(
            path = %path.display(),
            axes = config.axes.len(),
            steps = config.steps.len(),
            sinks = config.notify.len(),
            "Loaded pipeline config"
        );
        Ok(config)
    }

    /// Parse and validate a TOML document; paths stay as written.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Full validation; nothing runs unless this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        self.axes.validate()?;
        self.rules().validate(&self.axes)?;

        let mut names = HashSet::new();
        let mut coverage: BTreeMap<&str, &str> = BTreeMap::new();
        for step in &self.steps {
            step.validate(&self.axes)?;
            if !names.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateStep {
                    step: step.name.clone(),
                });
            }
            if let Some(file) = step.coverage.as_deref() {
                if let Some(other) = coverage.insert(file, step.name.as_str()) {
                    return Err(ConfigError::InvalidStep {
                        step: step.name.clone(),
                        detail: format!("coverage file '{file}' is also written by step '{other}'"),
                    });
                }
            }
        }

        for (idx, sink) in self.notify.iter().enumerate() {
            sink.validate(idx + 1)?;
        }
        Ok(())
    }

    pub fn rules(&self) -> MatrixRules {
        let specs = |rules: &[RuleDef]| rules.iter().map(RuleDef::to_spec).collect();
        MatrixRules {
            include: specs(&self.include),
            exclude: specs(&self.exclude),
            allow_failures: specs(&self.allow_failures),
        }
    }

    pub fn expand(&self) -> Result<Vec<Job>, ConfigError> {
        let rules = self.rules();
        JobExpander::new(&self.axes, &rules).expand()
    }

    pub fn resolver(&self) -> EnvironmentResolver<'_> {
        EnvironmentResolver::new(&self.axes, &self.steps, self.settings.default_timeout_secs)
    }
}
