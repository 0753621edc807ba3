//! Error types for pipeline configuration and execution.

use std::path::PathBuf;
use thiserror::Error;

/// Problems with the pipeline document. Always fatal, raised before any job
/// starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read pipeline config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pipeline config {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("axis '{axis}' has no values")]
    EmptyAxis { axis: String },

    #[error("axis name must not be empty")]
    UnnamedAxis,

    #[error("axis '{axis}' is declared more than once")]
    DuplicateAxis { axis: String },

    #[error("axes '{first}' and '{second}' both export {var}")]
    AxisEnvCollision {
        first: String,
        second: String,
        var: String,
    },

    #[error("axis '{axis}' lists value '{value}' more than once")]
    DuplicateValue { axis: String, value: String },

    #[error("{context} references unknown axis '{axis}'")]
    UnknownAxis { context: String, axis: String },

    #[error("{context} uses value '{value}' which axis '{axis}' does not declare")]
    UnknownValue {
        context: String,
        axis: String,
        value: String,
    },

    #[error("step name must not be empty")]
    UnnamedStep,

    #[error("step '{step}' is declared more than once")]
    DuplicateStep { step: String },

    #[error("step '{step}' has an empty command")]
    EmptyCommand { step: String },

    #[error("step '{step}' is invalid: {detail}")]
    InvalidStep { step: String, detail: String },

    #[error("invalid template in {context}: {detail}")]
    Template { context: String, detail: String },

    #[error("invalid setting '{field}': {detail}")]
    InvalidSetting { field: String, detail: String },

    #[error("invalid notification sink #{index}: {detail}")]
    InvalidSink { index: usize, detail: String },
}

/// Errors that abort a pipeline run as a whole.
///
/// Per-job failures never surface here; they are recorded in the job's
/// `JobResult`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("artifact I/O failed at {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("status store error: {0}")]
    Storage(#[from] matrix_ci_state::StorageError),

    #[error("job task failed: {0}")]
    Join(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Process exit code for this error, per the orchestrator exit contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => crate::exit_code::CONFIG_ERROR,
            _ => crate::exit_code::INTERNAL_ERROR,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
