//! Error types for matrix-ci-state

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the status persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading or writing the backing file failed
    #[error("Status store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backing file exists but does not hold a valid status document
    #[error("Status store at {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
