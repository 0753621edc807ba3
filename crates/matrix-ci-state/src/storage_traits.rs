//! Storage trait definitions for matrix-ci
//!
//! `StatusStore` is the only persistent state the orchestrator keeps between
//! runs: the last terminal status observed for each job identity. All
//! implementations are async and backend-agnostic. An in-memory fake is
//! provided via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Identity under which a status is remembered.
///
/// For jobs this is the job's content digest; the pipeline as a whole uses
/// [`StatusKey::pipeline`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusKey(pub String);

impl StatusKey {
    pub fn new(key: impl Into<String>) -> Self {
        StatusKey(key.into())
    }

    /// Key reserved for the overall pipeline status.
    pub fn pipeline() -> Self {
        StatusKey("pipeline".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StatusKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last terminal status recorded for a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Terminal status string ("succeeded", "failed", "cancelled")
    pub status: String,
    /// Human-readable label of the job the status belongs to
    pub label: String,
    /// Pipeline run that produced the status
    pub run_id: Option<String>,
    /// When the status was recorded
    pub recorded_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(status: impl Into<String>, label: impl Into<String>, run_id: Option<String>) -> Self {
        Self {
            status: status.into(),
            label: label.into(),
            run_id,
            recorded_at: Utc::now(),
        }
    }
}

/// Last-known status store.
///
/// Guarantees:
/// - `get` after `put` for the same key returns the record that was put.
/// - `put` replaces any previous record for the key.
/// - Keys are independent; writing one never changes another.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Fetch the last record for a key, if any.
    async fn get(&self, key: &StatusKey) -> StorageResult<Option<StatusRecord>>;

    /// Record the latest status for a key.
    async fn put(&self, key: &StatusKey, record: StatusRecord) -> StorageResult<()>;

    /// Forget a key. No-op if absent.
    async fn remove(&self, key: &StatusKey) -> StorageResult<()>;

    /// All keys currently held, sorted.
    async fn keys(&self) -> StorageResult<Vec<StatusKey>>;
}
