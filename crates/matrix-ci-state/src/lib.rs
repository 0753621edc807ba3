//! matrix-ci-state: status persistence for matrix-ci
//!
//! This crate provides the persistence layer behind change-based
//! notifications. It remembers the last terminal status observed for each
//! job identity so a later run can tell whether the status changed.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Statuses are stored as plain strings; this layer does not depend on the
//! orchestrator's domain types.
//!
//! ## Key Components
//!
//! - `StatusStore`: async key/value contract for last-known statuses
//! - `FileStatusStore`: JSON-file backend that survives between runs
//! - `fakes::MemoryStatusStore`: in-memory backend for tests and one-shot runs

mod error;
pub mod fakes;
mod file_store;
pub mod storage_traits;

pub use error::StorageError;
pub use file_store::FileStatusStore;
pub use storage_traits::{StatusKey, StatusRecord, StatusStore, StorageResult};
