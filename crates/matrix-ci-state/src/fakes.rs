//! In-memory fakes for storage traits
//!
//! `MemoryStatusStore` satisfies the `StatusStore` contract without touching
//! the filesystem. The orchestrator also uses it when no state file is
//! configured, in which case `on_change` compares only within one process.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::storage_traits::*;

/// In-memory status store backed by a `BTreeMap<key, record>`.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<BTreeMap<StatusKey, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, key: &StatusKey) -> StorageResult<Option<StatusRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(key).cloned())
    }

    async fn put(&self, key: &StatusKey, record: StatusRecord) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        records.insert(key.clone(), record);
        Ok(())
    }

    async fn remove(&self, key: &StatusKey) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        records.remove(key);
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<StatusKey>> {
        let records = self.records.lock().unwrap();
        Ok(records.keys().cloned().collect())
    }
}
