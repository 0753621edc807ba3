//! JSON-file backed status store.
//!
//! The whole document is rewritten on every `put`/`remove` through a
//! temporary file followed by a rename, so a crash never leaves a
//! half-written document behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatusDocument {
    version: u32,
    statuses: BTreeMap<StatusKey, StatusRecord>,
}

/// Status store persisted as a single JSON document on disk.
#[derive(Debug)]
pub struct FileStatusStore {
    path: PathBuf,
    records: Mutex<BTreeMap<StatusKey, StatusRecord>>,
}

impl FileStatusStore {
    /// Open the store at `path`, loading existing records.
    ///
    /// A missing file is an empty store; it is created on first write.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc: StatusDocument =
                    serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                        path: path.clone(),
                        detail: e.to_string(),
                    })?;
                if doc.version != DOCUMENT_VERSION {
                    return Err(StorageError::Corrupt {
                        path,
                        detail: format!("unsupported document version {}", doc.version),
                    });
                }
                doc.statuses
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        debug!(path = %path.display(), records = records.len(), "Opened status store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, records: &BTreeMap<StatusKey, StatusRecord>) -> StorageResult<()> {
        let doc = StatusDocument {
            version: DOCUMENT_VERSION,
            statuses: records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| StorageError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StorageError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn get(&self, key: &StatusKey) -> StorageResult<Option<StatusRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(key).cloned())
    }

    async fn put(&self, key: &StatusKey, record: StatusRecord) -> StorageResult<()> {
        let mut records = self.records.lock().await;
        records.insert(key.clone(), record);
        self.flush(&records).await
    }

    async fn remove(&self, key: &StatusKey) -> StorageResult<()> {
        let mut records = self.records.lock().await;
        if records.remove(key).is_some() {
            self.flush(&records).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<StatusKey>> {
        let records = self.records.lock().await;
        Ok(records.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::open(dir.path().join("status.json"))
            .await
            .unwrap();
        assert!(store.keys().await.unwrap().is_empty());
        assert!(!store.path().exists(), "no write until first put");
    }

    #[tokio::test]
    async fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = FileStatusStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, br#"{"version": 99, "statuses": {}}"#).unwrap();

        let err = FileStatusStore::open(&path).await.unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[tokio::test]
    async fn test_put_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/status.json");
        let store = FileStatusStore::open(&path).await.unwrap();

        store
            .put(&StatusKey::pipeline(), StatusRecord::new("succeeded", "pipeline", None))
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
