//! Filesystem storage adapter.
//!
//! One pretty-printed JSON document per record:
//! ```text
//! {root}/
//!   definition/
//!     order-flow@1.2.0.json
//!   execution/
//!     0190c3e4-....json
//!   checkpoint/
//!     0190c3e5-....json
//! ```
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! reader never sees a half-written record.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use taskflow_core::store::{RecordFilter, RecordKind, StorageAdapter};
use taskflow_types::error::StorageError;

const EXTENSION: &str = "json";

pub struct FileStorage {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileStorage {
    /// Storage rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: RecordKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> Result<PathBuf, StorageError> {
        validate_id(id)?;
        Ok(self.kind_dir(kind).join(format!("{id}.{EXTENSION}")))
    }
}

/// Ids become file names: no separators, no traversal, no hidden files.
fn validate_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) || id.contains("..") {
        return Err(StorageError::Query(format!("invalid record id: {id:?}")));
    }
    Ok(())
}

impl StorageAdapter for FileStorage {
    async fn save(&self, kind: RecordKind, id: &str, record: &Value) -> Result<(), StorageError> {
        let path = self.record_path(kind, id)?;
        let dir = self.kind_dir(kind);
        tokio::fs::create_dir_all(&dir).await?;

        let body = serde_json::to_vec_pretty(record)?;
        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".{id}.{}.{seq}.tmp", std::process::id()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        tracing::debug!(kind = %kind, id, path = %path.display(), "record saved");
        Ok(())
    }

    async fn load(&self, kind: RecordKind, id: &str) -> Result<Option<Value>, StorageError> {
        let path = self.record_path(kind, id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<Value>, StorageError> {
        let dir = self.kind_dir(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            ids.push(stem.to_string());
        }
        ids.sort();

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut matched = Vec::new();
        for id in ids {
            if matched.len() >= limit {
                break;
            }
            let record = match self.load(kind, &id).await {
                Ok(Some(record)) => record,
                // Deleted between read_dir and load.
                Ok(None) => continue,
                Err(StorageError::Serialization(e)) => {
                    tracing::warn!(kind = %kind, id = %id, error = %e, "skipping unreadable record");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if filter.matches(&record) {
                matched.push(record);
            }
        }
        Ok(matched)
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StorageError> {
        let path = self.record_path(kind, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        let record = json!({"id": "order-flow", "version": "1.2.0", "tasks": []});
        storage
            .save(RecordKind::Definition, "order-flow@1.2.0", &record)
            .await
            .unwrap();
        assert!(dir.path().join("definition/order-flow@1.2.0.json").exists());

        assert_eq!(
            storage
                .load(RecordKind::Definition, "order-flow@1.2.0")
                .await
                .unwrap(),
            Some(record)
        );
        assert_eq!(
            storage.load(RecordKind::Execution, "order-flow@1.2.0").await.unwrap(),
            None
        );

        assert!(storage.delete(RecordKind::Definition, "order-flow@1.2.0").await.unwrap());
        assert!(!storage.delete(RecordKind::Definition, "order-flow@1.2.0").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage
            .save(RecordKind::Execution, "e1", &json!({"status": "running"}))
            .await
            .unwrap();
        storage
            .save(RecordKind::Execution, "e1", &json!({"status": "completed"}))
            .await
            .unwrap();

        let loaded = storage.load(RecordKind::Execution, "e1").await.unwrap().unwrap();
        assert_eq!(loaded["status"], "completed");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("execution"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        for (id, execution) in [("c3", "e1"), ("c1", "e1"), ("c2", "e2")] {
            storage
                .save(
                    RecordKind::Checkpoint,
                    id,
                    &json!({"id": id, "execution_id": execution}),
                )
                .await
                .unwrap();
        }

        let all = storage
            .list(RecordKind::Checkpoint, &RecordFilter::new())
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        let e1 = storage
            .list(
                RecordKind::Checkpoint,
                &RecordFilter::new().field("execution_id", "e1").limit(1),
            )
            .await
            .unwrap();
        assert_eq!(e1, vec![json!({"id": "c1", "execution_id": "e1"})]);

        assert!(
            storage
                .list(RecordKind::Definition, &RecordFilter::new())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        for id in ["../escape", "a/b", ".hidden", ""] {
            let err = storage
                .save(RecordKind::Execution, id, &json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::Query(_)), "{id}");
        }
    }

    #[tokio::test]
    async fn test_corrupt_record_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        std::fs::create_dir_all(dir.path().join("checkpoint")).unwrap();
        std::fs::write(dir.path().join("checkpoint/c1.json"), b"{not json").unwrap();

        let err = storage.load(RecordKind::Checkpoint, "c1").await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        for id in ["c1", "c3"] {
            storage
                .save(RecordKind::Checkpoint, id, &json!({"id": id}))
                .await
                .unwrap();
        }
        std::fs::write(dir.path().join("checkpoint/c2.json"), b"{not json").unwrap();

        let listed = storage
            .list(RecordKind::Checkpoint, &RecordFilter::new())
            .await
            .unwrap();
        assert_eq!(listed, vec![json!({"id": "c1"}), json!({"id": "c3"})]);
    }
}
