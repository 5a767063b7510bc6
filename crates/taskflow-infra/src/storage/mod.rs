//! Storage adapter selection.
//!
//! `AnyStorage` lets a host pick the backend from `config.toml` at runtime
//! while the engine stays generic over a single `StorageAdapter` type.

pub mod file;

use anyhow::Context;
use serde_json::Value;
use taskflow_core::store::{InMemoryStorage, RecordFilter, RecordKind, StorageAdapter};
use taskflow_types::config::StorageConfig;
use taskflow_types::error::StorageError;

use crate::sqlite::{DatabasePool, SqliteStorage};

pub use file::FileStorage;

pub enum AnyStorage {
    Memory(InMemoryStorage),
    File(FileStorage),
    Sqlite(SqliteStorage),
}

impl AnyStorage {
    pub fn backend(&self) -> &'static str {
        match self {
            AnyStorage::Memory(_) => "memory",
            AnyStorage::File(_) => "file",
            AnyStorage::Sqlite(_) => "sqlite",
        }
    }
}

/// Open the adapter named by `config`.
pub async fn open_storage(config: &StorageConfig) -> anyhow::Result<AnyStorage> {
    let storage = match config {
        StorageConfig::Memory => AnyStorage::Memory(InMemoryStorage::new()),
        StorageConfig::File { root } => {
            tokio::fs::create_dir_all(root)
                .await
                .with_context(|| format!("failed to create storage root {}", root.display()))?;
            AnyStorage::File(FileStorage::new(root.clone()))
        }
        StorageConfig::Sqlite { path } => {
            let pool = DatabasePool::open(path)
                .await
                .with_context(|| format!("failed to open sqlite database {}", path.display()))?;
            AnyStorage::Sqlite(SqliteStorage::new(pool))
        }
    };
    tracing::info!(backend = storage.backend(), "storage opened");
    Ok(storage)
}

impl StorageAdapter for AnyStorage {
    async fn save(&self, kind: RecordKind, id: &str, record: &Value) -> Result<(), StorageError> {
        match self {
            AnyStorage::Memory(s) => s.save(kind, id, record).await,
            AnyStorage::File(s) => s.save(kind, id, record).await,
            AnyStorage::Sqlite(s) => s.save(kind, id, record).await,
        }
    }

    async fn load(&self, kind: RecordKind, id: &str) -> Result<Option<Value>, StorageError> {
        match self {
            AnyStorage::Memory(s) => s.load(kind, id).await,
            AnyStorage::File(s) => s.load(kind, id).await,
            AnyStorage::Sqlite(s) => s.load(kind, id).await,
        }
    }

    async fn list(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<Value>, StorageError> {
        match self {
            AnyStorage::Memory(s) => s.list(kind, filter).await,
            AnyStorage::File(s) => s.list(kind, filter).await,
            AnyStorage::Sqlite(s) => s.list(kind, filter).await,
        }
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StorageError> {
        match self {
            AnyStorage::Memory(s) => s.delete(kind, id).await,
            AnyStorage::File(s) => s.delete(kind, id).await,
            AnyStorage::Sqlite(s) => s.delete(kind, id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_each_backend() {
        let dir = tempfile::tempdir().unwrap();
        let configs = [
            StorageConfig::Memory,
            StorageConfig::File {
                root: dir.path().join("records"),
            },
            StorageConfig::Sqlite {
                path: dir.path().join("db/taskflow.db"),
            },
        ];

        for config in &configs {
            let storage = open_storage(config).await.unwrap();
            storage
                .save(RecordKind::Execution, "e1", &json!({"status": "pending"}))
                .await
                .unwrap();
            assert_eq!(
                storage.load(RecordKind::Execution, "e1").await.unwrap(),
                Some(json!({"status": "pending"})),
                "{}",
                storage.backend()
            );
        }
    }

    #[tokio::test]
    async fn test_open_sqlite_in_unwritable_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let result = open_storage(&StorageConfig::Sqlite {
            path: blocker.join("taskflow.db"),
        })
        .await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("failed to open sqlite database"));
    }
}
