//! In-memory storage adapter backed by `DashMap`.

use dashmap::DashMap;
use serde_json::Value;
use taskflow_types::error::StorageError;

use super::{RecordFilter, RecordKind, StorageAdapter};

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: DashMap<(RecordKind, String), Value>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl StorageAdapter for InMemoryStorage {
    async fn save(&self, kind: RecordKind, id: &str, record: &Value) -> Result<(), StorageError> {
        self.records.insert((kind, id.to_string()), record.clone());
        Ok(())
    }

    async fn load(&self, kind: RecordKind, id: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .records
            .get(&(kind, id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn list(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<Value>, StorageError> {
        let mut matched: Vec<(String, Value)> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == kind && filter.matches(entry.value()))
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().take(limit).map(|(_, v)| v).collect())
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StorageError> {
        Ok(self.records.remove(&(kind, id.to_string())).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_load_delete() {
        let storage = InMemoryStorage::new();
        storage
            .save(RecordKind::Checkpoint, "c1", &json!({"id": "c1"}))
            .await
            .unwrap();

        assert_eq!(
            storage.load(RecordKind::Checkpoint, "c1").await.unwrap(),
            Some(json!({"id": "c1"}))
        );
        assert_eq!(storage.load(RecordKind::Execution, "c1").await.unwrap(), None);

        assert!(storage.delete(RecordKind::Checkpoint, "c1").await.unwrap());
        assert!(!storage.delete(RecordKind::Checkpoint, "c1").await.unwrap());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_sorts_and_limits() {
        let storage = InMemoryStorage::new();
        for (id, exec) in [("c3", "e1"), ("c1", "e1"), ("c2", "e2")] {
            storage
                .save(RecordKind::Checkpoint, id, &json!({"id": id, "execution_id": exec}))
                .await
                .unwrap();
        }
        storage
            .save(RecordKind::Execution, "e1", &json!({"id": "e1"}))
            .await
            .unwrap();

        let filter = RecordFilter::new().field("execution_id", "e1");
        let ids: Vec<Value> = storage
            .list(RecordKind::Checkpoint, &filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("c1"), json!("c3")]);

        let limited = storage
            .list(RecordKind::Checkpoint, &RecordFilter::new().limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
