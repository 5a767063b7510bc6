//! Storage adapter boundary for definitions, execution records and
//! checkpoints.
//!
//! Records travel as JSON values keyed by `(kind, id)`. Adapters live here
//! (in-memory) and in `taskflow-infra` (file, SQLite); the engine is generic
//! over [`StorageAdapter`].

pub mod memory;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use taskflow_types::error::StorageError;

pub use memory::InMemoryStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Definition,
    Execution,
    Checkpoint,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Definition,
        RecordKind::Execution,
        RecordKind::Checkpoint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Definition => "definition",
            RecordKind::Execution => "execution",
            RecordKind::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality match on top-level record fields, plus an optional limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub equals: Vec<(String, Value)>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((name.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.equals
            .iter()
            .all(|(name, expected)| record.get(name) == Some(expected))
    }
}

/// Pluggable persistence. `list` returns records ordered by id.
pub trait StorageAdapter: Send + Sync {
    fn save(
        &self,
        kind: RecordKind,
        id: &str,
        record: &Value,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn load(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> impl Future<Output = Result<Option<Value>, StorageError>> + Send;

    fn list(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> impl Future<Output = Result<Vec<Value>, StorageError>> + Send;

    /// Returns whether a record was removed.
    fn delete(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;
}

impl<T: StorageAdapter> StorageAdapter for Arc<T> {
    fn save(
        &self,
        kind: RecordKind,
        id: &str,
        record: &Value,
    ) -> impl Future<Output = Result<(), StorageError>> + Send {
        (**self).save(kind, id, record)
    }

    fn load(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> impl Future<Output = Result<Option<Value>, StorageError>> + Send {
        (**self).load(kind, id)
    }

    fn list(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> impl Future<Output = Result<Vec<Value>, StorageError>> + Send {
        (**self).list(kind, filter)
    }

    fn delete(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send {
        (**self).delete(kind, id)
    }
}
