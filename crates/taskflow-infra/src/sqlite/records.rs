//! SQLite storage adapter.
//!
//! Implements `StorageAdapter` from `taskflow-core` over the `records` table:
//! one row per `(kind, id)` holding the record as JSON text. Writes go
//! through the single-connection writer pool, loads and listings through
//! the reader pool.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use taskflow_core::store::{RecordFilter, RecordKind, StorageAdapter};
use taskflow_types::error::StorageError;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `StorageAdapter`.
pub struct SqliteStorage {
    pool: DatabasePool,
}

impl SqliteStorage {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Connection(err.to_string())
        }
        other => StorageError::Query(other.to_string()),
    }
}

fn decode_body(row: &sqlx::sqlite::SqliteRow) -> Result<Value, StorageError> {
    let body: String = row.try_get("body").map_err(storage_error)?;
    Ok(serde_json::from_str(&body)?)
}

// ---------------------------------------------------------------------------
// StorageAdapter implementation
// ---------------------------------------------------------------------------

impl StorageAdapter for SqliteStorage {
    async fn save(&self, kind: RecordKind, id: &str, record: &Value) -> Result<(), StorageError> {
        let body = serde_json::to_string(record)?;
        sqlx::query(
            r#"INSERT INTO records (kind, id, body, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (kind, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at"#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(&body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn load(&self, kind: RecordKind, id: &str) -> Result<Option<Value>, StorageError> {
        let row = sqlx::query("SELECT body FROM records WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(storage_error)?;

        row.as_ref().map(decode_body).transpose()
    }

    async fn list(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<Value>, StorageError> {
        let rows = sqlx::query("SELECT body FROM records WHERE kind = ? ORDER BY id")
            .bind(kind.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(storage_error)?;

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut matched = Vec::new();
        for row in &rows {
            if matched.len() >= limit {
                break;
            }
            let record = match decode_body(row) {
                Ok(record) => record,
                Err(StorageError::Serialization(e)) => {
                    tracing::warn!(kind = %kind, error = %e, "skipping unreadable record");
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
        let result = sqlx::query("DELETE FROM records WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected() > 0)
    }
}
