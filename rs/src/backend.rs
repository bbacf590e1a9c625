//! Backend trait: the query/mutate/subscribe protocol every store implements
//!
//! Backends are dumb row stores. Validation, id assignment and timestamps
//! belong to the layers above; the only rule a backend enforces itself is the
//! `lock_version` compare-and-swap on versioned tables.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::filter::QuerySpec;
use crate::schema::Schema;

/// A stored row: a JSON object keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Live subscription to backend changes; dropping it disposes the subscription
pub type ChangeStream = broadcast::Receiver<ChangeEvent>;

/// Errors raised by backends
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("Version conflict on {table}/{id}: expected {expected}, found {actual}")]
    Conflict {
        table: String,
        id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Duplicate record: {table}/{id}")]
    Duplicate { table: String, id: String },

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock poisoned")]
    Lock,
}

impl BackendError {
    /// Failures that may succeed when retried unchanged
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Lock)
            || matches!(
                self,
                Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                    if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            )
    }
}

/// Kind of change carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// Notification pushed to subscribers after every successful write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub id: String,
    pub kind: ChangeKind,
}

/// Query and mutation protocol for one logical data store
#[async_trait]
pub trait Backend: Send + Sync {
    /// Rows matching the query, ordered and paginated
    async fn fetch(&self, query: &QuerySpec) -> Result<Vec<Row>, BackendError>;

    /// Number of rows matching the query filters, ignoring pagination
    async fn count(&self, query: &QuerySpec) -> Result<u64, BackendError>;

    /// Insert a new row; the row must carry the schema's primary key
    async fn insert(&self, schema: &Schema, row: Row) -> Result<Row, BackendError>;

    /// Merge `patch` into an existing row
    ///
    /// When `expected_version` is set the stored `lock_version` must match or
    /// the call fails with [`BackendError::Conflict`]. Versioned schemas get
    /// their `lock_version` incremented on every update.
    async fn update(
        &self,
        schema: &Schema,
        id: &str,
        patch: Row,
        expected_version: Option<i64>,
    ) -> Result<Row, BackendError>;

    /// Remove a row permanently
    async fn delete(&self, schema: &Schema, id: &str) -> Result<(), BackendError>;

    /// Insert the row, or merge it into the existing row with the same key
    async fn upsert(&self, schema: &Schema, row: Row) -> Result<Row, BackendError>;

    /// Subscribe to change notifications for every table
    fn subscribe(&self) -> ChangeStream;
}

/// Primary key of a row, validated as a non-empty string
pub(crate) fn row_key(schema: &Schema, row: &Row) -> Result<String, BackendError> {
    match row.get(schema.primary_key) {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(BackendError::InvalidRow(format!(
            "{} row is missing primary key '{}'",
            schema.table, schema.primary_key
        ))),
    }
}

/// Current lock_version of a row (0 when absent)
pub(crate) fn row_version(row: &Row) -> i64 {
    row.get("lock_version").and_then(|v| v.as_i64()).unwrap_or(0)
}

/// Merge a patch into a stored row, applying the version check and bump
pub(crate) fn merge_patch(
    schema: &Schema,
    id: &str,
    current: &mut Row,
    patch: Row,
    expected_version: Option<i64>,
) -> Result<(), BackendError> {
    let actual = row_version(current);
    if let Some(expected) = expected_version
        && expected != actual
    {
        return Err(BackendError::Conflict {
            table: schema.table.to_string(),
            id: id.to_string(),
            expected,
            actual,
        });
    }

    let previous_update = current.get("updated_at").and_then(|v| v.as_i64());
    let stamps_update = patch.contains_key("updated_at");
    for (key, value) in patch {
        if key == schema.primary_key || key == "lock_version" {
            continue;
        }
        current.insert(key, value);
    }

    // writers with their own clocks may stamp the same millisecond
    if stamps_update
        && let Some(previous) = previous_update
        && current.get("updated_at").and_then(|v| v.as_i64()).is_none_or(|next| next <= previous)
    {
        current.insert("updated_at".to_string(), serde_json::Value::from(previous + 1));
    }

    if schema.versioned {
        current.insert("lock_version".to_string(), serde_json::Value::from(actual + 1));
    }
    Ok(())
}
