//! In-process backend backed by ordered maps
//!
//! Useful for tests and for short-lived tools that do not need persistence.
//! `inject_failures` simulates a flaky transport and `set_latency` a slow one,
//! so the retry and loading paths of the layers above can be exercised
//! deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::DEFAULT_CHANGE_CAPACITY;
use crate::backend::{Backend, BackendError, ChangeEvent, ChangeKind, ChangeStream, Row, merge_patch, row_key};
use crate::filter::QuerySpec;
use crate::schema::Schema;

type Table = BTreeMap<String, Row>;

/// Thread-safe in-memory [`Backend`]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Table>>,
    changes: broadcast::Sender<ChangeEvent>,
    pending_failures: AtomicUsize,
    latency_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        debug!("MemoryBackend::new: called");
        let (changes, _) = broadcast::channel(DEFAULT_CHANGE_CAPACITY);
        Self {
            tables: RwLock::new(HashMap::new()),
            changes,
            pending_failures: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Make the next `count` read operations fail with [`BackendError::Unavailable`]
    pub fn inject_failures(&self, count: usize) {
        debug!(count, "MemoryBackend::inject_failures: called");
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every read by `latency`
    pub fn set_latency(&self, latency: Duration) {
        debug!(?latency, "MemoryBackend::set_latency: called");
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Number of rows stored in `table`
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(table).map(|t| t.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn take_failure(&self) -> Result<(), BackendError> {
        let taken = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            debug!("MemoryBackend: injected failure");
            return Err(BackendError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn notify(&self, table: &str, id: &str, kind: ChangeKind) {
        // no subscribers is fine
        let _ = self.changes.send(ChangeEvent {
            table: table.to_string(),
            id: id.to_string(),
            kind,
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch(&self, query: &QuerySpec) -> Result<Vec<Row>, BackendError> {
        debug!(table = %query.table, filters = query.filters.len(), "MemoryBackend::fetch: called");
        self.simulate_latency().await;
        self.take_failure()?;
        let tables = self.tables.read().map_err(|_| BackendError::Lock)?;
        let rows = match tables.get(&query.table) {
            Some(table) => query.apply(table.values().cloned()),
            None => Vec::new(),
        };
        Ok(rows)
    }

    async fn count(&self, query: &QuerySpec) -> Result<u64, BackendError> {
        debug!(table = %query.table, "MemoryBackend::count: called");
        self.simulate_latency().await;
        self.take_failure()?;
        let tables = self.tables.read().map_err(|_| BackendError::Lock)?;
        Ok(tables.get(&query.table).map(|t| query.count(t.values())).unwrap_or(0))
    }

    async fn insert(&self, schema: &Schema, row: Row) -> Result<Row, BackendError> {
        let id = row_key(schema, &row)?;
        debug!(table = schema.table, %id, "MemoryBackend::insert: called");
        {
            let mut tables = self.tables.write().map_err(|_| BackendError::Lock)?;
            let table = tables.entry(schema.table.to_string()).or_default();
            if table.contains_key(&id) {
                return Err(BackendError::Duplicate {
                    table: schema.table.to_string(),
                    id,
                });
            }
            table.insert(id.clone(), row.clone());
        }
        self.notify(schema.table, &id, ChangeKind::Inserted);
        Ok(row)
    }

    async fn update(
        &self,
        schema: &Schema,
        id: &str,
        patch: Row,
        expected_version: Option<i64>,
    ) -> Result<Row, BackendError> {
        debug!(table = schema.table, %id, ?expected_version, "MemoryBackend::update: called");
        let updated = {
            let mut tables = self.tables.write().map_err(|_| BackendError::Lock)?;
            let current = tables
                .get_mut(schema.table)
                .and_then(|t| t.get_mut(id))
                .ok_or_else(|| BackendError::NotFound {
                    table: schema.table.to_string(),
                    id: id.to_string(),
                })?;
            merge_patch(schema, id, current, patch, expected_version)?;
            current.clone()
        };
        self.notify(schema.table, id, ChangeKind::Updated);
        Ok(updated)
    }

    async fn delete(&self, schema: &Schema, id: &str) -> Result<(), BackendError> {
        debug!(table = schema.table, %id, "MemoryBackend::delete: called");
        {
            let mut tables = self.tables.write().map_err(|_| BackendError::Lock)?;
            let removed = tables.get_mut(schema.table).and_then(|t| t.remove(id));
            if removed.is_none() {
                return Err(BackendError::NotFound {
                    table: schema.table.to_string(),
                    id: id.to_string(),
                });
            }
        }
        self.notify(schema.table, id, ChangeKind::Deleted);
        Ok(())
    }

    async fn upsert(&self, schema: &Schema, row: Row) -> Result<Row, BackendError> {
        let id = row_key(schema, &row)?;
        debug!(table = schema.table, %id, "MemoryBackend::upsert: called");
        let (stored, kind) = {
            let mut tables = self.tables.write().map_err(|_| BackendError::Lock)?;
            let table = tables.entry(schema.table.to_string()).or_default();
            match table.get_mut(&id) {
                Some(current) => {
                    merge_patch(schema, &id, current, row, None)?;
                    (current.clone(), ChangeKind::Updated)
                }
                None => {
                    table.insert(id.clone(), row.clone());
                    (row, ChangeKind::Inserted)
                }
            }
        };
        self.notify(schema.table, &id, kind);
        Ok(stored)
    }

    fn subscribe(&self) -> ChangeStream {
        debug!("MemoryBackend::subscribe: called");
        self.changes.subscribe()
    }
}
