//! RecordStore - schema-described record tables behind a pluggable backend
//!
//! Rows are JSON objects keyed by table and primary key. Every entity type
//! describes itself with a static [`Schema`] (table name, primary key, required
//! fields, relations, soft-delete column) and implements [`Record`] so typed
//! layers above can convert rows back and forth.
//!
//! # Architecture
//!
//! ```text
//! QuerySpec ──► Backend::fetch / count      (read side)
//! Row       ──► Backend::insert / update / delete / upsert   (write side)
//!               Backend::subscribe ──► ChangeEvent stream    (live side)
//! ```
//!
//! Two backends ship with the crate: [`MemoryBackend`] for tests and
//! short-lived processes, and [`SqliteBackend`] for persistent stores.
//!
//! # Example
//!
//! ```ignore
//! use recordstore::{Backend, MemoryBackend, QuerySpec, Filter};
//!
//! let backend = MemoryBackend::new();
//! let rows = backend.fetch(&QuerySpec::new("jobs").filter(Filter::eq("status", "open"))).await?;
//! ```

mod backend;
mod clock;
mod filter;
mod id;
mod memory;
mod schema;
mod sqlite;

pub use backend::{Backend, BackendError, ChangeEvent, ChangeKind, ChangeStream, Row};
pub use clock::{Clock, SystemClock, now_ms};
pub use filter::{Direction, Filter, FilterOp, Order, QuerySpec, compare_values};
pub use id::{generate_id, is_valid_uuid};
pub use memory::MemoryBackend;
pub use schema::{Field, IdFormat, Record, Relation, RelationKind, Schema, SortKey};
pub use sqlite::SqliteBackend;

/// Default broadcast capacity for backend change streams
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;
