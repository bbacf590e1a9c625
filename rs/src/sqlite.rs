//! SQLite backend storing rows as JSON documents
//!
//! All tables share one `records` table keyed by `(tbl, id)`. Filters and
//! ordering compile to `json_extract` expressions so the database does the
//! selection; semantics match the in-memory evaluator in [`crate::filter`].

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::DEFAULT_CHANGE_CAPACITY;
use crate::backend::{Backend, BackendError, ChangeEvent, ChangeKind, ChangeStream, Row, merge_patch, row_key};
use crate::filter::{Filter, FilterOp, QuerySpec};
use crate::schema::Schema;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS records (
    tbl  TEXT NOT NULL,
    id   TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (tbl, id)
);
";

/// Persistent [`Backend`] on a single SQLite database file
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteBackend {
    /// Open or create a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        debug!(path = %path.as_ref().display(), "SqliteBackend::open: called");
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Unavailable(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path.as_ref())?;
        let backend = Self::with_connection(conn)?;
        info!(path = %path.as_ref().display(), "Opened SQLite record store");
        Ok(backend)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, BackendError> {
        debug!("SqliteBackend::open_in_memory: called");
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch(SCHEMA_SQL)?;
        let (changes, _) = broadcast::channel(DEFAULT_CHANGE_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn notify(&self, table: &str, id: &str, kind: ChangeKind) {
        let _ = self.changes.send(ChangeEvent {
            table: table.to_string(),
            id: id.to_string(),
            kind,
        });
    }

    fn load(conn: &Connection, table: &str, id: &str) -> Result<Option<Row>, BackendError> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records WHERE tbl = ?1 AND id = ?2",
                params![table, id],
                |r| r.get(0),
            )
            .optional()?;
        data.map(|d| parse_row(&d)).transpose()
    }

    fn store(conn: &Connection, table: &str, id: &str, row: &Row) -> Result<(), BackendError> {
        let data = serde_json::to_string(row)?;
        conn.execute(
            "INSERT INTO records (tbl, id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(tbl, id) DO UPDATE SET data = excluded.data",
            params![table, id, data],
        )?;
        Ok(())
    }

    fn fetch_sync(&self, query: &QuerySpec) -> Result<Vec<Row>, BackendError> {
        let (sql, binds) = compile_select(query)?;
        debug!(%sql, "SqliteBackend::fetch_sync: compiled");
        let conn = self.conn.lock().map_err(|_| BackendError::Lock)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(binds), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter().map(|d| parse_row(d)).collect()
    }

    fn count_sync(&self, query: &QuerySpec) -> Result<u64, BackendError> {
        let (where_sql, binds) = compile_where(query)?;
        let sql = format!("SELECT COUNT(*) FROM records WHERE {}", where_sql);
        let conn = self.conn.lock().map_err(|_| BackendError::Lock)?;
        let count: i64 = conn.query_row(&sql, params_from_iter(binds), |r| r.get(0))?;
        Ok(count as u64)
    }

    fn insert_sync(&self, schema: &Schema, row: &Row) -> Result<String, BackendError> {
        let id = row_key(schema, row)?;
        let conn = self.conn.lock().map_err(|_| BackendError::Lock)?;
        if Self::load(&conn, schema.table, &id)?.is_some() {
            return Err(BackendError::Duplicate {
                table: schema.table.to_string(),
                id,
            });
        }
        Self::store(&conn, schema.table, &id, row)?;
        Ok(id)
    }

    fn update_sync(
        &self,
        schema: &Schema,
        id: &str,
        patch: Row,
        expected_version: Option<i64>,
    ) -> Result<Row, BackendError> {
        let mut conn = self.conn.lock().map_err(|_| BackendError::Lock)?;
        let tx = conn.transaction()?;
        let mut current = Self::load(&tx, schema.table, id)?.ok_or_else(|| BackendError::NotFound {
            table: schema.table.to_string(),
            id: id.to_string(),
        })?;
        merge_patch(schema, id, &mut current, patch, expected_version)?;
        Self::store(&tx, schema.table, id, &current)?;
        tx.commit()?;
        Ok(current)
    }

    fn delete_sync(&self, schema: &Schema, id: &str) -> Result<(), BackendError> {
        let conn = self.conn.lock().map_err(|_| BackendError::Lock)?;
        let removed = conn.execute(
            "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
            params![schema.table, id],
        )?;
        if removed == 0 {
            return Err(BackendError::NotFound {
                table: schema.table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn upsert_sync(&self, schema: &Schema, row: Row) -> Result<(String, Row, ChangeKind), BackendError> {
        let id = row_key(schema, &row)?;
        let mut conn = self.conn.lock().map_err(|_| BackendError::Lock)?;
        let tx = conn.transaction()?;
        let (stored, kind) = match Self::load(&tx, schema.table, &id)? {
            Some(mut current) => {
                merge_patch(schema, &id, &mut current, row, None)?;
                (current, ChangeKind::Updated)
            }
            None => (row, ChangeKind::Inserted),
        };
        Self::store(&tx, schema.table, &id, &stored)?;
        tx.commit()?;
        Ok((id, stored, kind))
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn fetch(&self, query: &QuerySpec) -> Result<Vec<Row>, BackendError> {
        debug!(table = %query.table, "SqliteBackend::fetch: called");
        self.fetch_sync(query)
    }

    async fn count(&self, query: &QuerySpec) -> Result<u64, BackendError> {
        debug!(table = %query.table, "SqliteBackend::count: called");
        self.count_sync(query)
    }

    async fn insert(&self, schema: &Schema, row: Row) -> Result<Row, BackendError> {
        debug!(table = schema.table, "SqliteBackend::insert: called");
        let id = self.insert_sync(schema, &row)?;
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
        debug!(table = schema.table, %id, ?expected_version, "SqliteBackend::update: called");
        let updated = self.update_sync(schema, id, patch, expected_version)?;
        self.notify(schema.table, id, ChangeKind::Updated);
        Ok(updated)
    }

    async fn delete(&self, schema: &Schema, id: &str) -> Result<(), BackendError> {
        debug!(table = schema.table, %id, "SqliteBackend::delete: called");
        self.delete_sync(schema, id)?;
        self.notify(schema.table, id, ChangeKind::Deleted);
        Ok(())
    }

    async fn upsert(&self, schema: &Schema, row: Row) -> Result<Row, BackendError> {
        debug!(table = schema.table, "SqliteBackend::upsert: called");
        let (id, stored, kind) = self.upsert_sync(schema, row)?;
        self.notify(schema.table, &id, kind);
        Ok(stored)
    }

    fn subscribe(&self) -> ChangeStream {
        debug!("SqliteBackend::subscribe: called");
        self.changes.subscribe()
    }
}

fn parse_row(data: &str) -> Result<Row, BackendError> {
    match serde_json::from_str::<Value>(data)? {
        Value::Object(map) => Ok(map),
        other => Err(BackendError::InvalidRow(format!("stored row is not an object: {}", other))),
    }
}

/// Column names are spliced into JSON paths, so only identifiers are allowed
fn json_path(field: &str) -> Result<String, BackendError> {
    let valid = !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(BackendError::InvalidRow(format!("invalid field name '{}'", field)));
    }
    Ok(format!("json_extract(data, '$.{}')", field))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn compile_filter(filter: &Filter, binds: &mut Vec<SqlValue>) -> Result<String, BackendError> {
    let col = json_path(&filter.field)?;
    let sql = match filter.op {
        FilterOp::IsNull => format!("{} IS NULL", col),
        FilterOp::IsNotNull => format!("{} IS NOT NULL", col),
        FilterOp::Eq if filter.value.is_null() => "0".to_string(),
        FilterOp::Eq => {
            binds.push(to_sql(&filter.value));
            format!("{} = ?", col)
        }
        FilterOp::Ne if filter.value.is_null() => "1".to_string(),
        FilterOp::Ne => {
            binds.push(to_sql(&filter.value));
            format!("({0} IS NULL OR {0} != ?)", col)
        }
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            let op = match filter.op {
                FilterOp::Gt => ">",
                FilterOp::Gte => ">=",
                FilterOp::Lt => "<",
                _ => "<=",
            };
            binds.push(to_sql(&filter.value));
            format!("{} {} ?", col, op)
        }
        FilterOp::In => {
            let candidates: Vec<&Value> = match &filter.value {
                Value::Array(values) => values.iter().filter(|v| !v.is_null()).collect(),
                _ => Vec::new(),
            };
            if candidates.is_empty() {
                "0".to_string()
            } else {
                let placeholders = vec!["?"; candidates.len()].join(", ");
                binds.extend(candidates.into_iter().map(to_sql));
                format!("{} IN ({})", col, placeholders)
            }
        }
    };
    Ok(sql)
}

fn compile_where(query: &QuerySpec) -> Result<(String, Vec<SqlValue>), BackendError> {
    let mut binds = vec![SqlValue::Text(query.table.clone())];
    let mut clauses = vec!["tbl = ?".to_string()];
    for filter in &query.filters {
        clauses.push(compile_filter(filter, &mut binds)?);
    }
    Ok((clauses.join(" AND "), binds))
}

fn compile_select(query: &QuerySpec) -> Result<(String, Vec<SqlValue>), BackendError> {
    let (where_sql, mut binds) = compile_where(query)?;
    let order = query.effective_order();
    let mut sql = format!(
        "SELECT data FROM records WHERE {} ORDER BY {} {}, {} ASC",
        where_sql,
        json_path(&order.field)?,
        order.direction.as_sql(),
        json_path(&query.primary_key)?,
    );
    if query.limit.is_some() || query.offset.is_some() {
        sql.push_str(" LIMIT ? OFFSET ?");
        binds.push(SqlValue::Integer(query.limit.map(|l| l as i64).unwrap_or(-1)));
        binds.push(SqlValue::Integer(query.offset.unwrap_or(0) as i64));
    }
    Ok((sql, binds))
}
