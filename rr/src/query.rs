//! ScopedQuery - immutable, chainable query builder
//!
//! Every chain method borrows the receiver and returns a new builder, so a
//! base scope can be shared and specialised freely. Conditions accumulate
//! (AND); `order_by`, `limit` and `offset` are last-call-wins. Relation names
//! passed to `includes` are checked against the schema when the builder is
//! made, so an unknown relation never reaches the backend.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use recordstore::{Backend, Direction, Filter, Order, QuerySpec, Record, RelationKind, Row, Schema};
use serde_json::Value;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{RecordError, RecordResult};

/// Chainable query over one entity table
pub struct ScopedQuery<T> {
    conn: Connection,
    schema: &'static Schema,
    filters: Vec<Filter>,
    order: Option<Order>,
    limit: Option<usize>,
    offset: Option<usize>,
    includes: Vec<&'static str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ScopedQuery<T> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            schema: self.schema,
            filters: self.filters.clone(),
            order: self.order.clone(),
            limit: self.limit,
            offset: self.offset,
            includes: self.includes.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ScopedQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedQuery")
            .field("table", &self.schema.table)
            .field("filters", &self.filters)
            .field("order", &self.order)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("includes", &self.includes)
            .finish()
    }
}

impl<T: Record> ScopedQuery<T> {
    /// Unscoped query over `schema`
    pub fn new(conn: Connection, schema: &'static Schema) -> Self {
        Self {
            conn,
            schema,
            filters: Vec::new(),
            order: None,
            limit: None,
            offset: None,
            includes: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Add an arbitrary condition
    #[must_use]
    pub fn filter(&self, filter: Filter) -> Self {
        let mut next = self.clone();
        next.filters.push(filter);
        next
    }

    /// `field = value` (a null value means `field IS NULL`)
    #[must_use]
    pub fn where_eq(&self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(field, value))
    }

    /// Several equality conditions at once
    #[must_use]
    pub fn where_conditions<I, K, V>(&self, conditions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut next = self.clone();
        next.filters
            .extend(conditions.into_iter().map(|(k, v)| Filter::eq(k.as_ref(), v)));
        next
    }

    #[must_use]
    pub fn where_null(&self, field: &str) -> Self {
        self.filter(Filter::is_null(field))
    }

    #[must_use]
    pub fn where_not_null(&self, field: &str) -> Self {
        self.filter(Filter::is_not_null(field))
    }

    /// Replace the sort key
    #[must_use]
    pub fn order_by(&self, field: &str, direction: Direction) -> Self {
        let mut next = self.clone();
        next.order = Some(Order::new(field, direction));
        next
    }

    #[must_use]
    pub fn limit(&self, limit: usize) -> Self {
        let mut next = self.clone();
        next.limit = Some(limit);
        next
    }

    #[must_use]
    pub fn offset(&self, offset: usize) -> Self {
        let mut next = self.clone();
        next.offset = Some(offset);
        next
    }

    /// Eager-load declared relations
    pub fn includes(&self, relations: &[&str]) -> RecordResult<Self> {
        let mut next = self.clone();
        for name in relations {
            let relation = self.schema.relation(name).ok_or_else(|| RecordError::Relationship {
                table: self.schema.table.to_string(),
                relation: name.to_string(),
                declared: self.schema.relation_names().join(", "),
            })?;
            if !next.includes.contains(&relation.name) {
                next.includes.push(relation.name);
            }
        }
        Ok(next)
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn included(&self) -> &[&'static str] {
        &self.includes
    }

    /// Compile to the backend-facing query
    pub fn to_spec(&self) -> QuerySpec {
        let (field, direction) = self.schema.default_order;
        QuerySpec {
            table: self.schema.table.to_string(),
            primary_key: self.schema.primary_key.to_string(),
            filters: self.filters.clone(),
            order: Some(self.order.clone().unwrap_or_else(|| Order::new(field, direction))),
            limit: self.limit,
            offset: self.offset,
        }
    }

    /// Every matching record, in order
    pub async fn all(&self) -> RecordResult<Vec<T>> {
        let rows = self.rows().await?;
        rows.into_iter().map(decode).collect()
    }

    /// First matching record
    pub async fn first(&self) -> RecordResult<Option<T>> {
        Ok(self.limit(1).all().await?.into_iter().next())
    }

    /// Number of matching records, ignoring limit and offset
    pub async fn count(&self) -> RecordResult<u64> {
        debug!(table = self.schema.table, "ScopedQuery::count: called");
        let backend = self.conn.backend()?;
        Ok(backend.count(&self.to_spec()).await?)
    }

    pub async fn exists(&self) -> RecordResult<bool> {
        Ok(self.count().await? > 0)
    }

    /// Matching rows with eager-loaded relations attached under their names
    pub async fn rows(&self) -> RecordResult<Vec<Row>> {
        debug!(table = self.schema.table, filters = self.filters.len(), "ScopedQuery::rows: called");
        let backend = self.conn.backend()?;
        let mut rows = backend.fetch(&self.to_spec()).await?;
        for name in &self.includes {
            self.load_relation(&backend, name, &mut rows).await?;
        }
        Ok(rows)
    }

    async fn load_relation(&self, backend: &Arc<dyn Backend>, name: &str, rows: &mut [Row]) -> RecordResult<()> {
        let Some(relation) = self.schema.relation(name) else {
            return Ok(());
        };
        let target = (relation.target)();
        debug!(relation = name, target = target.table, "ScopedQuery::load_relation: called");

        match relation.kind {
            RelationKind::BelongsTo => {
                let keys = distinct_values(rows.iter().filter_map(|r| r.get(relation.foreign_key)));
                let mut by_key: HashMap<String, Row> = HashMap::new();
                if !keys.is_empty() {
                    let spec = QuerySpec::new(target.table)
                        .with_primary_key(target.primary_key)
                        .filter(Filter::any_of(target.primary_key, keys));
                    for parent in backend.fetch(&spec).await? {
                        if let Some(key) = parent.get(target.primary_key).and_then(|v| v.as_str()) {
                            by_key.insert(key.to_string(), parent.clone());
                        }
                    }
                }
                for row in rows.iter_mut() {
                    let parent = row
                        .get(relation.foreign_key)
                        .and_then(|v| v.as_str())
                        .and_then(|k| by_key.get(k))
                        .cloned()
                        .map(Value::Object)
                        .unwrap_or(Value::Null);
                    row.insert(relation.name.to_string(), parent);
                }
            }
            RelationKind::HasMany => {
                let keys = distinct_values(rows.iter().filter_map(|r| r.get(self.schema.primary_key)));
                let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
                if !keys.is_empty() {
                    let (order_field, direction) = target.default_order;
                    let mut spec = QuerySpec::new(target.table)
                        .with_primary_key(target.primary_key)
                        .filter(Filter::any_of(relation.foreign_key, keys))
                        .order_by(order_field, direction);
                    if let Some(discard) = target.discard_field {
                        spec = spec.filter(Filter::is_null(discard));
                    }
                    for child in backend.fetch(&spec).await? {
                        if let Some(key) = child.get(relation.foreign_key).and_then(|v| v.as_str()) {
                            grouped.entry(key.to_string()).or_default().push(Value::Object(child.clone()));
                        }
                    }
                }
                for row in rows.iter_mut() {
                    let children = row
                        .get(self.schema.primary_key)
                        .and_then(|v| v.as_str())
                        .and_then(|k| grouped.get(k))
                        .cloned()
                        .unwrap_or_default();
                    row.insert(relation.name.to_string(), Value::Array(children));
                }
            }
        }
        Ok(())
    }
}

fn distinct_values<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<Value> {
    let mut seen: Vec<Value> = Vec::new();
    for value in values.filter(|v| !v.is_null()) {
        if !seen.contains(value) {
            seen.push(value.clone());
        }
    }
    seen
}

/// Convert a stored row into a typed record
pub(crate) fn decode<T: Record>(row: Row) -> RecordResult<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}
