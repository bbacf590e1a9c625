//! Mutation layer - create, update, discard, undiscard, destroy, upsert
//!
//! One-shot writes. Validation and not-found errors are raised immediately;
//! backend failures are wrapped and returned without retry.

use std::marker::PhantomData;

use recordstore::{Direction, Filter, IdFormat, QuerySpec, Record, Row, Schema, SortKey, generate_id, is_valid_uuid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{BASE, Errors, RecordError, RecordResult};
use crate::position::place;
use crate::query::decode;

/// Columns managed by the mutation layer and never accepted in a patch
const PROTECTED: [&str; 2] = ["created_at", "updated_at"];

/// Field-to-value changes for an update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Row);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    #[must_use]
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn as_row(&self) -> &Row {
        &self.0
    }

    pub fn into_row(self) -> Row {
        self.0
    }

    /// Patch holding every field of a serializable struct
    pub fn from_serializable<S: Serialize>(value: &S) -> RecordResult<Self> {
        match serde_json::to_value(value)? {
            Value::Object(row) => Ok(Self(row)),
            other => Err(RecordError::Configuration(format!(
                "expected an object for a patch, got {other}"
            ))),
        }
    }
}

impl From<Row> for Patch {
    fn from(row: Row) -> Self {
        Self(row)
    }
}

/// Outcome of a hard delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destroyed {
    pub id: String,
}

/// Write operations for one entity table
pub struct MutationLayer<T> {
    conn: Connection,
    schema: &'static Schema,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for MutationLayer<T> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            schema: self.schema,
            _marker: PhantomData,
        }
    }
}

impl<T: Record> MutationLayer<T> {
    pub fn new(conn: Connection, schema: &'static Schema) -> Self {
        Self {
            conn,
            schema,
            _marker: PhantomData,
        }
    }

    /// Validate `data`, stamp identity and timestamps, insert
    pub async fn create<D: Serialize>(&self, data: &D) -> RecordResult<T> {
        debug!(table = self.schema.table, "MutationLayer::create: called");
        let mut row = Patch::from_serializable(data)?.into_row();
        self.validate_create(&row)?;
        self.prepare_new(&mut row).await?;

        let now = self.conn.now_ms();
        row.insert(self.schema.primary_key.to_string(), Value::String(generate_id()));
        self.stamp_new(&mut row, now);

        let backend = self.conn.backend()?;
        let stored = backend.insert(self.schema, row).await?;
        info!(table = self.schema.table, id = ?stored.get(self.schema.primary_key), "Record created");
        decode(stored)
    }

    /// Apply `patch` to an existing record
    pub async fn update(&self, id: &str, patch: Patch) -> RecordResult<T> {
        self.write_patch(id, patch, None).await
    }

    /// Apply `patch` only if the stored `lock_version` equals `expected`
    pub async fn update_if_version(&self, id: &str, patch: Patch, expected: i64) -> RecordResult<T> {
        if !self.schema.versioned {
            return Err(RecordError::Configuration(format!(
                "{} does not carry a lock_version",
                self.schema.table
            )));
        }
        self.write_patch(id, patch, Some(expected)).await
    }

    async fn write_patch(&self, id: &str, patch: Patch, expected: Option<i64>) -> RecordResult<T> {
        debug!(table = self.schema.table, %id, ?expected, "MutationLayer::update: called");
        self.check_id(id)?;
        self.validate_patch(&patch)?;

        let mut row = patch.into_row();
        row.insert("updated_at".to_string(), Value::from(self.conn.now_ms()));

        let backend = self.conn.backend()?;
        let stored = backend.update(self.schema, id, row, expected).await?;
        decode(stored)
    }

    /// Soft-delete; a record that is already discarded is returned untouched
    pub async fn discard(&self, id: &str) -> RecordResult<T> {
        debug!(table = self.schema.table, %id, "MutationLayer::discard: called");
        self.toggle_discard(id, true).await
    }

    /// Restore a discarded record; a kept record is returned untouched
    pub async fn undiscard(&self, id: &str) -> RecordResult<T> {
        debug!(table = self.schema.table, %id, "MutationLayer::undiscard: called");
        self.toggle_discard(id, false).await
    }

    async fn toggle_discard(&self, id: &str, discard: bool) -> RecordResult<T> {
        let field = self.schema.discard_field.ok_or_else(|| {
            RecordError::Configuration(format!("{} does not support discarding", self.schema.table))
        })?;
        self.check_id(id)?;

        let current = self
            .fetch_row(id)
            .await?
            .ok_or_else(|| RecordError::not_found(self.schema.table, id))?;
        let is_discarded = current.get(field).is_some_and(|v| !v.is_null());
        if is_discarded == discard {
            debug!(table = self.schema.table, %id, discard, "MutationLayer::toggle_discard: already in state");
            return decode(current);
        }

        let now = self.conn.now_ms();
        let mut row = Row::new();
        row.insert(field.to_string(), if discard { Value::from(now) } else { Value::Null });
        row.insert("updated_at".to_string(), Value::from(now));

        let backend = self.conn.backend()?;
        let stored = backend.update(self.schema, id, row, None).await?;
        info!(table = self.schema.table, %id, discard, "Record discard state changed");
        decode(stored)
    }

    /// Hard delete
    pub async fn destroy(&self, id: &str) -> RecordResult<Destroyed> {
        debug!(table = self.schema.table, %id, "MutationLayer::destroy: called");
        self.check_id(id)?;
        let backend = self.conn.backend()?;
        backend.delete(self.schema, id).await?;
        info!(table = self.schema.table, %id, "Record destroyed");
        Ok(Destroyed { id: id.to_string() })
    }

    /// Update when `patch` names an existing record, create otherwise
    pub async fn upsert(&self, mut patch: Patch) -> RecordResult<T> {
        debug!(table = self.schema.table, "MutationLayer::upsert: called");
        let id = match patch.remove(self.schema.primary_key) {
            None | Some(Value::Null) => return self.create(&patch).await,
            Some(Value::String(id)) => id,
            Some(other) => {
                return Err(RecordError::invalid(
                    self.schema.table,
                    self.schema.primary_key,
                    format!("Id must be a string, got {other}"),
                ));
            }
        };
        self.check_id(&id)?;

        if self.fetch_row(&id).await?.is_some() {
            return self.update(&id, patch).await;
        }

        let mut row = patch.into_row();
        self.validate_create(&row)?;
        self.prepare_new(&mut row).await?;
        let now = self.conn.now_ms();
        row.insert(self.schema.primary_key.to_string(), Value::String(id));
        self.stamp_new(&mut row, now);

        let backend = self.conn.backend()?;
        decode(backend.upsert(self.schema, row).await?)
    }

    /// Reject ids that cannot name a record of this schema
    pub(crate) fn check_id(&self, id: &str) -> RecordResult<()> {
        let valid = match self.schema.id_format {
            IdFormat::Uuid => is_valid_uuid(id),
            IdFormat::Opaque => !id.trim().is_empty(),
        };
        if valid {
            Ok(())
        } else {
            Err(RecordError::invalid(
                self.schema.table,
                self.schema.primary_key,
                "Id is not a valid UUID",
            ))
        }
    }

    pub(crate) async fn fetch_row(&self, id: &str) -> RecordResult<Option<Row>> {
        let backend = self.conn.backend()?;
        let spec = QuerySpec::new(self.schema.table)
            .with_primary_key(self.schema.primary_key)
            .filter(Filter::eq(self.schema.primary_key, id))
            .limit(1);
        Ok(backend.fetch(&spec).await?.into_iter().next())
    }

    /// Fill defaulted fields and the sort key of a row about to be inserted
    async fn prepare_new(&self, row: &mut Row) -> RecordResult<()> {
        for field in self.schema.fields {
            if let Some(default) = field.default
                && row.get(field.name).is_none_or(Value::is_null)
            {
                row.insert(field.name.to_string(), default());
            }
        }
        if let Some(key) = self.schema.sort_key {
            self.assign_sort_key(key, row).await?;
        }
        Ok(())
    }

    /// Place a new row after its last kept sibling, or check an explicit key is free
    async fn assign_sort_key(&self, key: SortKey, row: &mut Row) -> RecordResult<()> {
        let mut spec = QuerySpec::new(self.schema.table)
            .with_primary_key(self.schema.primary_key)
            .order_by(key.field, Direction::Asc);
        for scope in key.scope {
            spec = spec.filter(Filter::eq(*scope, row.get(*scope).cloned().unwrap_or(Value::Null)));
        }
        if let Some(discard) = self.schema.discard_field {
            spec = spec.filter(Filter::is_null(discard));
        }

        let backend = self.conn.backend()?;
        let siblings: Vec<(String, f64)> = backend
            .fetch(&spec)
            .await?
            .into_iter()
            .filter_map(|r| {
                let id = r.get(self.schema.primary_key)?.as_str()?.to_string();
                Some((id, r.get(key.field)?.as_f64()?))
            })
            .collect();

        match row.get(key.field) {
            None | Some(Value::Null) => {}
            Some(value) => {
                let message = format!("{} must be a finite number", humanize(key.field));
                let position = value
                    .as_f64()
                    .filter(|p| p.is_finite())
                    .ok_or_else(|| RecordError::invalid(self.schema.table, key.field, message))?;
                if siblings.iter().any(|(_, p)| *p == position) {
                    return Err(RecordError::invalid(
                        self.schema.table,
                        key.field,
                        format!("{} is already taken", humanize(key.field)),
                    ));
                }
                return Ok(());
            }
        }

        let placement = place(&siblings, siblings.len())
            .map_err(|e| RecordError::invalid(self.schema.table, key.field, e.to_string()))?;
        if let Some(renumbered) = &placement.renumbered {
            info!(table = self.schema.table, count = renumbered.len(), "Renumbering siblings");
            for ((id, old), (_, new)) in siblings.iter().zip(renumbered) {
                if old != new {
                    self.write_patch(id, Patch::new().set(key.field, *new), None).await?;
                }
            }
        }
        row.insert(key.field.to_string(), Value::from(placement.position));
        Ok(())
    }

    fn stamp_new(&self, row: &mut Row, now: i64) {
        row.insert("created_at".to_string(), Value::from(now));
        row.insert("updated_at".to_string(), Value::from(now));
        if let Some(field) = self.schema.discard_field {
            row.insert(field.to_string(), Value::Null);
        }
        if self.schema.versioned {
            row.insert("lock_version".to_string(), Value::from(0));
        }
    }

    fn validate_create(&self, row: &Row) -> RecordResult<()> {
        let mut errors = Errors::default();
        for field in self.schema.fields {
            if let Some(message) = field.required
                && is_blank(row.get(field.name))
            {
                errors.add(field.name, message);
            }
        }
        errors.into_result(self.schema.table)
    }

    fn validate_patch(&self, patch: &Patch) -> RecordResult<()> {
        if patch.is_empty() {
            return Err(RecordError::invalid(self.schema.table, BASE, "Update data is required"));
        }

        let mut errors = Errors::default();
        for name in patch.fields() {
            let value = patch.get(name);
            if name == self.schema.primary_key {
                errors.add(name, "Id cannot be changed");
            } else if PROTECTED.contains(&name.as_str()) {
                errors.add(name, format!("{} cannot be changed", humanize(name)));
            } else if let Some(field) = self.schema.field(name) {
                if let Some(message) = field.required
                    && is_blank(value)
                {
                    errors.add(name, message);
                } else if !field.nullable && value.is_some_and(Value::is_null) {
                    errors.add(name, format!("{} cannot be null", humanize(name)));
                }
            }
        }
        errors.into_result(self.schema.table)
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// `created_at` -> `Created at`
fn humanize(field: &str) -> String {
    let spaced = field.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Client, ClientType, Job, JobStatus, NewClient, NewJob};
    use recordstore::MemoryBackend;
    use std::sync::Arc;

    fn conn() -> Connection {
        Connection::connected(Arc::new(MemoryBackend::new()))
    }

    async fn acme(conn: &Connection) -> Client {
        MutationLayer::<Client>::new(conn.clone(), Client::schema())
            .create(&NewClient::new("Acme", ClientType::Residential))
            .await
            .unwrap()
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("created_at"), "Created at");
        assert_eq!(humanize(""), "");
    }

    #[test]
    fn test_patch_builder() {
        let patch = Patch::new().set("title", "x").set("status", "open");
        assert_eq!(patch.len(), 2);
        assert_eq!(patch.get("title"), Some(&Value::from("x")));
    }

    #[tokio::test]
    async fn test_create_stamps_identity() {
        let conn = conn();
        let client = acme(&conn).await;
        assert!(is_valid_uuid(&client.id));
        assert_eq!(client.created_at, client.updated_at);
        assert_eq!(client.discarded_at, None);
        assert_eq!(client.lock_version, 0);
    }

    #[tokio::test]
    async fn test_create_reports_every_missing_field() {
        let jobs = MutationLayer::<Job>::new(conn(), Job::schema());
        let err = jobs.create(&Patch::new().set("status", "open")).await.unwrap_err();
        assert_eq!(err.errors_on("title"), vec!["Title is required".to_string()]);
        assert_eq!(err.errors_on("client_id"), vec!["Client is required".to_string()]);
    }

    #[tokio::test]
    async fn test_blank_string_counts_as_missing() {
        let clients = MutationLayer::<Client>::new(conn(), Client::schema());
        let err = clients
            .create(&NewClient::new("   ", ClientType::Business))
            .await
            .unwrap_err();
        assert_eq!(err.errors_on("name"), vec!["Name is required".to_string()]);
    }

    #[tokio::test]
    async fn test_update_rejects_empty_patch() {
        let conn = conn();
        let client = acme(&conn).await;
        let clients = MutationLayer::<Client>::new(conn, Client::schema());
        let err = clients.update(&client.id, Patch::new()).await.unwrap_err();
        assert_eq!(err.errors_on(BASE), vec!["Update data is required".to_string()]);
    }

    #[tokio::test]
    async fn test_update_rejects_protected_fields() {
        let conn = conn();
        let client = acme(&conn).await;
        let clients = MutationLayer::<Client>::new(conn, Client::schema());
        let err = clients
            .update(&client.id, Patch::new().set("id", "other").set("created_at", 1))
            .await
            .unwrap_err();
        assert_eq!(err.errors_on("id"), vec!["Id cannot be changed".to_string()]);
        assert_eq!(err.errors_on("created_at"), vec!["Created at cannot be changed".to_string()]);
    }

    #[tokio::test]
    async fn test_update_rejects_malformed_id() {
        let clients = MutationLayer::<Client>::new(conn(), Client::schema());
        let err = clients
            .update("not-a-uuid", Patch::new().set("name", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.errors_on("id"), vec!["Id is not a valid UUID".to_string()]);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let clients = MutationLayer::<Client>::new(conn(), Client::schema());
        let err = clients
            .update(&generate_id(), Patch::new().set("name", "x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_touches_only_given_fields() {
        let conn = conn();
        let client = acme(&conn).await;
        let jobs = MutationLayer::<Job>::new(conn, Job::schema());
        let job = jobs
            .create(&NewJob::new(&client.id, "Fix sink").description("kitchen"))
            .await
            .unwrap();

        let updated = jobs
            .update(&job.id, Patch::new().set("status", "in_progress"))
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::InProgress);
        assert_eq!(updated.title, "Fix sink");
        assert_eq!(updated.description.as_deref(), Some("kitchen"));
        assert_eq!(updated.created_at, job.created_at);
        assert!(updated.updated_at > job.updated_at);
        assert_eq!(updated.lock_version, job.lock_version + 1);
    }

    #[tokio::test]
    async fn test_update_if_version_conflict() {
        let conn = conn();
        let client = acme(&conn).await;
        let clients = MutationLayer::<Client>::new(conn, Client::schema());
        clients
            .update_if_version(&client.id, Patch::new().set("name", "Acme 2"), 0)
            .await
            .unwrap();
        let err = clients
            .update_if_version(&client.id, Patch::new().set("name", "Acme 3"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::Conflict { expected: 0, actual: 1, .. }));
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let conn = conn();
        let client = acme(&conn).await;
        let clients = MutationLayer::<Client>::new(conn, Client::schema());

        let first = clients.discard(&client.id).await.unwrap();
        assert!(first.discarded_at.is_some());
        let second = clients.discard(&client.id).await.unwrap();
        assert_eq!(second.discarded_at, first.discarded_at);
        assert_eq!(second.updated_at, first.updated_at);

        let restored = clients.undiscard(&client.id).await.unwrap();
        assert_eq!(restored.discarded_at, None);
        let again = clients.undiscard(&client.id).await.unwrap();
        assert_eq!(again.updated_at, restored.updated_at);
    }

    #[tokio::test]
    async fn test_destroy_then_missing() {
        let conn = conn();
        let client = acme(&conn).await;
        let clients = MutationLayer::<Client>::new(conn, Client::schema());
        let destroyed = clients.destroy(&client.id).await.unwrap();
        assert_eq!(destroyed.id, client.id);
        assert!(clients.destroy(&client.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let conn = conn();
        let clients = MutationLayer::<Client>::new(conn, Client::schema());
        let id = generate_id();

        let created = clients
            .upsert(Patch::new().set("id", id.clone()).set("name", "Acme").set("client_type", "business"))
            .await
            .unwrap();
        assert_eq!(created.id, id);

        let updated = clients
            .upsert(Patch::new().set("id", id.clone()).set("name", "Acme Ltd"))
            .await
            .unwrap();
        assert_eq!(updated.id, id);
        assert_eq!(updated.name, "Acme Ltd");
        assert_eq!(updated.client_type, ClientType::Business);
    }

    #[tokio::test]
    async fn test_upsert_without_id_creates() {
        let clients = MutationLayer::<Client>::new(conn(), Client::schema());
        let created = clients
            .upsert(Patch::new().set("name", "Solo").set("client_type", "residential"))
            .await
            .unwrap();
        assert!(is_valid_uuid(&created.id));
    }

    #[tokio::test]
    async fn test_disconnected_create_fails() {
        let clients = MutationLayer::<Client>::new(Connection::new(), Client::schema());
        let err = clients
            .create(&NewClient::new("Acme", ClientType::Residential))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::ClientNotInitialized));
    }

    #[tokio::test]
    async fn test_create_fills_defaults() {
        let conn = conn();
        let clients = MutationLayer::<Client>::new(conn.clone(), Client::schema());
        let client = clients.create(&Patch::new().set("name", "Acme")).await.unwrap();
        assert_eq!(client.client_type, ClientType::Residential);

        let stored = clients.fetch_row(&client.id).await.unwrap().unwrap();
        assert_eq!(stored.get("client_type"), Some(&Value::from("residential")));

        let jobs = MutationLayer::<Job>::new(conn, Job::schema());
        let data = Patch::new()
            .set("client_id", client.id.as_str())
            .set("title", "Fix sink")
            .set("status", Value::Null);
        let job = jobs.create(&data).await.unwrap();
        assert_eq!(job.status, JobStatus::Open);
    }

    /// Clock frozen at one instant, like two processes writing in the same millisecond
    struct FrozenClock(i64);

    impl recordstore::Clock for FrozenClock {
        fn now_ms(&self) -> i64 {
            self.0
        }
    }

    #[tokio::test]
    async fn test_updated_at_increases_across_connections() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = Connection::connected(backend.clone()).with_clock(Arc::new(FrozenClock(1_000)));
        let editor = Connection::connected(backend).with_clock(Arc::new(FrozenClock(1_000)));
        let created = MutationLayer::<Client>::new(writer, Client::schema())
            .create(&NewClient::new("Acme", ClientType::Business))
            .await
            .unwrap();

        let clients = MutationLayer::<Client>::new(editor, Client::schema());
        let renamed = clients
            .update(&created.id, Patch::new().set("name", "Acme Ltd"))
            .await
            .unwrap();
        assert!(renamed.updated_at > created.updated_at);

        let discarded = clients.discard(&created.id).await.unwrap();
        assert!(discarded.updated_at > renamed.updated_at);
        assert_eq!(discarded.created_at, created.created_at);
    }
}
