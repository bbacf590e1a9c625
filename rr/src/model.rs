//! ActiveRecord - query scopes plus mutations for one entity type

use recordstore::{Record, Schema};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{RecordError, RecordResult};
use crate::mutation::{Destroyed, MutationLayer, Patch};
use crate::query::{ScopedQuery, decode};

/// Model façade bound to one schema and one connection
pub struct ActiveRecord<T> {
    conn: Connection,
    schema: &'static Schema,
    mutations: MutationLayer<T>,
}

impl<T> Clone for ActiveRecord<T> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            schema: self.schema,
            mutations: self.mutations.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ActiveRecord<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRecord")
            .field("table", &self.schema.table)
            .field("conn", &self.conn)
            .finish()
    }
}

impl<T: Record> ActiveRecord<T> {
    /// Model for `T` using its declared schema
    pub fn new(conn: Connection) -> RecordResult<Self> {
        Self::with_schema(conn, T::schema())
    }

    /// Model for `T` stored under an explicit schema
    pub fn with_schema(conn: Connection, schema: &'static Schema) -> RecordResult<Self> {
        debug!(table = schema.table, "ActiveRecord::with_schema: called");
        if schema.table.trim().is_empty() {
            return Err(RecordError::Configuration("table name must not be empty".to_string()));
        }
        if schema.primary_key.trim().is_empty() {
            return Err(RecordError::Configuration(format!(
                "primary key of {} must not be empty",
                schema.table
            )));
        }
        Ok(Self {
            mutations: MutationLayer::new(conn.clone(), schema),
            conn,
            schema,
        })
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn mutations(&self) -> &MutationLayer<T> {
        &self.mutations
    }

    /// Default scope: kept records for discardable entities, everything otherwise
    pub fn all(&self) -> ScopedQuery<T> {
        self.kept()
    }

    pub fn kept(&self) -> ScopedQuery<T> {
        match self.schema.discard_field {
            Some(field) => self.with_discarded().where_null(field),
            None => self.with_discarded(),
        }
    }

    /// Only soft-deleted records; empty for entities without a discard column
    pub fn discarded(&self) -> ScopedQuery<T> {
        match self.schema.discard_field {
            Some(field) => self.with_discarded().where_not_null(field),
            None => self.with_discarded().where_null(self.schema.primary_key),
        }
    }

    pub fn with_discarded(&self) -> ScopedQuery<T> {
        ScopedQuery::new(self.conn.clone(), self.schema)
    }

    pub fn where_eq(&self, field: &str, value: impl Into<Value>) -> ScopedQuery<T> {
        self.all().where_eq(field, value)
    }

    pub fn includes(&self, relations: &[&str]) -> RecordResult<ScopedQuery<T>> {
        self.all().includes(relations)
    }

    /// Record by primary key, discarded or not
    pub async fn find(&self, id: &str) -> RecordResult<T> {
        debug!(table = self.schema.table, %id, "ActiveRecord::find: called");
        if self.mutations.check_id(id).is_err() {
            return Err(RecordError::not_found(self.schema.table, id));
        }
        match self.mutations.fetch_row(id).await? {
            Some(row) => decode(row),
            None => Err(RecordError::not_found(self.schema.table, id)),
        }
    }

    /// First kept record matching every condition
    pub async fn find_by<I, K, V>(&self, conditions: I) -> RecordResult<Option<T>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        debug!(table = self.schema.table, "ActiveRecord::find_by: called");
        self.all().where_conditions(conditions).first().await
    }

    pub async fn count(&self) -> RecordResult<u64> {
        self.all().count().await
    }

    pub async fn create<D: Serialize>(&self, data: &D) -> RecordResult<T> {
        self.mutations.create(data).await
    }

    pub async fn update(&self, id: &str, patch: Patch) -> RecordResult<T> {
        self.mutations.update(id, patch).await
    }

    pub async fn update_if_version(&self, id: &str, patch: Patch, expected: i64) -> RecordResult<T> {
        self.mutations.update_if_version(id, patch, expected).await
    }

    pub async fn discard(&self, id: &str) -> RecordResult<T> {
        self.mutations.discard(id).await
    }

    pub async fn undiscard(&self, id: &str) -> RecordResult<T> {
        self.mutations.undiscard(id).await
    }

    pub async fn destroy(&self, id: &str) -> RecordResult<Destroyed> {
        self.mutations.destroy(id).await
    }

    pub async fn upsert(&self, patch: Patch) -> RecordResult<T> {
        self.mutations.upsert(patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Client, ClientType, NewClient};
    use recordstore::{Direction, IdFormat, MemoryBackend, generate_id};
    use std::sync::Arc;

    static NAMELESS: Schema = Schema {
        table: "",
        primary_key: "id",
        id_format: IdFormat::Uuid,
        fields: &[],
        relations: &[],
        discard_field: None,
        versioned: false,
        default_order: ("created_at", Direction::Asc),
        sort_key: None,
    };

    fn clients() -> ActiveRecord<Client> {
        ActiveRecord::new(Connection::connected(Arc::new(MemoryBackend::new()))).unwrap()
    }

    #[test]
    fn test_empty_table_name_is_configuration_error() {
        let err = ActiveRecord::<Client>::with_schema(Connection::new(), &NAMELESS).unwrap_err();
        assert!(matches!(err, RecordError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_scopes_partition_records() {
        let clients = clients();
        let a = clients.create(&NewClient::new("A", ClientType::Residential)).await.unwrap();
        let b = clients.create(&NewClient::new("B", ClientType::Business)).await.unwrap();
        clients.discard(&b.id).await.unwrap();

        let kept: Vec<_> = clients.kept().all().await.unwrap().into_iter().map(|c| c.id).collect();
        let discarded: Vec<_> = clients.discarded().all().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(kept, vec![a.id.clone()]);
        assert_eq!(discarded, vec![b.id.clone()]);
        assert_eq!(clients.with_discarded().count().await.unwrap(), 2);
        assert_eq!(clients.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_includes_discarded() {
        let clients = clients();
        let a = clients.create(&NewClient::new("A", ClientType::Residential)).await.unwrap();
        clients.discard(&a.id).await.unwrap();
        let found = clients.find(&a.id).await.unwrap();
        assert!(found.discarded_at.is_some());
    }

    #[tokio::test]
    async fn test_find_missing_and_malformed() {
        let clients = clients();
        assert!(clients.find(&generate_id()).await.unwrap_err().is_not_found());
        assert!(clients.find("garbage").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_find_by() {
        let clients = clients();
        clients.create(&NewClient::new("A", ClientType::Residential)).await.unwrap();
        let b = clients.create(&NewClient::new("B", ClientType::Business)).await.unwrap();

        let found = clients.find_by([("client_type", "business")]).await.unwrap();
        assert_eq!(found.map(|c| c.id), Some(b.id));
        assert!(clients.find_by([("name", "Z")]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uninitialized_connection() {
        let clients = ActiveRecord::<Client>::new(Connection::new()).unwrap();
        assert!(matches!(clients.count().await, Err(RecordError::ClientNotInitialized)));
    }
}
