//! Client domain type

use std::str::FromStr;

use recordstore::{Direction, Field, IdFormat, Record, Relation, RelationKind, Schema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ParseEnumError;
use super::job::{JOB_SCHEMA, Job};

/// Kind of customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Residential,
    Business,
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Residential => write!(f, "residential"),
            Self::Business => write!(f, "business"),
        }
    }
}

impl FromStr for ClientType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "residential" => Ok(Self::Residential),
            "business" => Ok(Self::Business),
            other => Err(ParseEnumError {
                kind: "client type",
                value: other.to_string(),
                expected: "residential, business",
            }),
        }
    }
}

pub static CLIENT_SCHEMA: Schema = Schema {
    table: "clients",
    primary_key: "id",
    id_format: IdFormat::Uuid,
    fields: &[
        Field::required("name", "Name is required"),
        Field::defaulted("client_type", default_client_type),
        Field::optional("email"),
        Field::optional("phone"),
    ],
    relations: &[Relation {
        name: "jobs",
        kind: RelationKind::HasMany,
        foreign_key: "client_id",
        target: job_schema,
    }],
    discard_field: Some("discarded_at"),
    versioned: true,
    default_order: ("created_at", Direction::Asc),
    sort_key: None,
};

fn default_client_type() -> Value {
    Value::from(ClientType::default().to_string())
}

fn job_schema() -> &'static Schema {
    &JOB_SCHEMA
}

/// A customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub client_type: ClientType,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub phone: Option<String>,

    /// Creation time (unix ms)
    pub created_at: i64,

    /// Last write time (unix ms)
    pub updated_at: i64,

    /// Soft-delete time, if discarded
    #[serde(default)]
    pub discarded_at: Option<i64>,

    #[serde(default)]
    pub lock_version: i64,

    /// Eager-loaded jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<Job>>,
}

impl Record for Client {
    fn schema() -> &'static Schema {
        &CLIENT_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn discarded_at(&self) -> Option<i64> {
        self.discarded_at
    }
}

/// Fields accepted when creating a [`Client`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewClient {
    pub name: String,
    pub client_type: ClientType,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl NewClient {
    pub fn new(name: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            name: name.into(),
            client_type,
            email: None,
            phone: None,
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}
