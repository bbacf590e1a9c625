//! Job domain type

use std::str::FromStr;

use recordstore::{Direction, Field, IdFormat, Record, Relation, RelationKind, Schema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ParseEnumError;
use super::client::{CLIENT_SCHEMA, Client};
use super::task::{TASK_SCHEMA, Task};

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not started
    #[default]
    Open,
    /// Work underway
    InProgress,
    /// Done
    Completed,
    /// Abandoned
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError {
                kind: "job status",
                value: other.to_string(),
                expected: "open, in_progress, completed, cancelled",
            }),
        }
    }
}

pub static JOB_SCHEMA: Schema = Schema {
    table: "jobs",
    primary_key: "id",
    id_format: IdFormat::Uuid,
    fields: &[
        Field::required("client_id", "Client is required"),
        Field::required("title", "Title is required"),
        Field::optional("description"),
        Field::defaulted("status", default_status),
    ],
    relations: &[
        Relation {
            name: "client",
            kind: RelationKind::BelongsTo,
            foreign_key: "client_id",
            target: client_schema,
        },
        Relation {
            name: "tasks",
            kind: RelationKind::HasMany,
            foreign_key: "job_id",
            target: task_schema,
        },
    ],
    discard_field: Some("discarded_at"),
    versioned: true,
    default_order: ("created_at", Direction::Asc),
    sort_key: None,
};

fn default_status() -> Value {
    Value::from(JobStatus::default().to_string())
}

fn client_schema() -> &'static Schema {
    &CLIENT_SCHEMA
}

fn task_schema() -> &'static Schema {
    &TASK_SCHEMA
}

/// A unit of work performed for a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,

    /// Owning client
    pub client_id: String,

    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub status: JobStatus,

    pub created_at: i64,

    pub updated_at: i64,

    #[serde(default)]
    pub discarded_at: Option<i64>,

    #[serde(default)]
    pub lock_version: i64,

    /// Eager-loaded client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<Box<Client>>,

    /// Eager-loaded kept tasks, by position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
}

impl Record for Job {
    fn schema() -> &'static Schema {
        &JOB_SCHEMA
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

/// Fields accepted when creating a [`Job`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub client_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: JobStatus,
}

impl NewJob {
    pub fn new(client_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            title: title.into(),
            description: None,
            status: JobStatus::Open,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }
}
