//! Task domain type and sibling ordering
//!
//! Tasks belong to a job and may nest under another task of the same job.
//! Siblings (same job, same parent) are ordered by a fractional `position`.

use std::collections::HashSet;
use std::str::FromStr;

use recordstore::{Direction, Field, IdFormat, Record, Relation, RelationKind, Schema, SortKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::ParseEnumError;
use super::job::{JOB_SCHEMA, Job};
use crate::error::{RecordError, RecordResult};
use crate::model::ActiveRecord;
use crate::mutation::Patch;
use crate::position::place;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(ParseEnumError {
                kind: "task status",
                value: other.to_string(),
                expected: "pending, in_progress, completed",
            }),
        }
    }
}

pub static TASK_SCHEMA: Schema = Schema {
    table: "tasks",
    primary_key: "id",
    id_format: IdFormat::Uuid,
    fields: &[
        Field::required("job_id", "Job is required"),
        Field::required("title", "Title is required"),
        Field::optional("parent_id"),
        Field::defaulted("status", default_status),
        Field::computed("position"),
    ],
    relations: &[
        Relation {
            name: "job",
            kind: RelationKind::BelongsTo,
            foreign_key: "job_id",
            target: job_schema,
        },
        Relation {
            name: "parent",
            kind: RelationKind::BelongsTo,
            foreign_key: "parent_id",
            target: task_schema,
        },
        Relation {
            name: "subtasks",
            kind: RelationKind::HasMany,
            foreign_key: "parent_id",
            target: task_schema,
        },
    ],
    discard_field: Some("discarded_at"),
    versioned: true,
    default_order: ("position", Direction::Asc),
    sort_key: Some(SortKey {
        field: "position",
        scope: &["job_id", "parent_id"],
    }),
};

fn default_status() -> Value {
    Value::from(TaskStatus::default().to_string())
}

fn job_schema() -> &'static Schema {
    &JOB_SCHEMA
}

fn task_schema() -> &'static Schema {
    &TASK_SCHEMA
}

/// A step within a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    pub job_id: String,

    /// Parent task, `None` for top-level tasks
    #[serde(default)]
    pub parent_id: Option<String>,

    pub title: String,

    #[serde(default)]
    pub status: TaskStatus,

    /// Sort key among siblings
    #[serde(default)]
    pub position: f64,

    pub created_at: i64,

    pub updated_at: i64,

    #[serde(default)]
    pub discarded_at: Option<i64>,

    #[serde(default)]
    pub lock_version: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Box<Job>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Task>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<Task>>,
}

impl Record for Task {
    fn schema() -> &'static Schema {
        &TASK_SCHEMA
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

/// Fields accepted when creating a [`Task`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub job_id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

impl NewTask {
    pub fn new(job_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            title: title.into(),
            parent_id: None,
            status: TaskStatus::Pending,
            position: None,
        }
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn position(mut self, position: f64) -> Self {
        self.position = Some(position);
        self
    }
}

impl ActiveRecord<Task> {
    /// Kept siblings under `parent_id` within `job_id`, by position
    pub async fn siblings(&self, job_id: &str, parent_id: Option<&str>) -> RecordResult<Vec<Task>> {
        let parent = parent_id.map(Value::from).unwrap_or(Value::Null);
        self.kept()
            .where_eq("job_id", job_id)
            .where_eq("parent_id", parent)
            .order_by("position", Direction::Asc)
            .all()
            .await
    }

    /// Create a task; without an explicit position it goes after its last sibling
    pub async fn append(&self, data: NewTask) -> RecordResult<Task> {
        debug!(job_id = %data.job_id, "ActiveRecord<Task>::append: called");
        self.create(&data).await
    }

    /// Move a task to `index` among the children of `parent_id`
    ///
    /// Only the moved task is written unless the gap at the target slot is
    /// exhausted, in which case every sibling is renumbered first.
    pub async fn reorder(&self, task_id: &str, parent_id: Option<&str>, index: usize) -> RecordResult<Task> {
        debug!(%task_id, ?parent_id, index, "ActiveRecord<Task>::reorder: called");
        let task = self.find(task_id).await?;

        if let Some(parent_id) = parent_id {
            self.check_parent(&task, parent_id).await?;
        }

        let siblings: Vec<(String, f64)> = self
            .siblings(&task.job_id, parent_id)
            .await?
            .into_iter()
            .filter(|t| t.id != task.id)
            .map(|t| (t.id, t.position))
            .collect();

        let placement = place(&siblings, index).map_err(|e| RecordError::invalid("tasks", "position", e.to_string()))?;
        if let Some(renumbered) = &placement.renumbered {
            info!(job_id = %task.job_id, count = renumbered.len(), "Renumbering task siblings");
            for ((id, old), (_, new)) in siblings.iter().zip(renumbered) {
                if old != new {
                    self.update(id, Patch::new().set("position", *new)).await?;
                }
            }
        }

        let patch = Patch::new()
            .set("parent_id", parent_id.map(Value::from).unwrap_or(Value::Null))
            .set("position", placement.position);
        self.update(&task.id, patch).await
    }

    async fn check_parent(&self, task: &Task, parent_id: &str) -> RecordResult<()> {
        if parent_id == task.id {
            return Err(RecordError::invalid("tasks", "parent_id", "Task cannot be nested under itself"));
        }
        let parent = self.find(parent_id).await?;
        if parent.job_id != task.job_id {
            return Err(RecordError::invalid("tasks", "parent_id", "Parent must belong to the same job"));
        }

        let mut seen = HashSet::new();
        let mut cursor = parent.parent_id;
        while let Some(ancestor) = cursor {
            if ancestor == task.id {
                return Err(RecordError::invalid(
                    "tasks",
                    "parent_id",
                    "Task cannot be nested under its own subtask",
                ));
            }
            if !seen.insert(ancestor.clone()) {
                break;
            }
            cursor = self.find(&ancestor).await?.parent_id;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::domain::{Client, ClientType, NewClient, NewJob};
    use recordstore::MemoryBackend;
    use std::sync::Arc;

    async fn setup() -> (ActiveRecord<Task>, String) {
        let conn = Connection::connected(Arc::new(MemoryBackend::new()));
        let client = ActiveRecord::<Client>::new(conn.clone())
            .unwrap()
            .create(&NewClient::new("Acme", ClientType::Residential))
            .await
            .unwrap();
        let job = ActiveRecord::<Job>::new(conn.clone())
            .unwrap()
            .create(&NewJob::new(&client.id, "Fix sink"))
            .await
            .unwrap();
        (ActiveRecord::new(conn).unwrap(), job.id)
    }

    fn titles(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.title.as_str()).collect()
    }

    #[tokio::test]
    async fn test_append_spaces_positions() {
        let (tasks, job_id) = setup().await;
        let a = tasks.append(NewTask::new(&job_id, "a")).await.unwrap();
        let b = tasks.append(NewTask::new(&job_id, "b")).await.unwrap();
        assert_eq!(a.position, 10_000.0);
        assert_eq!(b.position, 20_000.0);
    }

    #[tokio::test]
    async fn test_create_without_position_gets_distinct_keys() {
        let (tasks, job_id) = setup().await;
        let a = tasks.create(&NewTask::new(&job_id, "a")).await.unwrap();
        let b = tasks.create(&NewTask::new(&job_id, "b")).await.unwrap();
        assert_ne!(a.position, b.position);
        assert!(a.position < b.position);

        let rows = tasks.kept().where_eq("job_id", job_id.as_str()).rows().await.unwrap();
        assert!(rows.iter().all(|r| r.get("position").is_some_and(Value::is_f64)));
        assert!(rows.iter().all(|r| r.get("status") == Some(&Value::from("pending"))));

        // a new parent starts its own sibling set
        let child = tasks.create(&NewTask::new(&job_id, "child").parent(&a.id)).await.unwrap();
        assert_eq!(child.position, 10_000.0);
    }

    #[tokio::test]
    async fn test_create_rejects_taken_position() {
        let (tasks, job_id) = setup().await;
        let a = tasks.append(NewTask::new(&job_id, "a")).await.unwrap();

        let err = tasks
            .create(&NewTask::new(&job_id, "b").position(a.position))
            .await
            .unwrap_err();
        assert_eq!(err.errors_on("position"), vec!["Position is already taken".to_string()]);

        // discarded siblings free their slot
        tasks.discard(&a.id).await.unwrap();
        let b = tasks
            .create(&NewTask::new(&job_id, "b").position(a.position))
            .await
            .unwrap();
        assert_eq!(b.position, a.position);
    }

    #[tokio::test]
    async fn test_reorder_moves_only_target() {
        let (tasks, job_id) = setup().await;
        let a = tasks.append(NewTask::new(&job_id, "a")).await.unwrap();
        let b = tasks.append(NewTask::new(&job_id, "b")).await.unwrap();
        let c = tasks.append(NewTask::new(&job_id, "c")).await.unwrap();

        let moved = tasks.reorder(&c.id, None, 0).await.unwrap();
        assert_eq!(moved.position, 0.0);

        let ordered = tasks.siblings(&job_id, None).await.unwrap();
        assert_eq!(titles(&ordered), vec!["c", "a", "b"]);
        assert_eq!(tasks.find(&a.id).await.unwrap().updated_at, a.updated_at);
        assert_eq!(tasks.find(&b.id).await.unwrap().updated_at, b.updated_at);
    }

    #[tokio::test]
    async fn test_reorder_into_middle() {
        let (tasks, job_id) = setup().await;
        tasks.create(&NewTask::new(&job_id, "a").position(100.0)).await.unwrap();
        tasks.create(&NewTask::new(&job_id, "b").position(200.0)).await.unwrap();
        let c = tasks.create(&NewTask::new(&job_id, "c").position(300.0)).await.unwrap();

        let moved = tasks.reorder(&c.id, None, 1).await.unwrap();
        assert_eq!(moved.position, 150.0);
    }

    #[tokio::test]
    async fn test_reorder_renumbers_exhausted_gap() {
        let (tasks, job_id) = setup().await;
        tasks.create(&NewTask::new(&job_id, "a").position(1.0)).await.unwrap();
        tasks.create(&NewTask::new(&job_id, "b").position(1.0 + 1e-7)).await.unwrap();
        let c = tasks.create(&NewTask::new(&job_id, "c").position(5.0)).await.unwrap();

        tasks.reorder(&c.id, None, 1).await.unwrap();
        let ordered = tasks.siblings(&job_id, None).await.unwrap();
        assert_eq!(titles(&ordered), vec!["a", "c", "b"]);
        let positions: Vec<f64> = ordered.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![10_000.0, 15_000.0, 20_000.0]);
    }

    #[tokio::test]
    async fn test_reorder_under_parent() {
        let (tasks, job_id) = setup().await;
        let parent = tasks.append(NewTask::new(&job_id, "parent")).await.unwrap();
        let child = tasks.append(NewTask::new(&job_id, "child")).await.unwrap();

        let moved = tasks.reorder(&child.id, Some(&parent.id), 0).await.unwrap();
        assert_eq!(moved.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(titles(&tasks.siblings(&job_id, None).await.unwrap()), vec!["parent"]);
        assert_eq!(titles(&tasks.siblings(&job_id, Some(&parent.id)).await.unwrap()), vec!["child"]);
    }

    #[tokio::test]
    async fn test_reorder_rejects_cycles() {
        let (tasks, job_id) = setup().await;
        let top = tasks.append(NewTask::new(&job_id, "top")).await.unwrap();
        let mid = tasks.append(NewTask::new(&job_id, "mid").parent(&top.id)).await.unwrap();

        let err = tasks.reorder(&top.id, Some(&top.id), 0).await.unwrap_err();
        assert_eq!(err.errors_on("parent_id"), vec!["Task cannot be nested under itself".to_string()]);

        let err = tasks.reorder(&top.id, Some(&mid.id), 0).await.unwrap_err();
        assert_eq!(
            err.errors_on("parent_id"),
            vec!["Task cannot be nested under its own subtask".to_string()]
        );
    }
}
