//! Domain types for the job management data set
//!
//! - [`Client`]: a customer that jobs are performed for
//! - [`Job`]: a unit of work for one client
//! - [`Task`]: an ordered, optionally nested step within a job

mod client;
mod job;
mod task;

pub use client::{CLIENT_SCHEMA, Client, ClientType, NewClient};
pub use job::{JOB_SCHEMA, Job, JobStatus, NewJob};
pub use task::{NewTask, TASK_SCHEMA, Task, TaskStatus};

/// Error returned when parsing an enum from its snake_case name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}' (expected one of: {expected})")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}
