//! Reactive layer
//!
//! Live queries that follow the backend change stream, coordinators that turn
//! them into loading/ready/hydrating/error display states, and a per-entity
//! façade tying both to an [`crate::ActiveRecord`].

pub mod coordinator;
mod listeners;
mod query;
mod record;
mod retry;

pub use coordinator::{CoordinatorConfig, CoordinatorMachine, CoordinatorState, CoordinatorStatus, ReactiveCoordinator};
pub use listeners::Subscription;
pub use query::{OptimisticToken, QueryData, QueryResult, QueryState, ReactiveQuery};
pub use record::ReactiveRecord;
pub use retry::{Backoff, RetryPolicy};
