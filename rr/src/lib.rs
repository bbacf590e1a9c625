//! ReactiveRecord - ActiveRecord-style models with live queries
//!
//! Typed models sit on top of a [`recordstore`] backend. Queries can be run
//! once, or wrapped in a [`ReactiveQuery`] that refetches whenever the backend
//! reports a change to its table. A [`ReactiveCoordinator`] turns a reactive
//! query into display states with flash prevention and stale-data retention.
//!
//! # Architecture
//!
//! ```text
//! ActiveRecord<T> ──► ScopedQuery<T> ──► Backend::fetch
//!        │                  │
//!        └─► MutationLayer  └─► ReactiveQuery<T> ──► ReactiveCoordinator<T> ──► UI
//!                 │                  ▲
//!                 └──► Backend ──────┘ (change stream)
//! ```
//!
//! # Modules
//!
//! - [`query`] - immutable chainable query builder
//! - [`mutation`] - create/update/discard/destroy/upsert
//! - [`model`] - per-entity façade with discard scopes
//! - [`reactive`] - live queries, coordinators and the reactive façade
//! - [`position`] - fractional sibling ordering
//! - [`domain`] - clients, jobs and tasks
//! - [`config`] - configuration loading
//! - [`cli`] - command-line interface
//!
//! # Example
//!
//! ```ignore
//! use reactiverecord::{ActiveRecord, Connection, domain::{Client, ClientType, NewClient}};
//!
//! let conn = Connection::connected(Arc::new(MemoryBackend::new()));
//! let clients = ActiveRecord::<Client>::new(conn)?;
//! let acme = clients.create(&NewClient::new("Acme", ClientType::Residential)).await?;
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod model;
pub mod mutation;
pub mod position;
pub mod query;
pub mod reactive;

pub use config::Config;
pub use connection::Connection;
pub use error::{RecordError, RecordResult};
pub use model::ActiveRecord;
pub use mutation::{Destroyed, MutationLayer, Patch};
pub use position::{MIN_GAP, POSITION_SPACING, Placement, PositionError, between, place, renumber};
pub use query::ScopedQuery;
pub use reactive::{
    Backoff, CoordinatorConfig, CoordinatorState, CoordinatorStatus, OptimisticToken, QueryData, QueryResult,
    QueryState, ReactiveCoordinator, ReactiveQuery, ReactiveRecord, RetryPolicy, Subscription,
};
