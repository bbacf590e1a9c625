//! Reactive coordinator - display states for a live query
//!
//! - [`CoordinatorConfig`]: flash prevention and stale-data options
//! - [`CoordinatorMachine`]: pure transition logic
//! - [`ReactiveCoordinator`]: async driver owning a [`super::ReactiveQuery`]

mod config;
mod core;
mod machine;

pub use config::CoordinatorConfig;
pub use core::ReactiveCoordinator;
pub use machine::{CoordinatorMachine, CoordinatorState, CoordinatorStatus};
