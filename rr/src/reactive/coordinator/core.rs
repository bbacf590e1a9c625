//! ReactiveCoordinator task
//!
//! Owns one [`ReactiveQuery`] and a [`CoordinatorMachine`]. A background task
//! feeds the machine with every query snapshot and wakes it when the minimum
//! loading deadline passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use recordstore::Record;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::config::CoordinatorConfig;
use super::machine::{CoordinatorMachine, CoordinatorState, CoordinatorStatus};
use crate::error::{RecordError, RecordResult};
use crate::reactive::listeners::{Published, Subscription};
use crate::reactive::query::ReactiveQuery;

struct Shared<T> {
    state: Published<CoordinatorState<T>>,
    machine: Mutex<CoordinatorMachine<T>>,
    wake: Notify,
    destroyed: AtomicBool,
    table: &'static str,
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    fn machine(&self) -> MutexGuard<'_, CoordinatorMachine<T>> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish the machine's state if `step` changed it
    fn step(&self, step: impl FnOnce(&mut CoordinatorMachine<T>) -> bool) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let (changed, before, snapshot, verbose) = {
            let mut machine = self.machine();
            let before = machine.status();
            let changed = step(&mut machine);
            (changed, before, machine.state().clone(), machine.config().debug)
        };
        if !changed {
            return;
        }
        if before != snapshot.status {
            if verbose {
                debug!(table = self.table, from = %before, to = %snapshot.status, "Coordinator transition");
            } else {
                trace!(table = self.table, from = %before, to = %snapshot.status, "Coordinator transition");
            }
        }
        self.state.replace(snapshot);
    }
}

/// Loading-state coordinator over one reactive query
pub struct ReactiveCoordinator<T: Record> {
    shared: Arc<Shared<T>>,
    query: ReactiveQuery<T>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Record> ReactiveCoordinator<T> {
    /// Start coordinating `query`; must be called inside a tokio runtime
    pub fn new(query: ReactiveQuery<T>, config: CoordinatorConfig) -> Self {
        let table = query.table();
        debug!(table, ?config, "ReactiveCoordinator::new: called");
        let machine = CoordinatorMachine::new(config, Instant::now());
        let shared = Arc::new(Shared {
            state: Published::new(machine.state().clone()),
            machine: Mutex::new(machine),
            wake: Notify::new(),
            destroyed: AtomicBool::new(false),
            table,
        });
        let handle = tokio::spawn(drive(shared.clone(), query.watch()));
        Self {
            shared,
            query,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn state(&self) -> CoordinatorState<T> {
        self.shared.state.get()
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.shared.state.get().status
    }

    pub fn query(&self) -> &ReactiveQuery<T> {
        &self.query
    }

    pub fn watch(&self) -> watch::Receiver<CoordinatorState<T>> {
        self.shared.state.watch()
    }

    /// Call `callback` with the current state now and on every change
    pub fn subscribe(&self, callback: impl Fn(&CoordinatorState<T>) + Send + Sync + 'static) -> Subscription {
        if !self.is_destroyed() {
            callback(&self.shared.state.get());
        }
        self.shared.state.subscribe(callback)
    }

    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CoordinatorState<T>) -> bool,
    ) -> RecordResult<CoordinatorState<T>> {
        if self.is_destroyed() {
            return Err(RecordError::Destroyed("ReactiveCoordinator"));
        }
        self.shared
            .state
            .wait_for(predicate)
            .await
            .ok_or(RecordError::Destroyed("ReactiveCoordinator"))
    }

    /// Enter hydrating (keeping or clearing display data per config) and refetch
    pub fn refresh(&self) -> RecordResult<()> {
        if self.is_destroyed() {
            return Err(RecordError::Destroyed("ReactiveCoordinator"));
        }
        debug!(table = self.shared.table, "ReactiveCoordinator::refresh: called");
        let generation = self.query.snapshot().generation;
        self.shared.step(|m| m.begin_refresh(generation));
        self.query.refresh()?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stop the driver, destroy the query and drop every callback; idempotent
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(table = self.shared.table, "ReactiveCoordinator destroyed");
        self.shared.state.close();
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.query.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

impl<T: Record> Drop for ReactiveCoordinator<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T: Record> std::fmt::Debug for ReactiveCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveCoordinator")
            .field("table", &self.shared.table)
            .field("status", &self.status())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

async fn drive<T: Record>(shared: Arc<Shared<T>>, mut query: watch::Receiver<crate::reactive::query::QueryState<T>>) {
    let initial = query.borrow_and_update().clone();
    shared.step(|m| m.on_query(&initial, Instant::now()));

    loop {
        let deadline = shared.machine().deadline();
        tokio::select! {
            changed = query.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = query.borrow_and_update().clone();
                shared.step(|m| m.on_query(&snapshot, Instant::now()));
            }
            _ = sleep_until(deadline) => {
                shared.step(|m| m.on_timer(Instant::now()));
            }
            _ = shared.wake.notified() => {}
        }
    }
    debug!(table = shared.table, "ReactiveCoordinator: driver stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::domain::{Client, ClientType, NewClient};
    use crate::model::ActiveRecord;
    use crate::reactive::retry::RetryPolicy;
    use recordstore::MemoryBackend;
    use std::time::Duration;

    fn clients() -> ActiveRecord<Client> {
        ActiveRecord::new(Connection::connected(Arc::new(MemoryBackend::new()))).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_ready_after_minimum_time() {
        let clients = clients();
        let start = Instant::now();
        let coordinator = ReactiveCoordinator::new(
            ReactiveQuery::many(clients.all(), RetryPolicy::none()),
            CoordinatorConfig::default(),
        );
        assert_eq!(coordinator.status(), CoordinatorStatus::Initializing);

        let state = coordinator.wait_for(|s| s.is_ready()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(state.should_show_empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_also_destroys_query() {
        let clients = clients();
        let coordinator = ReactiveCoordinator::new(
            ReactiveQuery::many(clients.all(), RetryPolicy::none()),
            CoordinatorConfig::default(),
        );
        coordinator.wait_for(|s| s.is_ready()).await.unwrap();

        coordinator.destroy();
        assert!(coordinator.query().is_destroyed());
        assert!(matches!(coordinator.refresh(), Err(RecordError::Destroyed(_))));
        assert_eq!(coordinator.status(), CoordinatorStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_updates_flow_through() {
        let clients = clients();
        let coordinator = ReactiveCoordinator::new(
            ReactiveQuery::many(clients.all(), RetryPolicy::none()),
            CoordinatorConfig::default().with_debug(true),
        );
        coordinator.wait_for(|s| s.is_ready()).await.unwrap();

        clients.create(&NewClient::new("Acme", ClientType::Business)).await.unwrap();
        let state = coordinator.wait_for(|s| s.display_len() == 1).await.unwrap();
        assert_eq!(state.status, CoordinatorStatus::Ready);
        assert!(!state.should_show_empty);
    }
}
