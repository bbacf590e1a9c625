//! ReactiveQuery - a ScopedQuery kept up to date by the backend change stream
//!
//! A background task runs the query once on creation, then again whenever the
//! backend reports a write to the query's table or [`ReactiveQuery::refresh`]
//! is called. Transient failures are retried per the [`RetryPolicy`]; a
//! terminal failure sets `error` but keeps the last good data.
//!
//! Optimistic overlays patch the local copy of a record before the backend
//! has acknowledged a write. They are re-applied on top of every refetch until
//! confirmed (and seen by a later fetch) or rolled back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use recordstore::{ChangeStream, Record};
use serde_json::Value;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::listeners::{Published, Subscription};
use super::retry::RetryPolicy;
use crate::error::{RecordError, RecordResult};
use crate::mutation::Patch;
use crate::query::ScopedQuery;

/// Query output: a collection, or a single optional record
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData<T> {
    One(Option<T>),
    Many(Vec<T>),
}

impl<T> QueryData<T> {
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Many(_))
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        match self {
            Self::One(record) => usize::from(record.is_some()),
            Self::Many(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_many(&self) -> Option<&[T]> {
        match self {
            Self::Many(records) => Some(records),
            Self::One(_) => None,
        }
    }

    pub fn as_one(&self) -> Option<&T> {
        match self {
            Self::One(record) => record.as_ref(),
            Self::Many(_) => None,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            Self::One(Some(record)) => std::slice::from_ref(record).iter(),
            Self::One(None) => [].iter(),
            Self::Many(records) => records.iter(),
        }
    }
}

/// Observable state of a reactive query
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    /// Latest data, `None` until the first fetch completes
    pub data: Option<QueryData<T>>,
    pub is_loading: bool,
    /// Terminal error of the latest fetch
    pub error: Option<Arc<RecordError>>,
    /// Completed fetches so far
    pub generation: u64,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: true,
            error: None,
            generation: 0,
        }
    }
}

impl<T: Clone> QueryState<T> {
    pub fn has_loaded(&self) -> bool {
        self.generation > 0
    }

    /// At least one record is available
    pub fn present(&self) -> bool {
        self.data.as_ref().is_some_and(|d| !d.is_empty())
    }

    pub fn blank(&self) -> bool {
        !self.present()
    }

    pub fn result(&self) -> QueryResult<T> {
        if let Some(error) = &self.error {
            return QueryResult::Error(error.clone());
        }
        match &self.data {
            Some(data) => QueryResult::Success(data.clone()),
            None => QueryResult::Loading,
        }
    }
}

/// Tri-state view of a query
#[derive(Debug, Clone)]
pub enum QueryResult<T> {
    Loading,
    Success(QueryData<T>),
    Error(Arc<RecordError>),
}

/// Handle for an optimistic change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptimisticToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    One,
    Many,
}

struct Overlay {
    token: OptimisticToken,
    id: String,
    patch: Patch,
    /// Fetch sequence number current when the write was confirmed
    confirmed_at: Option<u64>,
}

struct Shared<T> {
    state: Published<QueryState<T>>,
    refresh: Notify,
    destroyed: AtomicBool,
    base: Mutex<Option<QueryData<T>>>,
    overlays: Mutex<Vec<Overlay>>,
    next_token: AtomicU64,
    fetch_seq: AtomicU64,
}

/// Live query over one table
pub struct ReactiveQuery<T: Record> {
    shared: Arc<Shared<T>>,
    shape: Shape,
    table: &'static str,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Record> ReactiveQuery<T> {
    /// Live collection; must be called inside a tokio runtime
    pub fn many(query: ScopedQuery<T>, retry: RetryPolicy) -> Self {
        Self::spawn(query, retry, Shape::Many)
    }

    /// Live single record (first match); must be called inside a tokio runtime
    pub fn one(query: ScopedQuery<T>, retry: RetryPolicy) -> Self {
        Self::spawn(query.limit(1), retry, Shape::One)
    }

    fn spawn(query: ScopedQuery<T>, retry: RetryPolicy, shape: Shape) -> Self {
        let table = query.schema().table;
        debug!(table, ?shape, "ReactiveQuery::spawn: called");
        let shared = Arc::new(Shared {
            state: Published::new(QueryState::default()),
            refresh: Notify::new(),
            destroyed: AtomicBool::new(false),
            base: Mutex::new(None),
            overlays: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            fetch_seq: AtomicU64::new(0),
        });
        let handle = tokio::spawn(drive(shared.clone(), query, retry, shape));
        Self {
            shared,
            shape,
            table,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn data(&self) -> Option<QueryData<T>> {
        self.shared.state.get().data
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.get().is_loading
    }

    pub fn error(&self) -> Option<Arc<RecordError>> {
        self.shared.state.get().error
    }

    pub fn is_collection(&self) -> bool {
        self.shape == Shape::Many
    }

    pub fn present(&self) -> bool {
        self.shared.state.get().present()
    }

    pub fn blank(&self) -> bool {
        self.shared.state.get().blank()
    }

    pub fn snapshot(&self) -> QueryState<T> {
        self.shared.state.get()
    }

    pub fn result(&self) -> QueryResult<T> {
        self.shared.state.get().result()
    }

    /// Receiver that observes every published state
    pub fn watch(&self) -> watch::Receiver<QueryState<T>> {
        self.shared.state.watch()
    }

    /// Call `callback` with the current state now and on every change
    pub fn subscribe(&self, callback: impl Fn(&QueryState<T>) + Send + Sync + 'static) -> Subscription {
        if !self.is_destroyed() {
            callback(&self.shared.state.get());
        }
        self.shared.state.subscribe(callback)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.listener_count()
    }

    /// Request a refetch
    pub fn refresh(&self) -> RecordResult<()> {
        if self.is_destroyed() {
            return Err(RecordError::Destroyed("ReactiveQuery"));
        }
        debug!(table = self.table, "ReactiveQuery::refresh: called");
        self.shared.refresh.notify_one();
        Ok(())
    }

    /// Wait until a fetch has completed and none is running
    pub async fn settled(&self) -> RecordResult<QueryState<T>> {
        self.wait_for(|s| s.has_loaded() && !s.is_loading).await
    }

    /// Wait until `predicate` holds for the published state
    pub async fn wait_for(&self, predicate: impl FnMut(&QueryState<T>) -> bool) -> RecordResult<QueryState<T>> {
        if self.is_destroyed() {
            return Err(RecordError::Destroyed("ReactiveQuery"));
        }
        self.shared
            .state
            .wait_for(predicate)
            .await
            .ok_or(RecordError::Destroyed("ReactiveQuery"))
    }

    /// Patch the local copy of record `id` before the backend confirms
    pub fn apply_optimistic(&self, id: &str, patch: Patch) -> RecordResult<OptimisticToken> {
        if self.is_destroyed() {
            return Err(RecordError::Destroyed("ReactiveQuery"));
        }
        let token = OptimisticToken(self.shared.next_token.fetch_add(1, Ordering::SeqCst));
        debug!(table = self.table, %id, ?token, "ReactiveQuery::apply_optimistic: called");

        let overlay = Overlay {
            token,
            id: id.to_string(),
            patch,
            confirmed_at: None,
        };
        if let Some(base) = lock(&self.shared.base).as_ref() {
            for record in base.iter().filter(|r| r.id() == id) {
                patch_record(record, std::slice::from_ref(&overlay))?;
            }
        }
        lock(&self.shared.overlays).push(overlay);
        self.shared.republish();
        Ok(token)
    }

    /// The write behind `token` succeeded; drop the overlay once a later fetch reflects it
    pub fn confirm(&self, token: OptimisticToken) {
        let seq = self.shared.fetch_seq.load(Ordering::SeqCst);
        if let Some(overlay) = lock(&self.shared.overlays).iter_mut().find(|o| o.token == token) {
            overlay.confirmed_at = Some(seq);
        }
        debug!(table = self.table, ?token, "ReactiveQuery::confirm: called");
        self.shared.refresh.notify_one();
    }

    /// The write behind `token` failed; restore the unpatched data
    pub fn rollback(&self, token: OptimisticToken) {
        debug!(table = self.table, ?token, "ReactiveQuery::rollback: called");
        lock(&self.shared.overlays).retain(|o| o.token != token);
        self.shared.republish();
    }

    pub fn pending_optimistic(&self) -> usize {
        lock(&self.shared.overlays).len()
    }

    /// Stop refetching and silence every callback; idempotent
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(table = self.table, "ReactiveQuery destroyed");
        self.shared.state.close();
        if let Some(handle) = lock(&self.handle).take() {
            handle.abort();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

impl<T: Record> Drop for ReactiveQuery<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T: Record> std::fmt::Debug for ReactiveQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveQuery")
            .field("table", &self.table)
            .field("shape", &self.shape)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Record> Shared<T> {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Base data with pending overlays applied
    fn current_view(&self) -> Option<QueryData<T>> {
        let base = lock(&self.base);
        let overlays = lock(&self.overlays);
        base.as_ref().map(|data| with_overlays(data, &overlays))
    }

    fn republish(&self) {
        if self.is_destroyed() {
            return;
        }
        if let Some(view) = self.current_view() {
            self.state.modify(|s| s.data = Some(view));
        }
    }

    fn begin_fetch(&self) -> u64 {
        let seq = self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let already_loading = self.state.get().is_loading;
        if !already_loading {
            self.state.modify(|s| s.is_loading = true);
        }
        seq
    }

    fn finish_fetch(&self, seq: u64, result: RecordResult<QueryData<T>>) {
        if self.is_destroyed() {
            trace!("ReactiveQuery: dropping result after destroy");
            return;
        }
        match result {
            Ok(data) => {
                *lock(&self.base) = Some(data);
                lock(&self.overlays).retain(|o| o.confirmed_at.is_none_or(|c| seq <= c));
                let view = self.current_view();
                self.state.modify(|s| {
                    s.data = view;
                    s.error = None;
                    s.is_loading = false;
                    s.generation += 1;
                });
            }
            Err(e) => {
                warn!(error = %e, "ReactiveQuery: fetch failed");
                self.state.modify(|s| {
                    s.error = Some(Arc::new(e));
                    s.is_loading = false;
                    s.generation += 1;
                });
            }
        }
    }
}

fn with_overlays<T: Record>(data: &QueryData<T>, overlays: &[Overlay]) -> QueryData<T> {
    let apply = |record: &T| match patch_record(record, overlays) {
        Ok(patched) => patched,
        Err(e) => {
            warn!(id = record.id(), error = %e, "ReactiveQuery: overlay no longer applies");
            record.clone()
        }
    };
    match data {
        QueryData::One(record) => QueryData::One(record.as_ref().map(apply)),
        QueryData::Many(records) => QueryData::Many(records.iter().map(apply).collect()),
    }
}

fn patch_record<T: Record>(record: &T, overlays: &[Overlay]) -> RecordResult<T> {
    let mut relevant = overlays.iter().filter(|o| o.id == record.id()).peekable();
    if relevant.peek().is_none() {
        return Ok(record.clone());
    }
    let Value::Object(mut row) = serde_json::to_value(record)? else {
        return Ok(record.clone());
    };
    for overlay in relevant {
        for (field, value) in overlay.patch.as_row() {
            row.insert(field.clone(), value.clone());
        }
    }
    Ok(serde_json::from_value(Value::Object(row))?)
}

async fn fetch<T: Record>(query: &ScopedQuery<T>, shape: Shape) -> RecordResult<QueryData<T>> {
    match shape {
        Shape::Many => Ok(QueryData::Many(query.all().await?)),
        Shape::One => Ok(QueryData::One(query.first().await?)),
    }
}

async fn next_change(changes: &mut Option<ChangeStream>) -> Result<recordstore::ChangeEvent, broadcast::error::RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn drive<T: Record>(shared: Arc<Shared<T>>, query: ScopedQuery<T>, retry: RetryPolicy, shape: Shape) {
    let table = query.schema().table;
    let mut changes: Option<ChangeStream> = None;

    loop {
        if shared.is_destroyed() {
            break;
        }
        // subscribe before fetching so no write between fetch and subscribe is missed
        if changes.is_none()
            && let Ok(backend) = query.connection().backend()
        {
            changes = Some(backend.subscribe());
        }

        let seq = shared.begin_fetch();
        let result = retry.run(table, || fetch(&query, shape)).await;
        shared.finish_fetch(seq, result);

        loop {
            tokio::select! {
                _ = shared.refresh.notified() => break,
                event = next_change(&mut changes) => match event {
                    Ok(event) if event.table == table => {
                        trace!(table, id = %event.id, kind = ?event.kind, "ReactiveQuery: change event");
                        if let Some(rx) = changes.as_mut() {
                            while rx.try_recv().is_ok() {}
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(table, skipped, "ReactiveQuery: change stream lagged");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(table, "ReactiveQuery: change stream closed");
                        changes = None;
                        continue;
                    }
                },
            }
        }
    }
    debug!(table, "ReactiveQuery: driver stopped");
}
