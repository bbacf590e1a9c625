//! Published state with callback listeners
//!
//! [`Published`] pairs a tokio watch channel (for async consumers) with a
//! list of synchronous callbacks (for UI-style consumers). Closing it drops
//! the watch sender, so pending `changed()` calls resolve with an error, and
//! stops every callback from firing again.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::trace;

type Callback<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct Registry<S> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<S>)>,
    closed: bool,
}

/// Ordered set of callbacks
pub(crate) struct Listeners<S> {
    registry: Arc<Mutex<Registry<S>>>,
}

impl<S: 'static> Listeners<S> {
    pub(crate) fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
                closed: false,
            })),
        }
    }

    pub(crate) fn add(&self, callback: Callback<S>) -> Subscription {
        let id = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if registry.closed {
                return Subscription::noop();
            }
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.push((id, callback));
            id
        };
        let weak: Weak<Mutex<Registry<S>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
                registry.callbacks.retain(|(cid, _)| *cid != id);
            }
        })
    }

    /// Invoke callbacks in registration order; each is re-checked under the
    /// lock so one removed or closed mid-delivery is skipped
    pub(crate) fn notify(&self, state: &S) {
        let ids: Vec<u64> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if registry.closed {
                return;
            }
            registry.callbacks.iter().map(|(id, _)| *id).collect()
        };
        for id in ids {
            let callback = {
                let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
                if registry.closed {
                    return;
                }
                registry.callbacks.iter().find(|(cid, _)| *cid == id).map(|(_, cb)| cb.clone())
            };
            if let Some(callback) = callback {
                callback(state);
            }
        }
    }

    pub(crate) fn close(&self) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.closed = true;
        registry.callbacks.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().map(|r| r.callbacks.len()).unwrap_or(0)
    }
}

/// Handle for a registered callback
///
/// Dropping the handle unsubscribes; call [`Subscription::detach`] to keep the
/// callback for the lifetime of its source.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered until its source is destroyed
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}

/// State published through a watch channel and to callbacks
pub(crate) struct Published<S> {
    tx: Mutex<Option<watch::Sender<S>>>,
    rx: watch::Receiver<S>,
    listeners: Listeners<S>,
}

impl<S: Clone + Send + Sync + 'static> Published<S> {
    pub(crate) fn new(initial: S) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            listeners: Listeners::new(),
        }
    }

    /// Latest value; still readable after close
    pub(crate) fn get(&self) -> S {
        self.rx.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<S> {
        self.rx.clone()
    }

    /// Mutate and publish; returns false once closed
    pub(crate) fn modify(&self, f: impl FnOnce(&mut S)) -> bool {
        let snapshot = {
            let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            let Some(tx) = guard.as_ref() else {
                trace!("Published::modify: closed");
                return false;
            };
            tx.send_modify(f);
            tx.borrow().clone()
        };
        self.listeners.notify(&snapshot);
        true
    }

    pub(crate) fn replace(&self, state: S) -> bool {
        self.modify(move |s| *s = state)
    }

    pub(crate) fn subscribe(&self, callback: impl Fn(&S) + Send + Sync + 'static) -> Subscription {
        self.listeners.add(Arc::new(callback))
    }

    pub(crate) async fn wait_for(&self, predicate: impl FnMut(&S) -> bool) -> Option<S> {
        let mut rx = self.rx.clone();
        rx.wait_for(predicate).await.ok().map(|state| state.clone())
    }

    pub(crate) fn close(&self) {
        self.listeners.close();
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
