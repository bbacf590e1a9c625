//! Connection - the one process-wide handle to a backend
//!
//! Models, queries and coordinators all hold a clone of the same
//! [`Connection`]. Until a backend is attached every operation fails with
//! [`RecordError::ClientNotInitialized`].

use std::sync::{Arc, RwLock};

use recordstore::{Backend, Clock, SystemClock};
use tracing::{debug, info};

use crate::error::{RecordError, RecordResult};

/// Shared, cloneable backend handle plus the timestamp source
#[derive(Clone)]
pub struct Connection {
    backend: Arc<RwLock<Option<Arc<dyn Backend>>>>,
    clock: Arc<dyn Clock>,
}

impl Connection {
    /// A handle with no backend attached yet
    pub fn new() -> Self {
        debug!("Connection::new: called");
        Self {
            backend: Arc::new(RwLock::new(None)),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// A handle already connected to `backend`
    pub fn connected(backend: Arc<dyn Backend>) -> Self {
        let conn = Self::new();
        conn.connect(backend);
        conn
    }

    /// Replace the timestamp source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach a backend; every clone of this handle sees it
    pub fn connect(&self, backend: Arc<dyn Backend>) {
        let mut slot = self.backend.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(backend);
        info!("Connection: backend attached");
    }

    /// Detach the backend; subsequent operations fail until reconnected
    pub fn disconnect(&self) {
        let mut slot = self.backend.write().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_some() {
            info!("Connection: backend detached");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.backend.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// The attached backend, or [`RecordError::ClientNotInitialized`]
    pub fn backend(&self) -> RecordResult<Arc<dyn Backend>> {
        let slot = self.backend.read().unwrap_or_else(|e| e.into_inner());
        slot.clone().ok_or(RecordError::ClientNotInitialized)
    }

    /// Next record timestamp (strictly increasing)
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordstore::MemoryBackend;

    #[test]
    fn test_uninitialized_connection_fails() {
        let conn = Connection::new();
        assert!(!conn.is_connected());
        assert!(matches!(conn.backend(), Err(RecordError::ClientNotInitialized)));
    }

    #[test]
    fn test_clones_share_backend_slot() {
        let conn = Connection::new();
        let clone = conn.clone();
        conn.connect(Arc::new(MemoryBackend::new()));
        assert!(clone.is_connected());

        clone.disconnect();
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_timestamps_increase() {
        let conn = Connection::new();
        let a = conn.now_ms();
        let b = conn.now_ms();
        assert!(b > a);
    }
}
