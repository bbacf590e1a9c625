//! Coordinator state machine
//!
//! Pure transition logic over [`QueryState`] snapshots. Time only enters
//! through the `now` arguments, so every transition can be tested without
//! sleeping.
//!
//! ```text
//! Initializing ──(data, deadline passed)──► Ready ◄──(refetch done)── Hydrating
//!      │                                      │  └──────(refresh)──────────▲
//!      └──────────(terminal error)──────► Error ──(successful fetch)──► Ready
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::config::CoordinatorConfig;
use crate::error::RecordError;
use crate::reactive::query::{QueryData, QueryState};

/// Visual state of a coordinated query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStatus {
    /// First load in progress (or held back by the minimum loading time)
    Initializing,
    /// Fresh data on screen
    Ready,
    /// Refreshing; previous data may still be on screen
    Hydrating,
    /// Latest fetch failed
    Error,
}

impl std::fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Hydrating => write!(f, "hydrating"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Everything a view needs to render one coordinated query
#[derive(Debug, Clone)]
pub struct CoordinatorState<T> {
    pub status: CoordinatorStatus,
    /// Data to render; may be stale while hydrating or in error
    pub display_data: Option<QueryData<T>>,
    pub should_show_loading: bool,
    pub should_show_empty: bool,
    pub should_show_error: bool,
    pub is_fresh: bool,
    pub is_initial_load: bool,
    pub error: Option<Arc<RecordError>>,
}

impl<T> CoordinatorState<T> {
    fn initial() -> Self {
        Self {
            status: CoordinatorStatus::Initializing,
            display_data: None,
            should_show_loading: true,
            should_show_empty: false,
            should_show_error: false,
            is_fresh: false,
            is_initial_load: true,
            error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == CoordinatorStatus::Ready
    }

    /// Records currently on display
    pub fn display_len(&self) -> usize {
        self.display_data.as_ref().map(QueryData::len).unwrap_or(0)
    }
}

/// Transition logic behind [`super::ReactiveCoordinator`]
#[derive(Debug)]
pub struct CoordinatorMachine<T> {
    config: CoordinatorConfig,
    state: CoordinatorState<T>,
    deadline: Option<Instant>,
    pending: Option<QueryState<T>>,
    hydrate_from: Option<u64>,
    seen_generation: u64,
}

impl<T: Clone> CoordinatorMachine<T> {
    pub fn new(config: CoordinatorConfig, now: Instant) -> Self {
        let minimum = config.minimum_loading_time();
        Self {
            deadline: (!minimum.is_zero()).then(|| now + minimum),
            config,
            state: CoordinatorState::initial(),
            pending: None,
            hydrate_from: None,
            seen_generation: 0,
        }
    }

    pub fn state(&self) -> &CoordinatorState<T> {
        &self.state
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.state.status
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// When the held initial result may be shown, if still waiting
    pub fn deadline(&self) -> Option<Instant> {
        match self.state.status {
            CoordinatorStatus::Initializing => self.deadline,
            _ => None,
        }
    }

    /// Feed a query snapshot; returns true when the visible state changed
    pub fn on_query(&mut self, query: &QueryState<T>, now: Instant) -> bool {
        let completed = query.has_loaded() && !query.is_loading;
        match self.state.status {
            CoordinatorStatus::Initializing => {
                if !completed {
                    return false;
                }
                if self.deadline.is_some_and(|d| now < d) {
                    self.pending = Some(query.clone());
                    return false;
                }
                self.settle(query);
                true
            }
            CoordinatorStatus::Hydrating => {
                let from = self.hydrate_from.unwrap_or(self.seen_generation);
                if completed && query.generation > from {
                    self.settle(query);
                    return true;
                }
                if self.config.preserve_stale_data && query.data.is_some() {
                    self.state.display_data = query.data.clone();
                    return true;
                }
                false
            }
            CoordinatorStatus::Ready | CoordinatorStatus::Error => {
                if completed && query.generation > self.seen_generation {
                    self.settle(query);
                    return true;
                }
                // local (optimistic) changes between fetches
                if self.state.status == CoordinatorStatus::Ready && query.data.is_some() {
                    self.state.display_data = query.data.clone();
                    self.derive();
                    return true;
                }
                false
            }
        }
    }

    /// A refresh was requested while the query is at `generation`
    pub fn begin_refresh(&mut self, generation: u64) -> bool {
        if self.state.status == CoordinatorStatus::Initializing {
            return false;
        }
        self.hydrate_from = Some(generation.max(self.seen_generation));
        self.state.status = CoordinatorStatus::Hydrating;
        if !self.config.preserve_stale_data {
            self.state.display_data = None;
        }
        self.derive();
        true
    }

    /// Timer tick; promotes a held initial result once the deadline passes
    pub fn on_timer(&mut self, now: Instant) -> bool {
        if self.state.status != CoordinatorStatus::Initializing {
            return false;
        }
        if !self.deadline.is_some_and(|d| now >= d) {
            return false;
        }
        self.deadline = None;
        match self.pending.take() {
            Some(pending) => {
                self.settle(&pending);
                true
            }
            None => false,
        }
    }

    fn settle(&mut self, query: &QueryState<T>) {
        self.seen_generation = query.generation;
        self.pending = None;
        self.hydrate_from = None;

        match &query.error {
            Some(error) => {
                self.state.status = CoordinatorStatus::Error;
                self.state.error = Some(error.clone());
                self.state.display_data = if self.config.preserve_stale_data {
                    query.data.clone().or_else(|| self.state.display_data.take())
                } else {
                    None
                };
            }
            None => {
                self.state.status = CoordinatorStatus::Ready;
                self.state.error = None;
                self.state.display_data = query.data.clone();
            }
        }
        self.derive();
    }

    fn derive(&mut self) {
        let status = self.state.status;
        let blank = self.state.display_data.as_ref().is_none_or(QueryData::is_empty);
        self.state.should_show_loading = status == CoordinatorStatus::Initializing
            || (status == CoordinatorStatus::Hydrating && !self.config.preserve_stale_data);
        self.state.should_show_error = status == CoordinatorStatus::Error;
        self.state.should_show_empty = status == CoordinatorStatus::Ready && blank;
        self.state.is_fresh = status == CoordinatorStatus::Ready;
        self.state.is_initial_load = status == CoordinatorStatus::Initializing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordstore::BackendError;
    use std::time::Duration;

    fn loaded(generation: u64, items: Vec<u32>) -> QueryState<u32> {
        QueryState {
            data: Some(QueryData::Many(items)),
            is_loading: false,
            error: None,
            generation,
        }
    }

    fn failed(generation: u64, items: Option<Vec<u32>>) -> QueryState<u32> {
        QueryState {
            data: items.map(QueryData::Many),
            is_loading: false,
            error: Some(Arc::new(RecordError::Backend(BackendError::Unavailable("down".into())))),
            generation,
        }
    }

    fn machine(config: CoordinatorConfig) -> (CoordinatorMachine<u32>, Instant) {
        let start = Instant::now();
        (CoordinatorMachine::new(config, start), start)
    }

    #[test]
    fn test_starts_initializing() {
        let (m, start) = machine(CoordinatorConfig::default());
        assert_eq!(m.status(), CoordinatorStatus::Initializing);
        assert!(m.state().should_show_loading);
        assert!(m.state().is_initial_load);
        assert_eq!(m.deadline(), Some(start + Duration::from_millis(300)));
    }

    #[test]
    fn test_early_data_is_held_until_deadline() {
        let (mut m, start) = machine(CoordinatorConfig::default());
        assert!(!m.on_query(&loaded(1, vec![1]), start + Duration::from_millis(50)));
        assert_eq!(m.status(), CoordinatorStatus::Initializing);

        assert!(!m.on_timer(start + Duration::from_millis(299)));
        assert!(m.on_timer(start + Duration::from_millis(300)));
        assert_eq!(m.status(), CoordinatorStatus::Ready);
        assert_eq!(m.state().display_len(), 1);
        assert!(m.state().is_fresh);
        assert!(!m.state().is_initial_load);
    }

    #[test]
    fn test_late_data_is_shown_immediately() {
        let (mut m, start) = machine(CoordinatorConfig::default());
        assert!(!m.on_timer(start + Duration::from_millis(300)));
        assert!(m.on_query(&loaded(1, vec![1, 2]), start + Duration::from_millis(400)));
        assert_eq!(m.status(), CoordinatorStatus::Ready);
    }

    #[test]
    fn test_zero_minimum_skips_hold() {
        let (mut m, start) = machine(CoordinatorConfig::default().with_minimum_loading_time(Duration::ZERO));
        assert_eq!(m.deadline(), None);
        assert!(m.on_query(&loaded(1, vec![]), start));
        assert!(m.state().should_show_empty);
    }

    #[test]
    fn test_hydrating_preserves_display() {
        let (mut m, start) = machine(CoordinatorConfig::default().with_minimum_loading_time(Duration::ZERO));
        m.on_query(&loaded(1, vec![1, 2]), start);

        assert!(m.begin_refresh(1));
        assert_eq!(m.status(), CoordinatorStatus::Hydrating);
        assert_eq!(m.state().display_len(), 2);
        assert!(!m.state().should_show_loading);
        assert!(!m.state().is_fresh);

        let mut in_flight = loaded(1, vec![1, 2]);
        in_flight.is_loading = true;
        m.on_query(&in_flight, start);
        assert_eq!(m.status(), CoordinatorStatus::Hydrating);

        assert!(m.on_query(&loaded(2, vec![1, 2, 3]), start));
        assert_eq!(m.status(), CoordinatorStatus::Ready);
        assert_eq!(m.state().display_len(), 3);
    }

    #[test]
    fn test_hydrating_without_preserve_clears_display() {
        let config = CoordinatorConfig::default()
            .with_minimum_loading_time(Duration::ZERO)
            .with_preserve_stale_data(false);
        let (mut m, start) = machine(config);
        m.on_query(&loaded(1, vec![1]), start);

        m.begin_refresh(1);
        assert!(m.state().display_data.is_none());
        assert!(m.state().should_show_loading);
    }

    #[test]
    fn test_error_keeps_stale_data_when_preserving() {
        let (mut m, start) = machine(CoordinatorConfig::default().with_minimum_loading_time(Duration::ZERO));
        m.on_query(&loaded(1, vec![1]), start);
        m.begin_refresh(1);

        assert!(m.on_query(&failed(2, Some(vec![1])), start));
        assert_eq!(m.status(), CoordinatorStatus::Error);
        assert!(m.state().should_show_error);
        assert_eq!(m.state().display_len(), 1);

        assert!(m.on_query(&loaded(3, vec![1]), start));
        assert_eq!(m.status(), CoordinatorStatus::Ready);
        assert!(m.state().error.is_none());
    }

    #[test]
    fn test_error_clears_display_without_preserve() {
        let config = CoordinatorConfig::default()
            .with_minimum_loading_time(Duration::ZERO)
            .with_preserve_stale_data(false);
        let (mut m, start) = machine(config);
        m.on_query(&loaded(1, vec![1]), start);
        m.on_query(&failed(2, Some(vec![1])), start);
        assert_eq!(m.status(), CoordinatorStatus::Error);
        assert!(m.state().display_data.is_none());
    }

    #[test]
    fn test_initial_error_is_held_like_data() {
        let (mut m, start) = machine(CoordinatorConfig::default());
        assert!(!m.on_query(&failed(1, None), start + Duration::from_millis(10)));
        assert!(m.on_timer(start + Duration::from_millis(300)));
        assert_eq!(m.status(), CoordinatorStatus::Error);
    }

    #[test]
    fn test_refresh_ignored_while_initializing() {
        let (mut m, _) = machine(CoordinatorConfig::default());
        assert!(!m.begin_refresh(0));
        assert_eq!(m.status(), CoordinatorStatus::Initializing);
    }

    #[test]
    fn test_push_refetch_updates_ready_state() {
        let (mut m, start) = machine(CoordinatorConfig::default().with_minimum_loading_time(Duration::ZERO));
        m.on_query(&loaded(1, vec![1]), start);
        assert!(m.on_query(&loaded(2, vec![]), start));
        assert_eq!(m.status(), CoordinatorStatus::Ready);
        assert!(m.state().should_show_empty);
    }
}
