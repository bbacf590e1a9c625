//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoordinatorConfig {
    /// Shortest time the initial loading state stays visible
    #[serde(default = "default_minimum_loading_time_ms")]
    pub minimum_loading_time_ms: u64,

    /// Keep showing previous data while refreshing or after an error
    #[serde(default = "default_preserve_stale_data")]
    pub preserve_stale_data: bool,

    /// Log every state transition at debug level instead of trace
    #[serde(default)]
    pub debug: bool,
}

fn default_minimum_loading_time_ms() -> u64 {
    debug!("default_minimum_loading_time_ms: called");
    300
}

fn default_preserve_stale_data() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        debug!("CoordinatorConfig::default: called");
        Self {
            minimum_loading_time_ms: default_minimum_loading_time_ms(),
            preserve_stale_data: default_preserve_stale_data(),
            debug: false,
        }
    }
}

impl CoordinatorConfig {
    /// Minimum loading time as a Duration
    pub fn minimum_loading_time(&self) -> Duration {
        Duration::from_millis(self.minimum_loading_time_ms)
    }

    pub fn with_minimum_loading_time(mut self, duration: Duration) -> Self {
        self.minimum_loading_time_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_preserve_stale_data(mut self, preserve: bool) -> Self {
        self.preserve_stale_data = preserve;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
