//! Process group configuration from the environment.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::heartbeat::{HeartbeatPolicy, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT_MS};
use crate::listener::DEFAULT_DRAIN_TIMEOUT;

/// Timing and location settings shared by every process in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub heartbeat: HeartbeatPolicy,
    pub drain_timeout: Duration,
    /// Directory holding the control sockets
    pub runtime_dir: PathBuf,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatPolicy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            runtime_dir: default_runtime_dir(),
        }
    }
}

impl GroupConfig {
    /// Read `MOLT_HEARTBEAT_INTERVAL_MS`, `MOLT_HEARTBEAT_TIMEOUT_MS`,
    /// `MOLT_DRAIN_TIMEOUT_SECS` and `MOLT_RUNTIME_DIR`.
    ///
    /// Missing or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

        let interval = number("MOLT_HEARTBEAT_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(HEARTBEAT_INTERVAL);
        let timeout_ms = number("MOLT_HEARTBEAT_TIMEOUT_MS").unwrap_or(HEARTBEAT_TIMEOUT_MS);
        let drain_timeout = number("MOLT_DRAIN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        let runtime_dir = lookup("MOLT_RUNTIME_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_runtime_dir);

        Self {
            heartbeat: HeartbeatPolicy::new(interval, timeout_ms),
            drain_timeout,
            runtime_dir,
        }
    }

    pub fn log_config(&self) {
        info!(
            heartbeat_interval_ms = self.heartbeat.interval.as_millis() as u64,
            heartbeat_timeout_ms = self.heartbeat.timeout_ms,
            drain_timeout_secs = self.drain_timeout.as_secs(),
            runtime_dir = %self.runtime_dir.display(),
            "Process group configuration"
        );
    }
}

fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir().join("molt")
}
