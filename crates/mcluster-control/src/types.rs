//! Configuration types for the lifecycle manager and session.

use std::path::PathBuf;
use std::time::Duration;

use mcluster_config::ClusterDefaults;

/// Configuration for the cluster lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How long a backend may take to start every node (seconds).
    pub launch_timeout_secs: u64,
    /// How long a launched cluster may take to become ready (seconds).
    pub ready_timeout_secs: u64,
    /// Spacing between readiness probes (milliseconds).
    pub poll_interval_ms: u64,
    /// Keep session-scoped clusters running when their last lease is released.
    ///
    /// When set, session clusters are only torn down by `shutdown` or `shutdown_all`.
    pub keep_session_clusters: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            launch_timeout_secs: 300,
            ready_timeout_secs: 120,
            poll_interval_ms: 500,
            keep_session_clusters: true,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MCLUSTER_LAUNCH_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.launch_timeout_secs = n;
            }
        }
        if let Ok(val) = std::env::var("MCLUSTER_READY_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.ready_timeout_secs = n;
            }
        }
        if let Ok(val) = std::env::var("MCLUSTER_POLL_INTERVAL_MS") {
            if let Ok(n) = val.parse::<u64>() {
                if n > 0 {
                    config.poll_interval_ms = n;
                }
            }
        }
        if let Ok(val) = std::env::var("MCLUSTER_KEEP_SESSION_CLUSTERS") {
            config.keep_session_clusters = !matches!(
                val.to_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }

        config
    }

    /// Launch deadline.
    #[must_use]
    pub const fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    /// Readiness deadline.
    #[must_use]
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Readiness poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Everything needed to start a [`ClusterSession`](crate::ClusterSession).
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Lifecycle manager settings.
    pub manager: ManagerConfig,
    /// Base settings for cluster configurations.
    pub defaults: ClusterDefaults,
    /// Lock file serializing launches across worker processes; none disables locking.
    pub lock_path: Option<PathBuf>,
}

impl SessionSettings {
    /// Load settings from environment variables.
    ///
    /// `MCLUSTER_LOCK_FILE` enables the cross-process session lock.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            manager: ManagerConfig::from_env(),
            defaults: ClusterDefaults::from_env(),
            lock_path: std::env::var("MCLUSTER_LOCK_FILE")
                .ok()
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Use `path` as the session lock file.
    #[must_use]
    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }
}
