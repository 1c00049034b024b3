//! Error types for the lifecycle manager.
//!
//! [`AcquireError`] covers everything that can go wrong while bringing a cluster up for a
//! caller. [`ControlError`] covers operations on clusters that are already registered.

use std::time::Duration;

use mcluster_config::ConfigError;
use mcluster_core::{ClusterId, ScopeKey};
use mcluster_runner::{LaunchError, RestartError};
use thiserror::Error;

use crate::lifecycle::HealthState;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// A cluster did not pass its readiness probe in time.
#[derive(Debug, Clone, Error)]
#[error("cluster {} did not become ready within {waited:?}: {reason}", cluster_id.short())]
pub struct ReadinessTimeoutError {
    /// The cluster that was probed.
    pub cluster_id: ClusterId,
    /// How long the waiter kept probing.
    pub waited: Duration,
    /// The last reason the probe gave.
    pub reason: String,
}

/// Errors returned while acquiring a cluster.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The variant's configuration could not be built.
    #[error("invalid configuration for {key}: {source}")]
    Config {
        /// The key being acquired.
        key: ScopeKey,
        /// The validation failure.
        #[source]
        source: ConfigError,
    },

    /// The backend failed to start the cluster.
    #[error("failed to launch cluster for {key}: {source}")]
    Launch {
        /// The key being acquired.
        key: ScopeKey,
        /// The backend failure.
        #[source]
        source: LaunchError,
    },

    /// The backend did not finish launching in time.
    #[error("launch of cluster for {key} did not finish within {timeout:?}")]
    LaunchTimeout {
        /// The key being acquired.
        key: ScopeKey,
        /// The launch deadline that was exceeded.
        timeout: Duration,
    },

    /// The cluster started but never became ready.
    #[error("cluster for {key} was not ready: {source}")]
    ReadinessTimeout {
        /// The key being acquired.
        key: ScopeKey,
        /// The readiness failure.
        #[source]
        source: ReadinessTimeoutError,
    },

    /// A registered cluster exists for the key but cannot be shared.
    #[error("cluster for {key} is {health} and cannot be shared")]
    Unhealthy {
        /// The key being acquired.
        key: ScopeKey,
        /// The cluster's current health.
        health: HealthState,
    },

    /// A lifecycle operation failed.
    #[error(transparent)]
    Control(#[from] ControlError),
}

impl AcquireError {
    /// The scope key the failed acquisition was for, when known.
    #[must_use]
    pub const fn key(&self) -> Option<&ScopeKey> {
        match self {
            Self::Config { key, .. }
            | Self::Launch { key, .. }
            | Self::LaunchTimeout { key, .. }
            | Self::ReadinessTimeout { key, .. }
            | Self::Unhealthy { key, .. } => Some(key),
            Self::Control(_) => None,
        }
    }

    /// Returns true if acquiring again may succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Launch { source, .. } => source.is_retriable(),
            Self::LaunchTimeout { .. } | Self::ReadinessTimeout { .. } => true,
            Self::Config { .. } | Self::Unhealthy { .. } | Self::Control(_) => false,
        }
    }
}

/// Errors from operations on registered clusters.
#[derive(Debug, Error)]
pub enum ControlError {
    /// No cluster is registered for the key.
    #[error("no cluster registered for {0}")]
    NotFound(ScopeKey),

    /// `release` was called without a matching `acquire`.
    #[error("cluster for {0} has no outstanding acquisitions")]
    NotAcquired(ScopeKey),

    /// A live cluster cannot be removed from the registry.
    #[error("cluster for {key} is still {health} and cannot be removed")]
    StillLive {
        /// The key whose removal was refused.
        key: ScopeKey,
        /// The cluster's current health.
        health: HealthState,
    },

    /// The requested health transition is not valid.
    #[error(
        "invalid health transition for cluster {}: cannot go from {from} to {to}",
        cluster_id.short()
    )]
    InvalidTransition {
        /// The cluster being transitioned.
        cluster_id: ClusterId,
        /// The current health.
        from: HealthState,
        /// The requested health.
        to: HealthState,
    },

    /// A node restart failed.
    #[error("restart failed for {key}: {source}")]
    Restart {
        /// The key of the restarted cluster.
        key: ScopeKey,
        /// The backend failure.
        #[source]
        source: RestartError,
    },

    /// A relaunch failed.
    #[error("relaunch failed for {key}: {source}")]
    Launch {
        /// The key of the relaunched cluster.
        key: ScopeKey,
        /// The backend failure.
        #[source]
        source: LaunchError,
    },

    /// The cluster did not return to ready after a lifecycle operation.
    #[error("cluster for {key} did not recover: {source}")]
    ReadinessTimeout {
        /// The key of the cluster.
        key: ScopeKey,
        /// The readiness failure.
        #[source]
        source: ReadinessTimeoutError,
    },

    /// The extended configuration was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The cross-process session lock could not be taken.
    #[error("session lock error: {0}")]
    Lock(#[source] std::io::Error),
}

impl ControlError {
    /// Returns true if the cluster involved is no longer usable.
    #[must_use]
    pub const fn leaves_cluster_failed(&self) -> bool {
        matches!(
            self,
            Self::Launch { .. }
                | Self::ReadinessTimeout { .. }
                | Self::Restart {
                    source: RestartError::Relaunch { .. } | RestartError::UnknownCluster(_),
                    ..
                }
        )
    }
}
