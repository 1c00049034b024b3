//! Error types for the runner crate.

use mcluster_core::{ClusterId, NodeId, Variant};
use thiserror::Error;

/// Errors that can occur while launching a cluster.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The master port is already bound by another process.
    #[error("Master port {port} on {host} is already in use")]
    PortInUse {
        /// Host the master would bind.
        host: String,
        /// Port the master would bind.
        port: u16,
    },

    /// A node process could not be spawned.
    #[error("Failed to spawn node {node}: {source}")]
    Spawn {
        /// Node that failed to start.
        node: NodeId,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The per-cluster working directory or config artifact could not be written.
    #[error("Failed to prepare cluster workspace: {0}")]
    Workspace(#[source] std::io::Error),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// A bounded wait inside the launch ran out.
    #[error("Timeout during launch: {0}")]
    Timeout(String),

    /// No backend is available for the requested kind.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend refused the launch.
    #[error("Launch rejected: {0}")]
    Rejected(String),
}

impl LaunchError {
    /// Check if this error is retriable.
    ///
    /// The lifecycle manager never retries on its own; this is for callers that choose to.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::PortInUse { .. } | Self::KubeApi(_) | Self::Timeout(_)
        )
    }
}

/// Errors that can occur while restarting a node.
#[derive(Error, Debug)]
pub enum RestartError {
    /// The node is not part of the cluster.
    #[error("Unknown node {node} in cluster {cluster_id}")]
    UnknownNode {
        /// Cluster that was addressed.
        cluster_id: ClusterId,
        /// Node that was requested.
        node: NodeId,
    },

    /// The backend holds no running cluster with this ID.
    #[error("Cluster {0} is not running on this backend")]
    UnknownCluster(ClusterId),

    /// The cluster's variant does not allow restart injection.
    #[error("Cluster variant {0} does not support restarts")]
    NotRestartable(Variant),

    /// The node stopped but could not be started again.
    #[error("Failed to relaunch node {node}: {source}")]
    Relaunch {
        /// Node being restarted.
        node: NodeId,
        /// Launch failure.
        #[source]
        source: LaunchError,
    },
}

/// A specialized Result type for launch operations.
pub type Result<T> = std::result::Result<T, LaunchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_errors() {
        assert!(LaunchError::PortInUse {
            host: "127.0.0.1".to_string(),
            port: 8080
        }
        .is_retriable());
        assert!(LaunchError::Timeout("pod ip".to_string()).is_retriable());
        assert!(!LaunchError::Rejected("no".to_string()).is_retriable());
        assert!(!LaunchError::BackendUnavailable("k8s".to_string()).is_retriable());
    }

    #[test]
    fn restart_error_messages() {
        let cluster_id = ClusterId::from_bytes([7u8; 32]);
        let err = RestartError::UnknownNode {
            cluster_id,
            node: NodeId::new(9),
        };
        assert!(err.to_string().contains("Unknown node 9"));

        let err = RestartError::NotRestartable(Variant::Default);
        assert_eq!(err.to_string(), "Cluster variant default does not support restarts");
    }
}
