//! Types for the runner crate.

use std::path::PathBuf;
use std::time::Duration;

use mcluster_config::{BackendKind, ClusterConfig};
use mcluster_core::{ClusterId, NodeId};
use serde::{Deserialize, Serialize};

/// What a node does in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum NodeRole {
    /// The single master.
    Master,
    /// An agent serving one resource pool.
    Agent {
        /// Resource pool the agent registers with.
        pool: String,
    },
}

impl NodeRole {
    /// Short role name used in labels and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Agent { .. } => "agent",
        }
    }

    /// The resource pool for agents.
    #[must_use]
    pub fn pool(&self) -> Option<&str> {
        match self {
            Self::Master => None,
            Self::Agent { pool } => Some(pool),
        }
    }
}

/// Backend-specific identifier for a running node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeIdent {
    /// A local OS process.
    Pid(u32),
    /// A Kubernetes pod.
    Pod {
        /// Namespace the pod lives in.
        namespace: String,
        /// Pod name.
        name: String,
    },
}

impl std::fmt::Display for NodeIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "pid {pid}"),
            Self::Pod { namespace, name } => write!(f, "pod {namespace}/{name}"),
        }
    }
}

/// One started node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeProcess {
    /// Node identifier within the cluster.
    pub node_id: NodeId,
    /// Role of the node.
    pub role: NodeRole,
    /// Process or pod backing the node.
    pub ident: NodeIdent,
    /// How many times the node has been restarted in place.
    pub restarts: u32,
}

/// The set of nodes a backend started for one cluster.
///
/// This is a plain value: backends keep any OS or API handles internally, keyed by
/// [`ClusterId`], so a `ProcessSet` can be cloned, logged and serialized freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSet {
    /// Identity of the cluster, stable across node restarts.
    pub cluster_id: ClusterId,
    /// Backend that owns the nodes.
    pub backend: BackendKind,
    /// Configuration the cluster runs.
    pub config: ClusterConfig,
    /// Base URL of the master's API.
    pub endpoint: String,
    /// Started nodes, master first.
    pub nodes: Vec<NodeProcess>,
}

impl ProcessSet {
    /// Create a process set with no nodes yet.
    #[must_use]
    pub fn new(cluster_id: ClusterId, config: ClusterConfig, endpoint: impl Into<String>) -> Self {
        Self {
            cluster_id,
            backend: config.backend(),
            config,
            endpoint: endpoint.into(),
            nodes: Vec::new(),
        }
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&NodeProcess> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// The master node, if started.
    #[must_use]
    pub fn master(&self) -> Option<&NodeProcess> {
        self.node(NodeId::MASTER)
    }

    /// Iterate over the started agents.
    pub fn agents(&self) -> impl Iterator<Item = &NodeProcess> {
        self.nodes.iter().filter(|n| !n.node_id.is_master())
    }

    /// Number of started nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node was started.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Return a copy in which `node` replaced the entry with the same id.
    #[must_use]
    pub fn with_node(&self, node: NodeProcess) -> Self {
        let mut next = self.clone();
        match next.nodes.iter_mut().find(|n| n.node_id == node.node_id) {
            Some(slot) => *slot = node,
            None => next.nodes.push(node),
        }
        next
    }
}

/// The nodes a configuration calls for: the master, then one agent per resource pool.
#[must_use]
pub fn node_plan(config: &ClusterConfig) -> Vec<(NodeId, NodeRole)> {
    std::iter::once((NodeId::MASTER, NodeRole::Master))
        .chain((0u32..).zip(config.resource_pools()).map(|(n, pool)| {
            (
                NodeId::agent(n),
                NodeRole::Agent {
                    pool: pool.name.clone(),
                },
            )
        }))
        .collect()
}

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Every node is up and the master answers.
    Ready,
    /// The cluster is still coming up.
    NotReady(String),
    /// A node has exited; the cluster will not become ready on its own.
    Exited(String),
}

impl ProbeOutcome {
    /// Whether the probe reported ready.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Configuration for the local process backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBackendConfig {
    /// Master executable.
    pub master_bin: PathBuf,
    /// Agent executable.
    pub agent_bin: PathBuf,
    /// Host the master binds and agents connect to.
    pub host: String,
    /// Seconds a node gets to exit after SIGTERM before it is killed.
    pub grace_period_secs: u64,
    /// Timeout for each HTTP readiness request, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Bind the master to the configured port instead of a free one picked per cluster.
    pub fixed_master_port: bool,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            master_bin: PathBuf::from("cluster-master"),
            agent_bin: PathBuf::from("cluster-agent"),
            host: "127.0.0.1".to_string(),
            grace_period_secs: 10,
            probe_timeout_ms: 500,
            fixed_master_port: false,
        }
    }
}

impl LocalBackendConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `MCLUSTER_MASTER_BIN`: master executable
    /// - `MCLUSTER_AGENT_BIN`: agent executable
    /// - `MCLUSTER_HOST`: host the master binds
    /// - `MCLUSTER_GRACE_PERIOD_SECS`: SIGTERM grace period
    /// - `MCLUSTER_FIXED_MASTER_PORT`: use the configured master port as is
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MCLUSTER_MASTER_BIN") {
            config.master_bin = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("MCLUSTER_AGENT_BIN") {
            config.agent_bin = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("MCLUSTER_HOST") {
            config.host = val;
        }
        if let Ok(val) = std::env::var("MCLUSTER_GRACE_PERIOD_SECS") {
            if let Ok(n) = val.parse() {
                config.grace_period_secs = n;
            }
        }
        if let Ok(val) = std::env::var("MCLUSTER_FIXED_MASTER_PORT") {
            if let Ok(fixed) = val.parse() {
                config.fixed_master_port = fixed;
            }
        }

        config
    }

    /// Grace period as a `Duration`.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Probe timeout as a `Duration`.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Master URL for a given port.
    #[must_use]
    pub fn master_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.host)
    }
}

/// Configuration for the Kubernetes backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sBackendConfig {
    /// Namespace the cluster's pods are created in.
    pub namespace: String,
    /// Container image for the master.
    pub master_image: String,
    /// Container image for agents.
    pub agent_image: String,
    /// Pod termination grace period in seconds.
    pub grace_period_secs: u32,
    /// How long launch waits for the master pod to get an IP, in seconds.
    pub pod_ip_timeout_secs: u64,
}

impl Default for K8sBackendConfig {
    fn default() -> Self {
        Self {
            namespace: "mcluster".to_string(),
            master_image: "ghcr.io/mcluster/cluster-master:latest".to_string(),
            agent_image: "ghcr.io/mcluster/cluster-agent:latest".to_string(),
            grace_period_secs: 10,
            pod_ip_timeout_secs: 120,
        }
    }
}

impl K8sBackendConfig {
    /// Create a config for the given namespace.
    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `MCLUSTER_K8S_NAMESPACE`: namespace for cluster pods
    /// - `MCLUSTER_MASTER_IMAGE`: master container image
    /// - `MCLUSTER_AGENT_IMAGE`: agent container image
    /// - `MCLUSTER_GRACE_PERIOD_SECS`: pod termination grace period
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MCLUSTER_K8S_NAMESPACE") {
            config.namespace = val;
        }
        if let Ok(val) = std::env::var("MCLUSTER_MASTER_IMAGE") {
            config.master_image = val;
        }
        if let Ok(val) = std::env::var("MCLUSTER_AGENT_IMAGE") {
            config.agent_image = val;
        }
        if let Ok(val) = std::env::var("MCLUSTER_GRACE_PERIOD_SECS") {
            if let Ok(n) = val.parse() {
                config.grace_period_secs = n;
            }
        }

        config
    }

    /// Grace period as a `Duration`.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.grace_period_secs))
    }

    /// Pod IP wait as a `Duration`.
    #[must_use]
    pub const fn pod_ip_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_ip_timeout_secs)
    }
}
