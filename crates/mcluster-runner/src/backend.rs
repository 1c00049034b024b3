//! Backend capability traits.
//!
//! A backend knows how to start, stop and restart the nodes of a cluster. Readiness is a
//! separate capability ([`HealthProbe`]) so the lifecycle manager can poll any backend the
//! same way.

use std::sync::Arc;

use async_trait::async_trait;
use mcluster_config::{BackendKind, ClusterConfig};
use mcluster_core::{ClusterId, NodeId};

use tracing::warn;

use crate::error::{LaunchError, RestartError};
use crate::k8s::K8sBackend;
use crate::local::LocalProcessBackend;
use crate::types::{K8sBackendConfig, ProbeOutcome, ProcessSet};

/// Starts, stops and restarts the nodes of a cluster.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Start the master and one agent per resource pool.
    ///
    /// Every node started is tracked under `cluster_id` before this returns or fails,
    /// so a later [`terminate`](Self::terminate) reaches nodes of a failed or abandoned
    /// launch too.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot allocate or start a node.
    async fn launch(
        &self,
        cluster_id: ClusterId,
        config: &ClusterConfig,
    ) -> Result<ProcessSet, LaunchError>;

    /// Stop every node tracked for `processes.cluster_id`.
    ///
    /// Graceful first, forced after a bounded grace period. Idempotent; failures are
    /// logged, never returned.
    async fn terminate(&self, processes: &ProcessSet);

    /// Stop one node and start it again in place, preserving the cluster's identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the node or cluster is unknown, or the node cannot be started
    /// again.
    async fn restart_node(
        &self,
        processes: &ProcessSet,
        node: NodeId,
    ) -> Result<ProcessSet, RestartError>;
}

/// Reports whether a launched cluster is ready.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the cluster once.
    async fn probe(&self, processes: &ProcessSet) -> ProbeOutcome;
}

/// A backend paired with the probe used to check its clusters.
#[derive(Clone)]
pub struct BackendBinding {
    /// Node lifecycle.
    pub runner: Arc<dyn ClusterBackend>,
    /// Readiness checks.
    pub probe: Arc<dyn HealthProbe>,
}

impl BackendBinding {
    /// Pair a runner with a separate probe.
    #[must_use]
    pub fn new(runner: Arc<dyn ClusterBackend>, probe: Arc<dyn HealthProbe>) -> Self {
        Self { runner, probe }
    }

    /// Use one value as both runner and probe.
    #[must_use]
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: ClusterBackend + HealthProbe + 'static,
    {
        Self {
            runner: backend.clone(),
            probe: backend,
        }
    }
}

impl std::fmt::Debug for BackendBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendBinding").finish_non_exhaustive()
    }
}

/// The backends available to a lifecycle manager, by kind.
#[derive(Debug, Clone, Default)]
pub struct Backends {
    local: Option<BackendBinding>,
    kubernetes: Option<BackendBinding>,
}

impl Backends {
    /// No backends registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the same binding for every backend kind.
    #[must_use]
    pub fn uniform(binding: BackendBinding) -> Self {
        Self {
            local: Some(binding.clone()),
            kubernetes: Some(binding),
        }
    }

    /// Register the binding for a backend kind.
    #[must_use]
    pub fn with(mut self, kind: BackendKind, binding: BackendBinding) -> Self {
        match kind {
            BackendKind::LocalProcess => self.local = Some(binding),
            BackendKind::Kubernetes => self.kubernetes = Some(binding),
        }
        self
    }

    /// The local process backend, plus the Kubernetes backend when a client can be built
    /// from the environment.
    pub async fn from_env() -> Self {
        let local = Arc::new(LocalProcessBackend::from_env());
        let backends = Self::new().with(BackendKind::LocalProcess, BackendBinding::shared(local));

        match K8sBackend::new(K8sBackendConfig::from_env()).await {
            Ok(k8s) => backends.with(
                BackendKind::Kubernetes,
                BackendBinding::shared(Arc::new(k8s)),
            ),
            Err(e) => {
                warn!(error = %e, "Kubernetes backend unavailable, k8s clusters cannot launch");
                backends
            }
        }
    }

    /// Look up the binding for a backend kind.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError::BackendUnavailable` if none is registered.
    pub fn get(&self, kind: BackendKind) -> Result<&BackendBinding, LaunchError> {
        let binding = match kind {
            BackendKind::LocalProcess => self.local.as_ref(),
            BackendKind::Kubernetes => self.kubernetes.as_ref(),
        };
        binding.ok_or_else(|| {
            LaunchError::BackendUnavailable(format!("no {kind} backend is configured"))
        })
    }
}

/// An in-memory backend for testing without real processes or a Kubernetes cluster.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::time::Duration;

    use crate::types::{node_plan, NodeIdent, NodeProcess};

    /// A mock backend that records what it was asked to do.
    #[derive(Default)]
    pub struct MockBackend {
        state: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        clusters: HashMap<ClusterId, BTreeMap<NodeId, u32>>,
        next_pid: u32,
        launches: usize,
        started_nodes: usize,
        terminated_nodes: usize,
        terminate_calls: usize,
        restarts: usize,
        fail_at_node: Option<u32>,
        launch_delay: Option<Duration>,
        never_ready: bool,
        scripted: VecDeque<ProbeOutcome>,
    }

    impl MockState {
        fn next_pid(&mut self) -> u32 {
            self.next_pid += 1;
            10_000 + self.next_pid
        }
    }

    impl MockBackend {
        /// Create a new mock backend.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every launch fail after starting `k` nodes.
        #[must_use]
        pub fn failing_at_node(self, k: u32) -> Self {
            self.state.lock().fail_at_node = Some(k);
            self
        }

        /// Make every probe report not ready.
        #[must_use]
        pub fn never_ready(self) -> Self {
            self.state.lock().never_ready = true;
            self
        }

        /// Pause each launch after its nodes have started.
        #[must_use]
        pub fn with_launch_delay(self, delay: Duration) -> Self {
            self.state.lock().launch_delay = Some(delay);
            self
        }

        /// Queue probe outcomes, returned before the default `Ready`.
        pub fn script_probes(&self, outcomes: impl IntoIterator<Item = ProbeOutcome>) {
            self.state.lock().scripted.extend(outcomes);
        }

        /// Number of launch calls.
        #[must_use]
        pub fn launch_count(&self) -> usize {
            self.state.lock().launches
        }

        /// Number of nodes ever started, restarts excluded.
        #[must_use]
        pub fn started_nodes(&self) -> usize {
            self.state.lock().started_nodes
        }

        /// Number of nodes stopped by `terminate`.
        #[must_use]
        pub fn terminated_nodes(&self) -> usize {
            self.state.lock().terminated_nodes
        }

        /// Number of `terminate` calls that found a live cluster.
        #[must_use]
        pub fn terminate_count(&self) -> usize {
            self.state.lock().terminate_calls
        }

        /// Number of node restarts.
        #[must_use]
        pub fn restart_count(&self) -> usize {
            self.state.lock().restarts
        }

        /// Number of clusters with running nodes.
        #[must_use]
        pub fn live_clusters(&self) -> usize {
            self.state.lock().clusters.len()
        }

        /// Number of running nodes across all clusters.
        #[must_use]
        pub fn live_nodes(&self) -> usize {
            self.state.lock().clusters.values().map(BTreeMap::len).sum()
        }

        /// The fake pid of a running node.
        #[must_use]
        pub fn pid_of(&self, cluster_id: &ClusterId, node: NodeId) -> Option<u32> {
            self.state
                .lock()
                .clusters
                .get(cluster_id)
                .and_then(|nodes| nodes.get(&node).copied())
        }
    }

    #[async_trait]
    impl ClusterBackend for MockBackend {
        async fn launch(
            &self,
            cluster_id: ClusterId,
            config: &ClusterConfig,
        ) -> Result<ProcessSet, LaunchError> {
            let mut processes = ProcessSet::new(
                cluster_id,
                config.clone(),
                format!("http://mock-{}:{}", cluster_id.short(), config.master_port()),
            );

            let (delay, failure) = {
                let mut state = self.state.lock();
                state.launches += 1;
                let fail_at = state.fail_at_node;
                let mut failure = None;

                for (node_id, role) in node_plan(config) {
                    if fail_at == Some(node_id.index()) {
                        failure = Some(node_id);
                        break;
                    }
                    let pid = state.next_pid();
                    state
                        .clusters
                        .entry(cluster_id)
                        .or_default()
                        .insert(node_id, pid);
                    state.started_nodes += 1;
                    processes.nodes.push(NodeProcess {
                        node_id,
                        role,
                        ident: NodeIdent::Pid(pid),
                        restarts: 0,
                    });
                }

                (state.launch_delay, failure)
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(node) = failure {
                return Err(LaunchError::Rejected(format!(
                    "mock backend refused node {node}"
                )));
            }

            Ok(processes)
        }

        async fn terminate(&self, processes: &ProcessSet) {
            let mut state = self.state.lock();
            if let Some(nodes) = state.clusters.remove(&processes.cluster_id) {
                state.terminate_calls += 1;
                state.terminated_nodes += nodes.len();
            }
        }

        async fn restart_node(
            &self,
            processes: &ProcessSet,
            node: NodeId,
        ) -> Result<ProcessSet, RestartError> {
            let Some(current) = processes.node(node).cloned() else {
                return Err(RestartError::UnknownNode {
                    cluster_id: processes.cluster_id,
                    node,
                });
            };

            let mut state = self.state.lock();
            let pid = state.next_pid();
            let Some(nodes) = state.clusters.get_mut(&processes.cluster_id) else {
                return Err(RestartError::UnknownCluster(processes.cluster_id));
            };
            nodes.insert(node, pid);
            state.restarts += 1;

            Ok(processes.with_node(NodeProcess {
                ident: NodeIdent::Pid(pid),
                restarts: current.restarts + 1,
                ..current
            }))
        }
    }

    #[async_trait]
    impl HealthProbe for MockBackend {
        async fn probe(&self, processes: &ProcessSet) -> ProbeOutcome {
            let mut state = self.state.lock();
            if !state.clusters.contains_key(&processes.cluster_id) {
                return ProbeOutcome::Exited(format!(
                    "cluster {} is not running",
                    processes.cluster_id.short()
                ));
            }
            if state.never_ready {
                return ProbeOutcome::NotReady("mock cluster never becomes ready".to_string());
            }
            state.scripted.pop_front().unwrap_or(ProbeOutcome::Ready)
        }
    }
}
