//! Kubernetes backend implementation.
//!
//! This module provides the `K8sBackend`, which runs a cluster's master and agents as
//! pods in one namespace.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use mcluster_config::ClusterConfig;
use mcluster_core::{ClusterId, NodeId};
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackend, HealthProbe};
use crate::error::{LaunchError, RestartError};
use crate::pod::{build_node_pod, cluster_selector, pod_name_for_node, NodePodParams};
use crate::types::{
    node_plan, K8sBackendConfig, NodeIdent, NodeProcess, NodeRole, ProbeOutcome, ProcessSet,
};

/// Interval between pod API polls while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Extra time on top of the grace period before a pod is force-deleted.
const DELETE_SLACK: Duration = Duration::from_secs(5);

/// Kubernetes-based cluster backend.
pub struct K8sBackend {
    client: Client,
    config: K8sBackendConfig,
}

impl K8sBackend {
    /// Create a new Kubernetes backend.
    ///
    /// This will attempt to connect to the cluster using in-cluster config
    /// or kubeconfig file.
    ///
    /// # Errors
    ///
    /// Returns an error if the Kubernetes client cannot be created.
    pub async fn new(config: K8sBackendConfig) -> Result<Self, LaunchError> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, config))
    }

    /// Create a new backend with a pre-configured client.
    #[must_use]
    pub fn with_client(client: Client, config: K8sBackendConfig) -> Self {
        Self { client, config }
    }

    /// Get a reference to the backend config.
    #[must_use]
    pub fn config(&self) -> &K8sBackendConfig {
        &self.config
    }

    /// Get the pods API client for the configured namespace.
    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn ident(&self, pod_name: String) -> NodeIdent {
        NodeIdent::Pod {
            namespace: self.config.namespace.clone(),
            name: pod_name,
        }
    }

    async fn create_node(
        &self,
        cluster_id: ClusterId,
        config: &ClusterConfig,
        node_id: NodeId,
        role: &NodeRole,
        master_url: Option<&str>,
    ) -> Result<String, LaunchError> {
        let params = NodePodParams {
            cluster_id,
            node_id,
            role,
            config,
            master_url,
        };
        let pod = build_node_pod(&params, &self.config);
        let pod_name = pod_name_for_node(&cluster_id, node_id);

        self.pods_api().create(&PostParams::default(), &pod).await?;

        info!(
            cluster_id = %cluster_id.short(),
            node = %node_id,
            role = role.as_str(),
            pod_name,
            "Created node pod"
        );

        Ok(pod_name)
    }

    /// Wait for a pod to be assigned an IP.
    async fn wait_for_pod_ip(&self, pod_name: &str) -> Result<String, LaunchError> {
        let pods = self.pods_api();
        let deadline = tokio::time::Instant::now() + self.config.pod_ip_timeout();

        loop {
            if let Some(pod) = pods.get_opt(pod_name).await? {
                if let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
                    return Ok(ip);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LaunchError::Timeout(format!(
                    "pod {pod_name} got no IP within {}s",
                    self.config.pod_ip_timeout_secs
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until a pod is gone, up to `timeout`. Returns whether it disappeared.
    async fn wait_for_deletion(&self, pod_name: &str, timeout: Duration) -> bool {
        let pods = self.pods_api();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match pods.get_opt(pod_name).await {
                Ok(None) => return true,
                Ok(Some(_)) => {}
                Err(e) => debug!(pod_name, error = %e, "Failed to poll pod deletion"),
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Delete a pod with the configured grace period, then force-delete it if it lingers.
    ///
    /// A pod that is already gone counts as deleted.
    async fn delete_pod(&self, pod_name: &str) {
        let pods = self.pods_api();
        let graceful = DeleteParams {
            grace_period_seconds: Some(self.config.grace_period_secs),
            ..DeleteParams::default()
        };

        match pods.delete(pod_name, &graceful).await {
            Ok(_) => debug!(pod_name, "Deleting pod"),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(pod_name, "Pod not found, already terminated");
                return;
            }
            Err(e) => warn!(pod_name, error = %e, "Failed to delete pod"),
        }

        if self
            .wait_for_deletion(pod_name, self.config.grace_period() + DELETE_SLACK)
            .await
        {
            return;
        }

        warn!(pod_name, "Pod outlived its grace period, force deleting");
        let force = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        match pods.delete(pod_name, &force).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => warn!(pod_name, error = %e, "Failed to force delete pod"),
        }
    }

    /// Names of every pod that belongs to a cluster: the ones recorded in the
    /// process set plus any the label selector finds.
    async fn cluster_pod_names(&self, processes: &ProcessSet) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = processes
            .nodes
            .iter()
            .filter_map(|n| match &n.ident {
                NodeIdent::Pod { name, .. } => Some(name.clone()),
                NodeIdent::Pid(_) => None,
            })
            .collect();

        let params = ListParams::default().labels(&cluster_selector(&processes.cluster_id));
        match self.pods_api().list(&params).await {
            Ok(list) => names.extend(list.items.into_iter().filter_map(|p| p.metadata.name)),
            Err(e) => warn!(
                cluster_id = %processes.cluster_id.short(),
                error = %e,
                "Failed to list cluster pods"
            ),
        }

        names
    }

    fn is_pod_ready(pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
    }

    fn pod_phase(pod: &Pod) -> &str {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown")
    }

    /// Extract container error information from pod status.
    ///
    /// Checks container statuses for waiting states that will not resolve on their own
    /// (e.g., `ImagePullBackOff`, `CrashLoopBackOff`).
    fn extract_container_error(pod: &Pod) -> Option<String> {
        const ERROR_REASONS: [&str; 6] = [
            "ImagePullBackOff",
            "ErrImagePull",
            "CrashLoopBackOff",
            "CreateContainerError",
            "CreateContainerConfigError",
            "InvalidImageName",
        ];

        let status = pod.status.as_ref()?;
        status
            .container_statuses
            .as_ref()
            .into_iter()
            .flatten()
            .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref())
            .find_map(|waiting| {
                let reason = waiting.reason.as_ref()?;
                ERROR_REASONS
                    .contains(&reason.as_str())
                    .then(|| waiting.message.clone().unwrap_or_else(|| reason.clone()))
            })
    }
}

#[async_trait]
impl ClusterBackend for K8sBackend {
    async fn launch(
        &self,
        cluster_id: ClusterId,
        config: &ClusterConfig,
    ) -> Result<ProcessSet, LaunchError> {
        let plan = node_plan(config);
        let mut processes = ProcessSet::new(cluster_id, config.clone(), String::new());

        // Agents need the master's address, so the master goes first.
        let master_name = self
            .create_node(cluster_id, config, NodeId::MASTER, &NodeRole::Master, None)
            .await?;
        processes.nodes.push(NodeProcess {
            node_id: NodeId::MASTER,
            role: NodeRole::Master,
            ident: self.ident(master_name.clone()),
            restarts: 0,
        });

        let ip = self.wait_for_pod_ip(&master_name).await?;
        processes.endpoint = format!("http://{ip}:{}", config.master_port());

        for (node_id, role) in plan.into_iter().skip(1) {
            let pod_name = self
                .create_node(cluster_id, config, node_id, &role, Some(&processes.endpoint))
                .await?;
            processes.nodes.push(NodeProcess {
                node_id,
                role,
                ident: self.ident(pod_name),
                restarts: 0,
            });
        }

        info!(
            cluster_id = %cluster_id.short(),
            namespace = %self.config.namespace,
            nodes = processes.len(),
            endpoint = %processes.endpoint,
            "Launched Kubernetes cluster"
        );

        Ok(processes)
    }

    async fn terminate(&self, processes: &ProcessSet) {
        let names = self.cluster_pod_names(processes).await;
        if names.is_empty() {
            debug!(cluster_id = %processes.cluster_id.short(), "No pods left to terminate");
            return;
        }

        join_all(names.iter().map(|name| self.delete_pod(name))).await;

        info!(
            cluster_id = %processes.cluster_id.short(),
            pods = names.len(),
            "Terminated Kubernetes cluster"
        );
    }

    async fn restart_node(
        &self,
        processes: &ProcessSet,
        node: NodeId,
    ) -> Result<ProcessSet, RestartError> {
        let cluster_id = processes.cluster_id;
        let Some(current) = processes.node(node).cloned() else {
            return Err(RestartError::UnknownNode { cluster_id, node });
        };
        let NodeIdent::Pod { name: pod_name, .. } = &current.ident else {
            return Err(RestartError::UnknownCluster(cluster_id));
        };

        self.delete_pod(pod_name).await;
        tokio::time::sleep(processes.config.restart_policy().interval()).await;

        let master_url = (!node.is_master()).then_some(processes.endpoint.as_str());
        let relaunch = |source| RestartError::Relaunch { node, source };
        let new_name = self
            .create_node(cluster_id, &processes.config, node, &current.role, master_url)
            .await
            .map_err(relaunch)?;

        let mut next = processes.with_node(NodeProcess {
            ident: self.ident(new_name.clone()),
            restarts: current.restarts + 1,
            ..current.clone()
        });

        if node.is_master() {
            let ip = self.wait_for_pod_ip(&new_name).await.map_err(relaunch)?;
            next.endpoint = format!("http://{ip}:{}", processes.config.master_port());
        }

        info!(
            cluster_id = %cluster_id.short(),
            node = %node,
            pod_name = %new_name,
            restarts = current.restarts + 1,
            "Restarted node pod"
        );

        Ok(next)
    }
}

#[async_trait]
impl HealthProbe for K8sBackend {
    async fn probe(&self, processes: &ProcessSet) -> ProbeOutcome {
        let pods = self.pods_api();

        for node in &processes.nodes {
            let NodeIdent::Pod { name, .. } = &node.ident else {
                continue;
            };

            let pod = match pods.get_opt(name).await {
                Ok(Some(pod)) => pod,
                Ok(None) => return ProbeOutcome::Exited(format!("pod {name} not found")),
                Err(e) => return ProbeOutcome::NotReady(format!("pod {name}: {e}")),
            };

            match Self::pod_phase(&pod) {
                "Failed" | "Succeeded" => {
                    return ProbeOutcome::Exited(format!(
                        "pod {name} is {}",
                        Self::pod_phase(&pod)
                    ));
                }
                _ => {}
            }

            if let Some(reason) = Self::extract_container_error(&pod) {
                return ProbeOutcome::Exited(format!("pod {name}: {reason}"));
            }

            if !Self::is_pod_ready(&pod) {
                return ProbeOutcome::NotReady(format!("pod {name} is not ready"));
            }
        }

        if processes.nodes.is_empty() {
            return ProbeOutcome::NotReady("no pods started".to_string());
        }

        ProbeOutcome::Ready
    }
}
