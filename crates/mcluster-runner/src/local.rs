//! Local process backend.
//!
//! Runs the master and agents as child processes of the test binary. Each cluster gets a
//! temporary working directory holding the master config artifact and one log file per
//! node. Children are spawned in their own process group with `kill_on_drop`, so a
//! panicking test cannot leave them behind.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mcluster_config::ClusterConfig;
use mcluster_core::{ClusterId, NodeId};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackend, HealthProbe};
use crate::error::{LaunchError, RestartError};
use crate::probe::HttpHealthProbe;
use crate::types::{
    node_plan, LocalBackendConfig, NodeIdent, NodeProcess, NodeRole, ProbeOutcome, ProcessSet,
};

/// File name of the master config artifact inside a cluster's working directory.
pub const MASTER_CONFIG_FILE: &str = "master.json";

/// Interval at which a stopping child is polled for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a killed child gets to be reaped before it is abandoned.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

struct LocalCluster {
    workdir: TempDir,
    children: BTreeMap<NodeId, Child>,
}

/// Launches clusters as local child processes.
pub struct LocalProcessBackend {
    config: LocalBackendConfig,
    clusters: Mutex<HashMap<ClusterId, LocalCluster>>,
    http: HttpHealthProbe,
}

impl LocalProcessBackend {
    /// Create a backend with the given configuration.
    #[must_use]
    pub fn new(config: LocalBackendConfig) -> Self {
        let http = HttpHealthProbe::new(config.probe_timeout());
        Self {
            config,
            clusters: Mutex::new(HashMap::new()),
            http,
        }
    }

    /// Create a backend configured from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(LocalBackendConfig::from_env())
    }

    /// Get a reference to the backend config.
    #[must_use]
    pub fn config(&self) -> &LocalBackendConfig {
        &self.config
    }

    /// Number of clusters with tracked children.
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.clusters.lock().len()
    }

    /// Pick the port the cluster's master will bind.
    ///
    /// Every cluster gets its own free port unless the backend is pinned to the configured
    /// one, in which case that port must be free.
    async fn master_port(&self, configured: u16) -> Result<u16, LaunchError> {
        let port = if self.config.fixed_master_port { configured } else { 0 };
        match tokio::net::TcpListener::bind((self.config.host.as_str(), port)).await {
            Ok(listener) => {
                let addr = listener.local_addr().map_err(|e| {
                    LaunchError::BackendUnavailable(format!("no local address: {e}"))
                })?;
                let port = addr.port();
                drop(listener);
                Ok(port)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(LaunchError::PortInUse {
                host: self.config.host.clone(),
                port,
            }),
            Err(e) => Err(LaunchError::BackendUnavailable(format!(
                "cannot bind {}:{port}: {e}",
                self.config.host
            ))),
        }
    }

    fn prepare_workdir(
        cluster_id: ClusterId,
        config: &ClusterConfig,
    ) -> Result<TempDir, LaunchError> {
        let workdir = tempfile::Builder::new()
            .prefix(&format!("mcluster-{}-", cluster_id.short()))
            .tempdir()
            .map_err(LaunchError::Workspace)?;
        write_master_config(&workdir.path().join(MASTER_CONFIG_FILE), config)?;
        Ok(workdir)
    }

    fn spawn_node(
        &self,
        cluster_id: ClusterId,
        config: &ClusterConfig,
        workdir: &Path,
        node_id: NodeId,
        role: &NodeRole,
    ) -> Result<Child, LaunchError> {
        let spawn_err = |source| LaunchError::Spawn {
            node: node_id,
            source,
        };

        let config_path = workdir.join(MASTER_CONFIG_FILE);
        let master_url = self.config.master_url(config.master_port());

        let mut cmd = match role {
            NodeRole::Master => {
                let mut cmd = Command::new(&self.config.master_bin);
                cmd.arg("--config-file").arg(&config_path);
                cmd
            }
            NodeRole::Agent { pool } => {
                let mut cmd = Command::new(&self.config.agent_bin);
                cmd.arg("--master-host")
                    .arg(&self.config.host)
                    .arg("--master-port")
                    .arg(config.master_port().to_string())
                    .arg("--resource-pool")
                    .arg(pool);
                cmd.env("MCLUSTER_RESOURCE_POOL", pool);
                cmd
            }
        };

        let log_path = workdir.join(format!("node-{node_id}.log"));
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(spawn_err)?;
        let stderr = stdout.try_clone().map_err(spawn_err)?;

        cmd.env("MCLUSTER_CLUSTER_ID", cluster_id.to_hex())
            .env("MCLUSTER_NODE_ID", node_id.to_string())
            .env("MCLUSTER_MASTER_URL", &master_url)
            .env("MCLUSTER_CONFIG_PATH", &config_path)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(spawn_err)?;

        debug!(
            cluster_id = %cluster_id.short(),
            node = %node_id,
            role = role.as_str(),
            pid = ?child.id(),
            log = %log_path.display(),
            "Spawned node"
        );

        Ok(child)
    }

    /// Hand a spawned child to the cluster's tracking entry.
    ///
    /// If the cluster was terminated meanwhile the child is killed instead.
    fn track(&self, cluster_id: ClusterId, node_id: NodeId, mut child: Child) -> bool {
        let mut clusters = self.clusters.lock();
        if let Some(cluster) = clusters.get_mut(&cluster_id) {
            cluster.children.insert(node_id, child);
            true
        } else {
            let _ = child.start_kill();
            false
        }
    }
}

fn write_master_config(path: &Path, config: &ClusterConfig) -> Result<(), LaunchError> {
    let artifact = serde_json::to_vec_pretty(&config.master_config_json())
        .map_err(|e| LaunchError::Workspace(std::io::Error::other(e)))?;
    std::fs::write(path, artifact).map_err(LaunchError::Workspace)
}

fn child_pid(child: &Child, node_id: NodeId) -> Result<u32, LaunchError> {
    child.id().ok_or_else(|| LaunchError::Spawn {
        node: node_id,
        source: std::io::Error::other("process exited before reporting a pid"),
    })
}

fn signal_group(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match signal::kill(Pid::from_raw(-raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = ?sig, error = %e, "Failed to signal process group"),
    }
}

/// Poll `child` until it exits or `within` elapses; true if it exited.
async fn wait_exit(child: &mut Child, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if child.try_wait().ok().flatten().is_some() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// SIGTERM the child's process group, wait up to `grace`, then SIGKILL and reap.
///
/// Bounded by `grace` plus [`REAP_TIMEOUT`] even when signals cannot be delivered.
async fn stop_child(mut child: Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    signal_group(pid, Signal::SIGTERM);
    if wait_exit(&mut child, grace).await {
        debug!(pid, "Node exited after SIGTERM");
        return;
    }

    warn!(pid, grace_secs = grace.as_secs(), "Node ignored SIGTERM, killing");
    signal_group(pid, Signal::SIGKILL);
    if !wait_exit(&mut child, REAP_TIMEOUT).await {
        warn!(pid, "Node was not reaped after SIGKILL, abandoning");
        let _ = child.start_kill();
    }
}

#[async_trait]
impl ClusterBackend for LocalProcessBackend {
    async fn launch(
        &self,
        cluster_id: ClusterId,
        config: &ClusterConfig,
    ) -> Result<ProcessSet, LaunchError> {
        let port = self.master_port(config.master_port()).await?;
        let config = &config.with_master_port(port);

        let workdir = Self::prepare_workdir(cluster_id, config)?;
        let workdir_path = workdir.path().to_path_buf();
        self.clusters.lock().insert(
            cluster_id,
            LocalCluster {
                workdir,
                children: BTreeMap::new(),
            },
        );

        let mut processes = ProcessSet::new(
            cluster_id,
            config.clone(),
            self.config.master_url(config.master_port()),
        );

        for (node_id, role) in node_plan(config) {
            let child = self.spawn_node(cluster_id, config, &workdir_path, node_id, &role)?;
            let pid = child_pid(&child, node_id)?;
            if !self.track(cluster_id, node_id, child) {
                return Err(LaunchError::Rejected(format!(
                    "cluster {} was terminated during launch",
                    cluster_id.short()
                )));
            }
            processes.nodes.push(NodeProcess {
                node_id,
                role,
                ident: NodeIdent::Pid(pid),
                restarts: 0,
            });
        }

        info!(
            cluster_id = %cluster_id.short(),
            variant = %config.variant(),
            nodes = processes.len(),
            endpoint = %processes.endpoint,
            workdir = %workdir_path.display(),
            "Launched local cluster"
        );

        Ok(processes)
    }

    async fn terminate(&self, processes: &ProcessSet) {
        let Some(cluster) = self.clusters.lock().remove(&processes.cluster_id) else {
            debug!(cluster_id = %processes.cluster_id.short(), "Cluster already terminated");
            return;
        };

        let grace = self.config.grace_period();
        let nodes = cluster.children.len();
        join_all(cluster.children.into_values().map(|child| stop_child(child, grace))).await;

        if let Err(e) = cluster.workdir.close() {
            warn!(
                cluster_id = %processes.cluster_id.short(),
                error = %e,
                "Failed to remove cluster working directory"
            );
        }

        info!(
            cluster_id = %processes.cluster_id.short(),
            nodes,
            "Terminated local cluster"
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

        let (child, workdir_path) = {
            let mut clusters = self.clusters.lock();
            let Some(cluster) = clusters.get_mut(&cluster_id) else {
                return Err(RestartError::UnknownCluster(cluster_id));
            };
            (cluster.children.remove(&node), cluster.workdir.path().to_path_buf())
        };

        if let Some(child) = child {
            stop_child(child, self.config.grace_period()).await;
        }
        tokio::time::sleep(processes.config.restart_policy().interval()).await;

        if node.is_master() {
            write_master_config(&workdir_path.join(MASTER_CONFIG_FILE), &processes.config)
                .map_err(|source| RestartError::Relaunch { node, source })?;
        }

        let child = self
            .spawn_node(cluster_id, &processes.config, &workdir_path, node, &current.role)
            .map_err(|source| RestartError::Relaunch { node, source })?;
        let pid =
            child_pid(&child, node).map_err(|source| RestartError::Relaunch { node, source })?;
        if !self.track(cluster_id, node, child) {
            return Err(RestartError::UnknownCluster(cluster_id));
        }

        info!(
            cluster_id = %cluster_id.short(),
            node = %node,
            pid,
            restarts = current.restarts + 1,
            "Restarted node"
        );

        Ok(processes.with_node(NodeProcess {
            ident: NodeIdent::Pid(pid),
            restarts: current.restarts + 1,
            ..current
        }))
    }
}

#[async_trait]
impl HealthProbe for LocalProcessBackend {
    async fn probe(&self, processes: &ProcessSet) -> ProbeOutcome {
        let exited = {
            let mut clusters = self.clusters.lock();
            let Some(cluster) = clusters.get_mut(&processes.cluster_id) else {
                return ProbeOutcome::Exited(format!(
                    "cluster {} is not running",
                    processes.cluster_id.short()
                ));
            };
            cluster
                .children
                .iter_mut()
                .find_map(|(node_id, child)| match child.try_wait() {
                    Ok(Some(status)) => Some(format!("node {node_id} exited with {status}")),
                    Ok(None) | Err(_) => None,
                })
        };

        if let Some(reason) = exited {
            return ProbeOutcome::Exited(reason);
        }

        self.http.probe(processes).await
    }
}
