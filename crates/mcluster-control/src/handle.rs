//! The handle callers hold while they use a cluster.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use mcluster_config::ClusterConfig;
use mcluster_core::{ClusterId, ScopeKey};
use mcluster_runner::{BackendBinding, NodeProcess, ProcessSet};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::Result;
use crate::lifecycle::{validate_transition, HealthState};

/// A live cluster as seen by the tests sharing it.
///
/// Handles are created by [`ClusterLifecycleManager`](crate::ClusterLifecycleManager) and
/// shared through `Arc`. The endpoint and node identities can change when a node restarts,
/// so read them through the accessors instead of caching them.
#[derive(Debug)]
pub struct ClusterHandle {
    cluster_id: ClusterId,
    key: ScopeKey,
    created_at: DateTime<Utc>,
    binding: BackendBinding,
    processes: RwLock<ProcessSet>,
    health: RwLock<HealthState>,
    refcount: AtomicUsize,
    restarts: AtomicU32,
}

/// A serializable point-in-time view of a [`ClusterHandle`].
#[derive(Debug, Clone, Serialize)]
pub struct HandleSnapshot {
    /// Cluster identity.
    pub cluster_id: ClusterId,
    /// Key the cluster is registered under.
    pub key: ScopeKey,
    /// Master API endpoint.
    pub endpoint: String,
    /// Current health.
    pub health: HealthState,
    /// Outstanding acquisitions.
    pub refcount: usize,
    /// Node restarts performed so far.
    pub restarts: u32,
    /// When the cluster was first launched.
    pub created_at: DateTime<Utc>,
    /// The cluster's nodes.
    pub nodes: Vec<NodeProcess>,
}

impl ClusterHandle {
    pub(crate) fn new(key: ScopeKey, processes: ProcessSet, binding: BackendBinding) -> Self {
        Self {
            cluster_id: processes.cluster_id,
            key,
            created_at: Utc::now(),
            binding,
            processes: RwLock::new(processes),
            health: RwLock::new(HealthState::Starting),
            refcount: AtomicUsize::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    /// The cluster's identity; stable across restarts and relaunches.
    #[must_use]
    pub const fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// The key this cluster is registered under.
    #[must_use]
    pub const fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// When the cluster was first launched.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The master's API endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.processes.read().endpoint.clone()
    }

    /// A copy of the cluster's current process set.
    #[must_use]
    pub fn processes(&self) -> ProcessSet {
        self.processes.read().clone()
    }

    /// The configuration the cluster is running.
    #[must_use]
    pub fn config(&self) -> ClusterConfig {
        self.processes.read().config.clone()
    }

    /// Current health.
    #[must_use]
    pub fn health(&self) -> HealthState {
        *self.health.read()
    }

    /// Number of outstanding acquisitions.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Number of node restarts performed on this cluster.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// Capture the handle's current state.
    #[must_use]
    pub fn snapshot(&self) -> HandleSnapshot {
        let processes = self.processes();
        HandleSnapshot {
            cluster_id: self.cluster_id,
            key: self.key.clone(),
            endpoint: processes.endpoint,
            health: self.health(),
            refcount: self.refcount(),
            restarts: self.restart_count(),
            created_at: self.created_at,
            nodes: processes.nodes,
        }
    }

    pub(crate) const fn binding(&self) -> &BackendBinding {
        &self.binding
    }

    /// Move to `to`, rejecting transitions the state machine does not allow.
    pub(crate) fn transition(&self, to: HealthState) -> Result<HealthState> {
        let mut health = self.health.write();
        let from = *health;
        *health = validate_transition(&self.cluster_id, from, to)?;
        Ok(from)
    }

    pub(crate) fn replace_processes(&self, processes: ProcessSet) {
        *self.processes.write() = processes;
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::AcqRel);
    }

    /// Add one acquisition and return the new count.
    pub(crate) fn retain(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one acquisition and return the new count, or `None` if none were outstanding.
    pub(crate) fn release(&self) -> Option<usize> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }

    /// Drop every acquisition and return how many there were.
    pub(crate) fn release_all(&self) -> usize {
        self.refcount.swap(0, Ordering::AcqRel)
    }
}
