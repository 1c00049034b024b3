//! The cluster lifecycle manager.
//!
//! The manager is the only component that launches, shares and tears down clusters. All
//! operations on one [`ScopeKey`] are serialized by a per-key async gate; different keys
//! proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use mcluster_config::{ClusterConfigBuilder, ResourcePool};
use mcluster_core::{ClusterId, NodeId, ScopeKey};
use mcluster_runner::{Backends, ClusterBackend, LaunchError, ProcessSet, RestartError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cleanup;
use crate::error::{AcquireError, ControlError, Result};
use crate::handle::ClusterHandle;
use crate::lifecycle::{can_be_shared, is_active, HealthState};
use crate::readiness::ReadinessWaiter;
use crate::registry::ScopeRegistry;
use crate::session::{SessionLock, SessionLockGuard};
use crate::types::ManagerConfig;

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Launches, shares and tears down clusters on behalf of tests.
pub struct ClusterLifecycleManager {
    backends: Backends,
    builder: ClusterConfigBuilder,
    config: ManagerConfig,
    waiter: ReadinessWaiter,
    registry: ScopeRegistry,
    gates: Mutex<HashMap<ScopeKey, Gate>>,
    session_lock: Option<SessionLock>,
}

impl ClusterLifecycleManager {
    /// Create a manager.
    #[must_use]
    pub fn new(backends: Backends, builder: ClusterConfigBuilder, config: ManagerConfig) -> Self {
        Self {
            backends,
            builder,
            waiter: ReadinessWaiter::new(config.poll_interval()),
            config,
            registry: ScopeRegistry::new(),
            gates: Mutex::new(HashMap::new()),
            session_lock: None,
        }
    }

    /// Hold `lock` around every launch and teardown.
    #[must_use]
    pub fn with_session_lock(mut self, lock: SessionLock) -> Self {
        self.session_lock = Some(lock);
        self
    }

    /// The manager's configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The registry of live clusters.
    #[must_use]
    pub const fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    /// The cluster registered for `key`, if any.
    #[must_use]
    pub fn handle(&self, key: &ScopeKey) -> Option<Arc<ClusterHandle>> {
        self.registry.get(key)
    }

    /// Every key with a registered cluster.
    #[must_use]
    pub fn active_keys(&self) -> Vec<ScopeKey> {
        self.registry.keys()
    }

    /// Get a ready cluster for `key`, launching one if needed.
    ///
    /// A ready cluster already registered for the key is shared and its reference count
    /// incremented. Otherwise a new cluster is built, launched, and waited on. Dropping the
    /// returned future mid-launch tears down whatever was started.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the backend cannot launch, the
    /// cluster never becomes ready, or the registered cluster has failed while still in use.
    pub async fn acquire(
        &self,
        key: &ScopeKey,
    ) -> std::result::Result<Arc<ClusterHandle>, AcquireError> {
        let gate = self.gate(key);
        let _gate = gate.lock().await;

        if let Some(handle) = self.registry.get(key) {
            let health = handle.health();
            if can_be_shared(health) {
                let refcount = handle.retain();
                info!(
                    scope_key = %key,
                    cluster_id = %handle.cluster_id().short(),
                    refcount,
                    "Sharing existing cluster"
                );
                return Ok(handle);
            }

            if handle.refcount() > 0 {
                warn!(
                    scope_key = %key,
                    cluster_id = %handle.cluster_id().short(),
                    health = %health,
                    "Registered cluster is unhealthy and still in use"
                );
                return Err(AcquireError::Unhealthy {
                    key: key.clone(),
                    health,
                });
            }

            // Left behind by a failed recovery or an abandoned launch.
            debug!(scope_key = %key, health = %health, "Replacing unreferenced cluster");
            self.teardown(key, &handle).await;
        }

        self.launch(key).await
    }

    /// Give back one acquisition of `key` and return the remaining count.
    ///
    /// When the count reaches zero the cluster is torn down and unregistered. Session
    /// clusters are kept running instead when [`ManagerConfig::keep_session_clusters`] is
    /// set and they are still ready.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotAcquired` if nothing is registered for the key or it has
    /// no outstanding acquisitions. Nothing is terminated in that case.
    pub async fn release(&self, key: &ScopeKey) -> Result<usize> {
        let gate = self.gate(key);
        let _gate = gate.lock().await;

        let Some(handle) = self.registry.get(key) else {
            warn!(scope_key = %key, "Release for a key with no registered cluster");
            return Err(ControlError::NotAcquired(key.clone()));
        };
        let Some(remaining) = handle.release() else {
            warn!(
                scope_key = %key,
                cluster_id = %handle.cluster_id().short(),
                "Release without an outstanding acquisition"
            );
            return Err(ControlError::NotAcquired(key.clone()));
        };

        if remaining > 0 {
            debug!(
                scope_key = %key,
                cluster_id = %handle.cluster_id().short(),
                refcount = remaining,
                "Cluster released"
            );
            return Ok(remaining);
        }

        if key.is_session() && self.config.keep_session_clusters && can_be_shared(handle.health())
        {
            debug!(
                scope_key = %key,
                cluster_id = %handle.cluster_id().short(),
                "Keeping idle session cluster"
            );
            return Ok(0);
        }

        self.teardown(key, &handle).await;
        Ok(0)
    }

    /// Restart one node of the cluster registered for `key` and wait for it to recover.
    ///
    /// The cluster is `degraded` while the node restarts and `ready` again once the probe
    /// passes. Its identity is preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if no cluster is registered, the variant does not allow restarts,
    /// the node is unknown, the restart fails, or the cluster does not recover in time. The
    /// last two leave the cluster `failed`.
    pub async fn inject_restart(
        &self,
        key: &ScopeKey,
        node: NodeId,
    ) -> Result<Arc<ClusterHandle>> {
        let gate = self.gate(key);
        let _gate = gate.lock().await;

        let handle = self.registered(key)?;
        let processes = handle.processes();

        if !processes.config.restart_policy().enabled {
            return Err(ControlError::Restart {
                key: key.clone(),
                source: RestartError::NotRestartable(key.variant),
            });
        }
        if processes.node(node).is_none() {
            return Err(ControlError::Restart {
                key: key.clone(),
                source: RestartError::UnknownNode {
                    cluster_id: handle.cluster_id(),
                    node,
                },
            });
        }

        handle.transition(HealthState::Degraded)?;
        info!(
            scope_key = %key,
            cluster_id = %handle.cluster_id().short(),
            node = %node,
            "Restarting node"
        );

        let runner = Arc::clone(&handle.binding().runner);
        match runner.restart_node(&processes, node).await {
            Ok(restarted) => {
                handle.replace_processes(restarted);
                handle.record_restart();
            }
            Err(source) => {
                error!(
                    scope_key = %key,
                    cluster_id = %handle.cluster_id().short(),
                    node = %node,
                    error = %source,
                    "Node restart failed"
                );
                handle.transition(HealthState::Failed)?;
                return Err(ControlError::Restart {
                    key: key.clone(),
                    source,
                });
            }
        }

        self.recover(key, &handle).await?;
        Ok(handle)
    }

    /// Add a resource pool to the cluster registered for `key`.
    ///
    /// The cluster is relaunched with the extended configuration under the same
    /// `ClusterId`, then waited on. It is `degraded` in between.
    ///
    /// # Errors
    ///
    /// Returns an error if no cluster is registered, the extended configuration is invalid,
    /// the relaunch fails, or the cluster does not recover. The last two leave the cluster
    /// `failed`.
    pub async fn add_resource_pool(
        &self,
        key: &ScopeKey,
        pool: ResourcePool,
    ) -> Result<Arc<ClusterHandle>> {
        let gate = self.gate(key);
        let _gate = gate.lock().await;

        let handle = self.registered(key)?;
        let current = handle.processes();
        let pool_name = pool.name.clone();
        let config = current.config.with_resource_pool(pool)?;

        let session_lock = self.lock_session().await?;
        handle.transition(HealthState::Degraded)?;
        info!(
            scope_key = %key,
            cluster_id = %handle.cluster_id().short(),
            pool = %pool_name,
            pools = config.resource_pools().len(),
            "Relaunching cluster with additional resource pool"
        );

        let runner = Arc::clone(&handle.binding().runner);
        runner.terminate(&current).await;

        let launch_timeout = self.config.launch_timeout();
        let relaunched =
            match tokio::time::timeout(launch_timeout, runner.launch(handle.cluster_id(), &config))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LaunchError::Timeout(format!(
                    "relaunch did not finish within {launch_timeout:?}"
                ))),
            };

        match relaunched {
            Ok(processes) => handle.replace_processes(processes),
            Err(source) => {
                error!(
                    scope_key = %key,
                    cluster_id = %handle.cluster_id().short(),
                    error = %source,
                    "Relaunch failed"
                );
                runner.terminate(&current).await;
                handle.transition(HealthState::Failed)?;
                return Err(ControlError::Launch {
                    key: key.clone(),
                    source,
                });
            }
        }
        drop(session_lock);

        self.recover(key, &handle).await?;
        Ok(handle)
    }

    /// Tear down the cluster registered for `key` regardless of outstanding acquisitions.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotFound` if nothing is registered for the key.
    pub async fn shutdown(&self, key: &ScopeKey) -> Result<()> {
        let gate = self.gate(key);
        let _gate = gate.lock().await;

        let handle = self.registered(key)?;
        let outstanding = handle.release_all();
        if outstanding > 0 {
            warn!(
                scope_key = %key,
                cluster_id = %handle.cluster_id().short(),
                refcount = outstanding,
                "Shutting down cluster that is still in use"
            );
        }

        self.teardown(key, &handle).await;
        Ok(())
    }

    /// Tear down every registered cluster and return how many were stopped.
    pub async fn shutdown_all(&self) -> usize {
        let mut stopped = 0;
        for key in self.registry.keys() {
            match self.shutdown(&key).await {
                Ok(()) => stopped += 1,
                Err(e) => debug!(scope_key = %key, error = %e, "Cluster already gone"),
            }
        }
        stopped
    }

    fn gate(&self, key: &ScopeKey) -> Gate {
        Arc::clone(self.gates.lock().entry(key.clone()).or_default())
    }

    fn registered(&self, key: &ScopeKey) -> Result<Arc<ClusterHandle>> {
        self.registry
            .get(key)
            .ok_or_else(|| ControlError::NotFound(key.clone()))
    }

    async fn lock_session(&self) -> Result<Option<SessionLockGuard>> {
        match &self.session_lock {
            Some(lock) => lock.acquire().await.map(Some),
            None => Ok(None),
        }
    }

    async fn launch(
        &self,
        key: &ScopeKey,
    ) -> std::result::Result<Arc<ClusterHandle>, AcquireError> {
        let config = self.builder.build(key.variant).map_err(|source| {
            error!(scope_key = %key, error = %source, "Invalid cluster configuration");
            AcquireError::Config {
                key: key.clone(),
                source,
            }
        })?;
        let binding = self
            .backends
            .get(config.backend())
            .map_err(|source| {
                error!(scope_key = %key, error = %source, "No backend for cluster");
                AcquireError::Launch {
                    key: key.clone(),
                    source,
                }
            })?
            .clone();

        let cluster_id = ClusterId::generate(key);
        info!(
            scope_key = %key,
            cluster_id = %cluster_id.short(),
            backend = %config.backend(),
            agents = config.agent_count(),
            "Launching cluster"
        );

        let session_lock = self.lock_session().await?;
        let mut guard = LaunchGuard::new(
            Arc::clone(&binding.runner),
            ProcessSet::new(cluster_id, config.clone(), String::new()),
        );

        let launch_timeout = self.config.launch_timeout();
        let processes =
            match tokio::time::timeout(launch_timeout, binding.runner.launch(cluster_id, &config))
                .await
            {
                Ok(Ok(processes)) => processes,
                Ok(Err(source)) => {
                    error!(
                        scope_key = %key,
                        cluster_id = %cluster_id.short(),
                        error = %source,
                        "Cluster launch failed"
                    );
                    guard.teardown(HealthState::Failed).await;
                    return Err(AcquireError::Launch {
                        key: key.clone(),
                        source,
                    });
                }
                Err(_) => {
                    error!(
                        scope_key = %key,
                        cluster_id = %cluster_id.short(),
                        timeout_secs = launch_timeout.as_secs(),
                        "Cluster launch timed out"
                    );
                    guard.teardown(HealthState::Failed).await;
                    return Err(AcquireError::LaunchTimeout {
                        key: key.clone(),
                        timeout: launch_timeout,
                    });
                }
            };
        drop(session_lock);
        guard.track(processes.clone());

        let handle = Arc::new(ClusterHandle::new(key.clone(), processes, binding));
        guard.register(&self.registry, key.clone(), Arc::clone(&handle));

        let probe = Arc::clone(&handle.binding().probe);
        let ready = self
            .waiter
            .require_ready(probe.as_ref(), &handle.processes(), self.config.ready_timeout())
            .await;

        if let Err(source) = ready {
            error!(
                scope_key = %key,
                cluster_id = %cluster_id.short(),
                error = %source,
                "Cluster did not become ready"
            );
            guard.teardown(HealthState::Failed).await;
            return Err(AcquireError::ReadinessTimeout {
                key: key.clone(),
                source,
            });
        }

        handle.transition(HealthState::Ready)?;
        let refcount = handle.retain();
        guard.disarm();

        info!(
            scope_key = %key,
            cluster_id = %cluster_id.short(),
            endpoint = %handle.endpoint(),
            refcount,
            "Cluster ready"
        );
        Ok(handle)
    }

    async fn recover(&self, key: &ScopeKey, handle: &ClusterHandle) -> Result<()> {
        let probe = Arc::clone(&handle.binding().probe);
        let ready = self
            .waiter
            .require_ready(probe.as_ref(), &handle.processes(), self.config.ready_timeout())
            .await;

        match ready {
            Ok(()) => {
                handle.transition(HealthState::Ready)?;
                info!(
                    scope_key = %key,
                    cluster_id = %handle.cluster_id().short(),
                    restarts = handle.restart_count(),
                    "Cluster recovered"
                );
                Ok(())
            }
            Err(source) => {
                error!(
                    scope_key = %key,
                    cluster_id = %handle.cluster_id().short(),
                    error = %source,
                    "Cluster did not recover"
                );
                handle.transition(HealthState::Failed)?;
                Err(ControlError::ReadinessTimeout {
                    key: key.clone(),
                    source,
                })
            }
        }
    }

    async fn teardown(&self, key: &ScopeKey, handle: &ClusterHandle) {
        let _lock = match self.lock_session().await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(scope_key = %key, error = %e, "Tearing down without the session lock");
                None
            }
        };

        handle.binding().runner.terminate(&handle.processes()).await;
        self.retire(key, handle, HealthState::Stopped);

        info!(
            scope_key = %key,
            cluster_id = %handle.cluster_id().short(),
            health = %handle.health(),
            restarts = handle.restart_count(),
            "Cluster torn down"
        );
    }

    /// Move a cluster to a terminal state and drop it from the registry.
    fn retire(&self, key: &ScopeKey, handle: &ClusterHandle, to: HealthState) {
        if is_active(handle.health()) {
            if let Err(e) = handle.transition(to) {
                warn!(scope_key = %key, error = %e, "Could not record final health");
            }
        }
        if let Err(e) = self.registry.remove(key) {
            warn!(scope_key = %key, error = %e, "Could not unregister cluster");
        }
    }
}

impl std::fmt::Debug for ClusterLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLifecycleManager")
            .field("config", &self.config)
            .field("clusters", &self.registry.len())
            .field("session_lock", &self.session_lock)
            .finish_non_exhaustive()
    }
}

/// Undoes a launch that did not complete.
///
/// While armed it owns the started nodes and, once registered, the registry entry. If the
/// acquiring future is dropped, the nodes are terminated before `drop` returns and the
/// entry is retired as `stopped`.
struct LaunchGuard<'a> {
    runner: Arc<dyn ClusterBackend>,
    pending: Option<ProcessSet>,
    registration: Option<(&'a ScopeRegistry, ScopeKey, Arc<ClusterHandle>)>,
}

impl<'a> LaunchGuard<'a> {
    fn new(runner: Arc<dyn ClusterBackend>, processes: ProcessSet) -> Self {
        Self {
            runner,
            pending: Some(processes),
            registration: None,
        }
    }

    fn track(&mut self, processes: ProcessSet) {
        self.pending = Some(processes);
    }

    /// Register `handle` under `key`; the entry is retired if the launch is abandoned.
    fn register(
        &mut self,
        registry: &'a ScopeRegistry,
        key: ScopeKey,
        handle: Arc<ClusterHandle>,
    ) {
        registry.put(key.clone(), Arc::clone(&handle));
        self.registration = Some((registry, key, handle));
    }

    /// Terminate the nodes and retire the registry entry as `to`.
    async fn teardown(mut self, to: HealthState) {
        if let Some(processes) = self.pending.take() {
            self.runner.terminate(&processes).await;
        }
        self.unregister(to);
    }

    fn disarm(mut self) {
        self.pending = None;
        self.registration = None;
    }

    fn unregister(&mut self, to: HealthState) {
        let Some((registry, key, handle)) = self.registration.take() else {
            return;
        };

        if is_active(handle.health()) {
            if let Err(e) = handle.transition(to) {
                warn!(scope_key = %key, error = %e, "Could not record final health");
            }
        }
        let still_ours = registry
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(&current, &handle));
        if still_ours {
            if let Err(e) = registry.remove(&key) {
                warn!(scope_key = %key, error = %e, "Could not unregister cluster");
            }
        }
    }
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        if let Some(processes) = self.pending.take() {
            warn!(
                cluster_id = %processes.cluster_id.short(),
                "Acquire abandoned during launch, tearing down"
            );
            let runner = Arc::clone(&self.runner);
            cleanup::run_to_completion("abandoned launch", async move {
                runner.terminate(&processes).await;
            });
        }
        self.unregister(HealthState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mcluster_config::ClusterDefaults;
    use mcluster_core::Variant;
    use mcluster_runner::{BackendBinding, MockBackend, ProbeOutcome};

    fn manager_with(backend: &Arc<MockBackend>) -> ClusterLifecycleManager {
        let config = ManagerConfig {
            ready_timeout_secs: 2,
            poll_interval_ms: 50,
            ..ManagerConfig::default()
        };
        ClusterLifecycleManager::new(
            Backends::uniform(BackendBinding::shared(Arc::clone(backend))),
            ClusterConfigBuilder::default(),
            config,
        )
    }

    #[tokio::test]
    async fn acquire_launches_once_and_shares() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::session(Variant::Default);

        let first = manager.acquire(&key).await.unwrap();
        let second = manager.acquire(&key).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.refcount(), 2);
        assert_eq!(first.health(), HealthState::Ready);
        assert_eq!(backend.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_scope_release_tears_down() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::test("tears_down", Variant::MultiResourcePools);

        let handle = manager.acquire(&key).await.unwrap();
        assert_eq!(manager.release(&key).await.unwrap(), 0);

        assert_eq!(handle.health(), HealthState::Stopped);
        assert!(manager.handle(&key).is_none());
        assert_eq!(backend.live_nodes(), 0);
        assert_eq!(backend.terminated_nodes(), 3);
    }

    #[tokio::test]
    async fn session_cluster_kept_at_zero() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::session(Variant::Default);

        let handle = manager.acquire(&key).await.unwrap();
        assert_eq!(manager.release(&key).await.unwrap(), 0);
        assert_eq!(handle.health(), HealthState::Ready);
        assert_eq!(backend.terminate_count(), 0);

        // Reacquiring reuses the warm cluster.
        let again = manager.acquire(&key).await.unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
        assert_eq!(again.refcount(), 1);
        assert_eq!(backend.launch_count(), 1);
    }

    #[tokio::test]
    async fn session_cluster_released_when_not_kept() {
        let backend = Arc::new(MockBackend::new());
        let manager = ClusterLifecycleManager::new(
            Backends::uniform(BackendBinding::shared(Arc::clone(&backend))),
            ClusterConfigBuilder::default(),
            ManagerConfig {
                keep_session_clusters: false,
                ..ManagerConfig::default()
            },
        );
        let key = ScopeKey::session(Variant::PriorityScheduler);

        manager.acquire(&key).await.unwrap();
        manager.release(&key).await.unwrap();
        assert!(manager.registry().is_empty());
        assert_eq!(backend.terminate_count(), 1);
    }

    #[tokio::test]
    async fn config_error_surfaces_with_key() {
        let backend = Arc::new(MockBackend::new());
        let manager = ClusterLifecycleManager::new(
            Backends::uniform(BackendBinding::shared(Arc::clone(&backend))),
            ClusterConfigBuilder::new(ClusterDefaults {
                pool_capacity: 0,
                ..ClusterDefaults::default()
            }),
            ManagerConfig::default(),
        );
        let key = ScopeKey::test("zero_capacity", Variant::Default);

        let err = manager.acquire(&key).await.unwrap_err();
        assert!(matches!(err, AcquireError::Config { .. }));
        assert_eq!(err.key(), Some(&key));
        assert_eq!(backend.launch_count(), 0);
    }

    #[tokio::test]
    async fn missing_backend_is_launch_error() {
        let manager = ClusterLifecycleManager::new(
            Backends::new(),
            ClusterConfigBuilder::default(),
            ManagerConfig::default(),
        );

        let err = manager
            .acquire(&ScopeKey::session(Variant::K8s))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AcquireError::Launch {
                source: LaunchError::BackendUnavailable(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn readiness_failure_tears_down() {
        let backend = Arc::new(MockBackend::new().never_ready());
        let manager = ClusterLifecycleManager::new(
            Backends::uniform(BackendBinding::shared(Arc::clone(&backend))),
            ClusterConfigBuilder::default(),
            ManagerConfig {
                ready_timeout_secs: 0,
                poll_interval_ms: 20,
                ..ManagerConfig::default()
            },
        );
        let key = ScopeKey::test("never_ready", Variant::Default);

        let err = manager.acquire(&key).await.unwrap_err();
        assert!(matches!(err, AcquireError::ReadinessTimeout { .. }));
        assert!(err.is_retriable());
        assert!(manager.handle(&key).is_none());
        assert_eq!(backend.live_nodes(), 0);
        assert_eq!(backend.terminated_nodes(), backend.started_nodes());
    }

    #[tokio::test(start_paused = true)]
    async fn launch_timeout_tears_down() {
        let backend = Arc::new(MockBackend::new().with_launch_delay(Duration::from_secs(600)));
        let manager = manager_with(&backend);
        let key = ScopeKey::test("slow_launch", Variant::Default);

        let err = manager.acquire(&key).await.unwrap_err();
        assert!(matches!(err, AcquireError::LaunchTimeout { .. }));
        assert_eq!(backend.live_nodes(), 0);
        assert_eq!(backend.terminated_nodes(), 2);
    }

    #[tokio::test]
    async fn release_without_acquire_is_reported() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::test("never_acquired", Variant::Default);

        let err = manager.release(&key).await.unwrap_err();
        assert!(matches!(err, ControlError::NotAcquired(_)));
    }

    #[tokio::test]
    async fn inject_restart_requires_restartable_variant() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::test("not_restartable", Variant::Default);
        let handle = manager.acquire(&key).await.unwrap();

        let err = manager
            .inject_restart(&key, NodeId::agent(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Restart {
                source: RestartError::NotRestartable(Variant::Default),
                ..
            }
        ));
        assert_eq!(handle.health(), HealthState::Ready);
        assert_eq!(backend.restart_count(), 0);
    }

    #[tokio::test]
    async fn inject_restart_unknown_node_leaves_cluster_ready() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::test("unknown_node", Variant::Restartable);
        let handle = manager.acquire(&key).await.unwrap();

        let err = manager
            .inject_restart(&key, NodeId::new(7))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Restart {
                source: RestartError::UnknownNode { .. },
                ..
            }
        ));
        assert!(!err.leaves_cluster_failed());
        assert_eq!(handle.health(), HealthState::Ready);
    }

    #[tokio::test]
    async fn failed_recovery_blocks_sharing() {
        let backend = Arc::new(MockBackend::new());
        let manager = ClusterLifecycleManager::new(
            Backends::uniform(BackendBinding::shared(Arc::clone(&backend))),
            ClusterConfigBuilder::default(),
            ManagerConfig {
                ready_timeout_secs: 0,
                poll_interval_ms: 20,
                ..ManagerConfig::default()
            },
        );
        let key = ScopeKey::test("fails_to_recover", Variant::Restartable);
        let handle = manager.acquire(&key).await.unwrap();

        backend.script_probes([ProbeOutcome::NotReady("agent rejoining".to_string())]);
        let err = manager
            .inject_restart(&key, NodeId::agent(0))
            .await
            .unwrap_err();
        assert!(err.leaves_cluster_failed());
        assert_eq!(handle.health(), HealthState::Failed);

        let err = manager.acquire(&key).await.unwrap_err();
        assert!(matches!(
            err,
            AcquireError::Unhealthy {
                health: HealthState::Failed,
                ..
            }
        ));

        // The last release still tears the failed cluster down.
        manager.release(&key).await.unwrap();
        assert!(manager.handle(&key).is_none());
        assert_eq!(backend.live_clusters(), 0);
    }

    #[tokio::test]
    async fn add_resource_pool_relaunches_under_same_id() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::test("grows", Variant::Default);
        let handle = manager.acquire(&key).await.unwrap();
        let cluster_id = handle.cluster_id();

        manager
            .add_resource_pool(&key, ResourcePool::new("gpu", 2))
            .await
            .unwrap();

        assert_eq!(handle.cluster_id(), cluster_id);
        assert_eq!(handle.health(), HealthState::Ready);
        assert_eq!(handle.config().resource_pools().len(), 2);
        assert_eq!(handle.processes().agents().count(), 2);
        assert_eq!(backend.launch_count(), 2);
        assert_eq!(backend.live_nodes(), 3);
    }

    #[tokio::test]
    async fn add_duplicate_pool_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::test("duplicate_pool", Variant::Default);
        let handle = manager.acquire(&key).await.unwrap();

        let err = manager
            .add_resource_pool(&key, ResourcePool::new("default", 4))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
        assert_eq!(handle.health(), HealthState::Ready);
        assert_eq!(backend.launch_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_ignores_refcount() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend);
        let key = ScopeKey::session(Variant::Restartable);

        let handle = manager.acquire(&key).await.unwrap();
        manager.acquire(&key).await.unwrap();

        manager.shutdown(&key).await.unwrap();
        assert_eq!(handle.refcount(), 0);
        assert_eq!(handle.health(), HealthState::Stopped);
        assert!(manager.active_keys().is_empty());

        assert!(matches!(
            manager.shutdown(&key).await.unwrap_err(),
            ControlError::NotFound(_)
        ));
        assert!(matches!(
            manager.release(&key).await.unwrap_err(),
            ControlError::NotAcquired(_)
        ));
    }

    #[tokio::test]
    async fn session_lock_taken_around_launch() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SessionLock::new(dir.path().join("session.lock"));
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(&backend).with_session_lock(lock.clone());
        let key = ScopeKey::test("locked", Variant::Default);

        manager.acquire(&key).await.unwrap();
        assert!(lock.path().exists());

        // Not held between operations.
        let guard = tokio::time::timeout(Duration::from_secs(5), lock.acquire())
            .await
            .unwrap()
            .unwrap();
        drop(guard);

        manager.release(&key).await.unwrap();
        assert_eq!(backend.live_clusters(), 0);
    }
}
