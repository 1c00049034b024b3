//! Fixture factories for tests.
//!
//! Each factory acquires a cluster for one variant and scope and returns a [`ClusterLease`].
//! The lease gives the cluster back when it goes out of scope, so a test that panics or
//! returns early still releases what it acquired. The release has finished by the time the
//! lease is gone, even when the test's runtime shuts down right after.
//!
//! ```ignore
//! #[tokio::test]
//! async fn schedules_on_both_pools() {
//!     let session = shared_session();
//!     let lease = managed_cluster_multi_resource_pools(&session, "schedules_on_both_pools")
//!         .await
//!         .unwrap();
//!     submit_job(&lease.endpoint()).await;
//!     lease.release().await.unwrap();
//! }
//! ```

use std::sync::Arc;

use mcluster_config::ResourcePool;
use mcluster_core::{NodeId, ScopeKey, Variant};
use tracing::warn;

use crate::cleanup;
use crate::error::{AcquireError, Result};
use crate::handle::ClusterHandle;
use crate::manager::ClusterLifecycleManager;
use crate::session::ClusterSession;

/// One acquisition of a managed cluster, released when dropped.
///
/// Prefer [`release`](Self::release) at the end of a test: it reports errors to the caller.
/// Dropping the lease releases it too and blocks until teardown is done; errors are logged.
pub struct ClusterLease {
    manager: Arc<ClusterLifecycleManager>,
    handle: Arc<ClusterHandle>,
    released: bool,
}

impl ClusterLease {
    /// Acquire `key` through `manager`.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error unchanged.
    pub async fn acquire(
        manager: &Arc<ClusterLifecycleManager>,
        key: ScopeKey,
    ) -> std::result::Result<Self, AcquireError> {
        let handle = manager.acquire(&key).await?;
        Ok(Self {
            manager: Arc::clone(manager),
            handle,
            released: false,
        })
    }

    /// The leased cluster.
    #[must_use]
    pub const fn handle(&self) -> &Arc<ClusterHandle> {
        &self.handle
    }

    /// The key the cluster is registered under.
    #[must_use]
    pub fn key(&self) -> &ScopeKey {
        self.handle.key()
    }

    /// The master's API endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.handle.endpoint()
    }

    /// Restart one node and wait for the cluster to recover.
    ///
    /// # Errors
    ///
    /// See [`ClusterLifecycleManager::inject_restart`].
    pub async fn inject_restart(&self, node: NodeId) -> Result<()> {
        self.manager.inject_restart(self.key(), node).await?;
        Ok(())
    }

    /// Add a resource pool and wait for the relaunched cluster.
    ///
    /// # Errors
    ///
    /// See [`ClusterLifecycleManager::add_resource_pool`].
    pub async fn add_resource_pool(&self, pool: ResourcePool) -> Result<()> {
        self.manager.add_resource_pool(self.key(), pool).await?;
        Ok(())
    }

    /// Give the cluster back and return the remaining acquisition count.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotAcquired` if the cluster was already shut down.
    pub async fn release(mut self) -> Result<usize> {
        self.released = true;
        self.manager.release(self.handle.key()).await
    }
}

impl Drop for ClusterLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let manager = Arc::clone(&self.manager);
        let key = self.handle.key().clone();
        cleanup::run_to_completion("lease release", async move {
            if let Err(e) = manager.release(&key).await {
                warn!(scope_key = %key, error = %e, "Release on drop failed");
            }
        });
    }
}

impl std::fmt::Debug for ClusterLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLease")
            .field("key", self.handle.key())
            .field("cluster_id", &self.handle.cluster_id())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

async fn test_lease(
    session: &ClusterSession,
    test_name: &str,
    variant: Variant,
) -> std::result::Result<ClusterLease, AcquireError> {
    ClusterLease::acquire(session.manager(), ScopeKey::test(test_name, variant)).await
}

async fn session_lease(
    session: &ClusterSession,
    variant: Variant,
) -> std::result::Result<ClusterLease, AcquireError> {
    ClusterLease::acquire(session.manager(), ScopeKey::session(variant)).await
}

/// A default cluster owned by one test.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn managed_cluster(
    session: &ClusterSession,
    test_name: &str,
) -> std::result::Result<ClusterLease, AcquireError> {
    test_lease(session, test_name, Variant::Default).await
}

/// The session's shared default cluster.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn managed_cluster_session(
    session: &ClusterSession,
) -> std::result::Result<ClusterLease, AcquireError> {
    session_lease(session, Variant::Default).await
}

/// A cluster with two resource pools owned by one test.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn managed_cluster_multi_resource_pools(
    session: &ClusterSession,
    test_name: &str,
) -> std::result::Result<ClusterLease, AcquireError> {
    test_lease(session, test_name, Variant::MultiResourcePools).await
}

/// The session's shared cluster with two resource pools.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn managed_cluster_session_multi_resource_pools(
    session: &ClusterSession,
) -> std::result::Result<ClusterLease, AcquireError> {
    session_lease(session, Variant::MultiResourcePools).await
}

/// A priority-scheduler cluster owned by one test.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn managed_cluster_priority_scheduler(
    session: &ClusterSession,
    test_name: &str,
) -> std::result::Result<ClusterLease, AcquireError> {
    test_lease(session, test_name, Variant::PriorityScheduler).await
}

/// The session's shared priority-scheduler cluster.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn managed_cluster_session_priority_scheduler(
    session: &ClusterSession,
) -> std::result::Result<ClusterLease, AcquireError> {
    session_lease(session, Variant::PriorityScheduler).await
}

/// A cluster that accepts restart injection, owned by one test.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn restartable_managed_cluster(
    session: &ClusterSession,
    test_name: &str,
) -> std::result::Result<ClusterLease, AcquireError> {
    test_lease(session, test_name, Variant::Restartable).await
}

/// The session's shared cluster that accepts restart injection.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn restartable_managed_cluster_session(
    session: &ClusterSession,
) -> std::result::Result<ClusterLease, AcquireError> {
    session_lease(session, Variant::Restartable).await
}

/// The session's shared restartable cluster, for tests that restart nodes in place.
///
/// Shares its cluster with [`restartable_managed_cluster_session`].
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn managed_cluster_restarts(
    session: &ClusterSession,
) -> std::result::Result<ClusterLease, AcquireError> {
    session_lease(session, Variant::Restartable).await
}

/// A cluster with two resource pools that accepts restart injection, owned by one test.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn restartable_managed_cluster_multi_resource_pools(
    session: &ClusterSession,
    test_name: &str,
) -> std::result::Result<ClusterLease, AcquireError> {
    test_lease(session, test_name, Variant::RestartableMultiResourcePools).await
}

/// The session's shared cluster with two resource pools that accepts restart injection.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired.
pub async fn restartable_managed_cluster_session_multi_resource_pools(
    session: &ClusterSession,
) -> std::result::Result<ClusterLease, AcquireError> {
    session_lease(session, Variant::RestartableMultiResourcePools).await
}

/// A Kubernetes-backed cluster owned by one test.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired, including when no Kubernetes
/// backend is configured.
pub async fn k8s_managed_cluster(
    session: &ClusterSession,
    test_name: &str,
) -> std::result::Result<ClusterLease, AcquireError> {
    test_lease(session, test_name, Variant::K8s).await
}

/// The session's shared Kubernetes-backed cluster.
///
/// # Errors
///
/// Returns an error if the cluster cannot be acquired, including when no Kubernetes
/// backend is configured.
pub async fn k8s_managed_cluster_session(
    session: &ClusterSession,
) -> std::result::Result<ClusterLease, AcquireError> {
    session_lease(session, Variant::K8s).await
}
