//! Lifecycle properties of the cluster manager, exercised against the mock backend.
//!
//! Run with:
//!   cargo test -p mcluster-control --test lifecycle_properties

use std::sync::Arc;
use std::time::Duration;

use mcluster_config::ClusterConfigBuilder;
use mcluster_control::fixtures::{managed_cluster, restartable_managed_cluster_session};
use mcluster_control::{
    AcquireError, ClusterLifecycleManager, ClusterSession, ControlError, HealthState,
    ManagerConfig, ReadinessWaiter, SessionSettings,
};
use mcluster_core::{ClusterId, NodeId, ScopeKey, Variant};
use mcluster_runner::{BackendBinding, Backends, ClusterBackend, MockBackend, ProbeOutcome};
use tokio::task::JoinSet;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn manager(backend: &Arc<MockBackend>) -> Arc<ClusterLifecycleManager> {
    let config = ManagerConfig {
        ready_timeout_secs: 5,
        poll_interval_ms: 100,
        ..ManagerConfig::default()
    };
    Arc::new(ClusterLifecycleManager::new(
        Backends::uniform(BackendBinding::shared(Arc::clone(backend))),
        ClusterConfigBuilder::default(),
        config,
    ))
}

// =============================================================================
// Acquire / release
// =============================================================================

#[tokio::test]
async fn acquire_then_release_leaves_no_entry_for_every_variant() {
    let backend = Arc::new(MockBackend::new());
    let manager = manager(&backend);

    for variant in Variant::ALL {
        let key = ScopeKey::test("acquire_then_release", variant);

        let handle = manager.acquire(&key).await.unwrap();
        assert_eq!(handle.health(), HealthState::Ready, "{variant}");
        assert_eq!(handle.refcount(), 1);

        assert_eq!(manager.release(&key).await.unwrap(), 0);
        assert!(manager.handle(&key).is_none(), "{variant}");
        assert_eq!(handle.health(), HealthState::Stopped);
    }

    assert!(manager.registry().is_empty());
    assert_eq!(backend.live_nodes(), 0);
    assert_eq!(backend.terminated_nodes(), backend.started_nodes());
}

#[tokio::test]
async fn release_at_zero_is_a_reported_noop() {
    let backend = Arc::new(MockBackend::new());
    let manager = manager(&backend);
    let key = ScopeKey::test("double_release", Variant::Default);

    manager.acquire(&key).await.unwrap();
    manager.release(&key).await.unwrap();

    let err = manager.release(&key).await.unwrap_err();
    assert!(matches!(err, ControlError::NotAcquired(ref k) if *k == key));
    assert_eq!(backend.terminate_count(), 1);

    // Same for a session cluster kept warm at zero.
    let session_key = ScopeKey::session(Variant::Default);
    let handle = manager.acquire(&session_key).await.unwrap();
    manager.release(&session_key).await.unwrap();

    let err = manager.release(&session_key).await.unwrap_err();
    assert!(matches!(err, ControlError::NotAcquired(_)));
    assert_eq!(handle.health(), HealthState::Ready);
    assert_eq!(backend.terminate_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_session_acquirers_share_one_launch() {
    const ACQUIRERS: usize = 16;

    let backend = Arc::new(MockBackend::new().with_launch_delay(Duration::from_millis(50)));
    let manager = manager(&backend);
    let key = ScopeKey::session(Variant::MultiResourcePools);

    let mut tasks = JoinSet::new();
    for _ in 0..ACQUIRERS {
        let manager = Arc::clone(&manager);
        let key = key.clone();
        tasks.spawn(async move { manager.acquire(&key).await });
    }

    let mut cluster_ids = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        cluster_ids.push(joined.unwrap().unwrap().cluster_id());
    }

    assert_eq!(backend.launch_count(), 1);
    assert!(cluster_ids.iter().all(|id| *id == cluster_ids[0]));
    assert_eq!(manager.handle(&key).unwrap().refcount(), ACQUIRERS);
}

#[tokio::test]
async fn distinct_test_keys_get_distinct_clusters() {
    let backend = Arc::new(MockBackend::new());
    let manager = manager(&backend);

    let a = manager
        .acquire(&ScopeKey::test("first_test", Variant::Default))
        .await
        .unwrap();
    let b = manager
        .acquire(&ScopeKey::test("second_test", Variant::Default))
        .await
        .unwrap();

    assert_ne!(a.cluster_id(), b.cluster_id());
    assert_eq!(backend.launch_count(), 2);
    assert_eq!(manager.active_keys().len(), 2);
}

#[tokio::test]
async fn session_default_acquired_twice() {
    let backend = Arc::new(MockBackend::new());
    let manager = manager(&backend);
    let key = ScopeKey::session(Variant::Default);

    let first = manager.acquire(&key).await.unwrap();
    let second = manager.acquire(&key).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.refcount(), 2);
    assert_eq!(backend.launch_count(), 1);
    assert_eq!(second.health(), HealthState::Ready);
}

// =============================================================================
// Readiness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn zero_timeout_on_never_ready_fails_within_one_interval() {
    let backend = MockBackend::new().never_ready();
    let config = ClusterConfigBuilder::default()
        .build(Variant::Default)
        .unwrap();
    let processes = backend
        .launch(ClusterId::from_bytes([3; 32]), &config)
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let state = ReadinessWaiter::new(POLL_INTERVAL)
        .wait_until_ready(&backend, &processes, Duration::ZERO)
        .await;

    assert_eq!(state, HealthState::Failed);
    assert!(started.elapsed() <= POLL_INTERVAL);
}

// =============================================================================
// Restarts
// =============================================================================

#[tokio::test]
async fn inject_restart_degrades_then_recovers() {
    let backend = Arc::new(MockBackend::new());
    let manager = manager(&backend);
    let key = ScopeKey::session(Variant::Restartable);

    let handle = manager.acquire(&key).await.unwrap();
    let cluster_id = handle.cluster_id();
    let old_pid = backend.pid_of(&cluster_id, NodeId::new(1)).unwrap();

    // Hold the cluster in `degraded` for one poll interval.
    backend.script_probes([ProbeOutcome::NotReady("agent rejoining".to_string())]);
    let restart = {
        let manager = Arc::clone(&manager);
        let key = key.clone();
        tokio::spawn(async move { manager.inject_restart(&key, NodeId::new(1)).await })
    };

    tokio::time::sleep(POLL_INTERVAL / 2).await;
    assert_eq!(handle.health(), HealthState::Degraded);

    let restarted = restart.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&restarted, &handle));
    assert_eq!(handle.health(), HealthState::Ready);
    assert_eq!(handle.cluster_id(), cluster_id);
    assert_eq!(handle.restart_count(), 1);
    assert_eq!(handle.processes().node(NodeId::new(1)).unwrap().restarts, 1);
    assert_ne!(backend.pid_of(&cluster_id, NodeId::new(1)).unwrap(), old_pid);
    assert_eq!(backend.launch_count(), 1);
}

#[tokio::test]
async fn restarting_the_master_keeps_identity() {
    let backend = Arc::new(MockBackend::new());
    let session = ClusterSession::start(
        SessionSettings::default(),
        Backends::uniform(BackendBinding::shared(Arc::clone(&backend))),
    );

    let lease = restartable_managed_cluster_session(&session).await.unwrap();
    let endpoint = lease.endpoint();

    lease.inject_restart(NodeId::MASTER).await.unwrap();

    assert_eq!(lease.handle().health(), HealthState::Ready);
    assert_eq!(lease.endpoint(), endpoint);
    assert_eq!(backend.restart_count(), 1);

    lease.release().await.unwrap();
    assert_eq!(session.finish().await, 1);
    assert_eq!(backend.live_clusters(), 0);
}

// =============================================================================
// Failure and cancellation
// =============================================================================

#[tokio::test]
async fn launch_failure_terminates_every_started_node() {
    let backend = Arc::new(MockBackend::new().failing_at_node(2));
    let manager = manager(&backend);
    let key = ScopeKey::test("launch_failure", Variant::MultiResourcePools);

    let err = manager.acquire(&key).await.unwrap_err();

    assert!(matches!(err, AcquireError::Launch { .. }));
    assert_eq!(err.key(), Some(&key));
    assert_eq!(backend.started_nodes(), 2);
    assert_eq!(backend.terminated_nodes(), backend.started_nodes());
    assert_eq!(backend.live_nodes(), 0);
    assert!(manager.handle(&key).is_none());
}

#[tokio::test]
async fn cancelled_acquire_tears_down() {
    let backend = Arc::new(MockBackend::new().with_launch_delay(Duration::from_secs(30)));
    let manager = manager(&backend);
    let key = ScopeKey::test("cancelled", Variant::Default);

    let outcome = tokio::time::timeout(Duration::from_millis(100), manager.acquire(&key)).await;
    assert!(outcome.is_err());
    assert_eq!(backend.started_nodes(), 2);

    // Teardown finished while the acquire was dropped.
    assert_eq!(backend.terminated_nodes(), 2);
    assert_eq!(backend.live_nodes(), 0);
    assert!(manager.handle(&key).is_none());
}

#[tokio::test]
async fn acquire_cancelled_during_readiness_unregisters() {
    let backend = Arc::new(MockBackend::new().never_ready());
    let manager = manager(&backend);
    let key = ScopeKey::test("cancelled_while_starting", Variant::MultiResourcePools);

    let outcome = tokio::time::timeout(Duration::from_millis(250), manager.acquire(&key)).await;
    assert!(outcome.is_err());

    assert!(manager.handle(&key).is_none());
    assert!(manager.active_keys().is_empty());
    assert_eq!(backend.started_nodes(), 3);
    assert_eq!(backend.live_nodes(), 0);
}

#[tokio::test]
async fn fixture_drop_releases_after_panic() {
    let backend = Arc::new(MockBackend::new());
    let session = Arc::new(ClusterSession::start(
        SessionSettings::default(),
        Backends::uniform(BackendBinding::shared(Arc::clone(&backend))),
    ));

    let failing_test = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            let _lease = managed_cluster(&session, "panics_midway").await.unwrap();
            panic!("assertion failed inside the test body");
        })
    };
    assert!(failing_test.await.unwrap_err().is_panic());

    assert!(session.manager().active_keys().is_empty());
    assert_eq!(backend.live_clusters(), 0);
}

// =============================================================================
// Teardown when the test runtime exits
// =============================================================================

fn mock_session(backend: &Arc<MockBackend>) -> ClusterSession {
    ClusterSession::start(
        SessionSettings::default(),
        Backends::uniform(BackendBinding::shared(Arc::clone(backend))),
    )
}

fn current_thread_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn lease_dropped_as_runtime_exits_is_released() {
    let backend = Arc::new(MockBackend::new());
    let session = mock_session(&backend);

    current_thread_runtime().block_on(async {
        let lease = managed_cluster(&session, "runtime_exits").await.unwrap();
        assert_eq!(lease.handle().health(), HealthState::Ready);
    });

    assert_eq!(backend.live_clusters(), 0);
    assert_eq!(backend.terminate_count(), 1);
    assert!(session.manager().active_keys().is_empty());
}

#[test]
fn lease_dropped_by_panicking_test_body_is_released() {
    let backend = Arc::new(MockBackend::new());
    let session = mock_session(&backend);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        current_thread_runtime().block_on(async {
            let _lease = managed_cluster(&session, "body_panics").await.unwrap();
            panic!("assertion failed inside the test body");
        });
    }));
    assert!(outcome.is_err());

    assert_eq!(backend.live_clusters(), 0);
    assert!(session.manager().active_keys().is_empty());
}

#[test]
fn acquire_abandoned_as_runtime_exits_is_torn_down() {
    let backend = Arc::new(MockBackend::new().with_launch_delay(Duration::from_secs(30)));
    let session = mock_session(&backend);
    let key = ScopeKey::session(Variant::Default);

    let runtime = current_thread_runtime();
    runtime.block_on(async {
        let acquire = session.manager().acquire(&key);
        let outcome = tokio::time::timeout(Duration::from_millis(50), acquire).await;
        assert!(outcome.is_err());
    });
    drop(runtime);

    assert_eq!(backend.started_nodes(), 2);
    assert_eq!(backend.live_nodes(), 0);
}
