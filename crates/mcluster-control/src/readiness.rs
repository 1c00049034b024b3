//! Readiness polling for freshly launched clusters.

use std::time::Duration;

use mcluster_runner::{HealthProbe, ProbeOutcome, ProcessSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ReadinessTimeoutError;
use crate::lifecycle::HealthState;

/// Default spacing between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Polls a cluster's [`HealthProbe`] until it reports ready or a deadline passes.
///
/// Each probe is itself bounded by the poll interval, so a hung endpoint cannot stall the
/// waiter past its deadline by more than one interval.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessWaiter {
    interval: Duration,
}

impl Default for ReadinessWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl ReadinessWaiter {
    /// Create a waiter polling every `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// The poll interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the cluster is ready.
    ///
    /// Returns [`HealthState::Ready`] as soon as a probe succeeds and
    /// [`HealthState::Failed`] when the timeout elapses or a node has exited. A zero timeout
    /// runs exactly one probe.
    pub async fn wait_until_ready(
        &self,
        probe: &dyn HealthProbe,
        processes: &ProcessSet,
        timeout: Duration,
    ) -> HealthState {
        self.poll(probe, processes, timeout).await.0
    }

    /// Like [`wait_until_ready`](Self::wait_until_ready), but turns a failure into an error.
    ///
    /// # Errors
    ///
    /// Returns `ReadinessTimeoutError` if the cluster did not become ready.
    pub async fn require_ready(
        &self,
        probe: &dyn HealthProbe,
        processes: &ProcessSet,
        timeout: Duration,
    ) -> Result<(), ReadinessTimeoutError> {
        let started = Instant::now();
        match self.poll(probe, processes, timeout).await {
            (HealthState::Ready, _) => Ok(()),
            (_, reason) => Err(ReadinessTimeoutError {
                cluster_id: processes.cluster_id,
                waited: started.elapsed(),
                reason,
            }),
        }
    }

    async fn poll(
        &self,
        probe: &dyn HealthProbe,
        processes: &ProcessSet,
        timeout: Duration,
    ) -> (HealthState, String) {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let outcome = tokio::time::timeout(self.interval, probe.probe(processes))
                .await
                .unwrap_or_else(|_| {
                    ProbeOutcome::NotReady(format!("probe exceeded {:?}", self.interval))
                });

            let reason = match outcome {
                ProbeOutcome::Ready => {
                    debug!(
                        cluster_id = %processes.cluster_id.short(),
                        attempts,
                        "Cluster ready"
                    );
                    return (HealthState::Ready, String::new());
                }
                ProbeOutcome::Exited(reason) => {
                    warn!(
                        cluster_id = %processes.cluster_id.short(),
                        reason = %reason,
                        "Cluster node exited before readiness"
                    );
                    return (HealthState::Failed, reason);
                }
                ProbeOutcome::NotReady(reason) => reason,
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    cluster_id = %processes.cluster_id.short(),
                    attempts,
                    last_reason = %reason,
                    "Cluster not ready before deadline"
                );
                return (HealthState::Failed, reason);
            }

            debug!(
                cluster_id = %processes.cluster_id.short(),
                attempts,
                reason = %reason,
                "Cluster not ready yet"
            );
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcluster_config::ClusterConfigBuilder;
    use mcluster_core::{ClusterId, Variant};
    use mcluster_runner::{ClusterBackend, HttpHealthProbe, MockBackend};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn launched(backend: &MockBackend) -> ProcessSet {
        let config = ClusterConfigBuilder::default()
            .build(Variant::Default)
            .unwrap();
        backend
            .launch(ClusterId::from_bytes([7; 32]), &config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ready_on_first_probe() {
        let backend = MockBackend::new();
        let processes = launched(&backend).await;

        let state = ReadinessWaiter::default()
            .wait_until_ready(&backend, &processes, Duration::from_secs(5))
            .await;
        assert_eq!(state, HealthState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_scripted_not_ready() {
        let backend = MockBackend::new();
        let processes = launched(&backend).await;
        backend.script_probes([
            ProbeOutcome::NotReady("booting".to_string()),
            ProbeOutcome::NotReady("booting".to_string()),
        ]);

        let started = Instant::now();
        let state = ReadinessWaiter::default()
            .wait_until_ready(&backend, &processes, Duration::from_secs(5))
            .await;

        assert_eq!(state, HealthState::Ready);
        assert!(started.elapsed() >= DEFAULT_POLL_INTERVAL * 2);
        assert!(started.elapsed() < DEFAULT_POLL_INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_probes_once() {
        let backend = MockBackend::new().never_ready();
        let processes = launched(&backend).await;

        let started = Instant::now();
        let state = ReadinessWaiter::default()
            .wait_until_ready(&backend, &processes, Duration::ZERO)
            .await;

        assert_eq!(state, HealthState::Failed);
        assert!(started.elapsed() <= DEFAULT_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_ready() {
        let backend = MockBackend::new().never_ready();
        let processes = launched(&backend).await;

        let err = ReadinessWaiter::new(Duration::from_millis(100))
            .require_ready(&backend, &processes, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err.cluster_id, processes.cluster_id);
        assert!(err.waited >= Duration::from_secs(1));
        assert!(err.waited < Duration::from_millis(1100));
        assert!(err.reason.contains("never becomes ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn exited_fails_immediately() {
        let backend = MockBackend::new();
        let processes = launched(&backend).await;
        backend.terminate(&processes).await;

        let started = Instant::now();
        let state = ReadinessWaiter::default()
            .wait_until_ready(&backend, &processes, Duration::from_secs(60))
            .await;

        assert_eq!(state, HealthState::Failed);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn http_probe_against_master() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let backend = MockBackend::new();
        let mut processes = launched(&backend).await;
        processes.endpoint = server.uri();

        let probe = HttpHealthProbe::new(Duration::from_millis(200));
        let state = ReadinessWaiter::new(Duration::from_millis(250))
            .wait_until_ready(&probe, &processes, Duration::from_secs(2))
            .await;
        assert_eq!(state, HealthState::Ready);
    }
}
