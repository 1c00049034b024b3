//! HTTP readiness probe against the master's API.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::HealthProbe;
use crate::types::{ProbeOutcome, ProcessSet};

/// Path the master answers once it has bootstrapped.
pub const INFO_PATH: &str = "/info";

/// Probes a cluster by requesting `{endpoint}/info` from its master.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl HttpHealthProbe {
    /// Create a probe whose requests time out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Probe a master endpoint directly.
    pub async fn check(&self, endpoint: &str) -> ProbeOutcome {
        let url = format!("{}{INFO_PATH}", endpoint.trim_end_matches('/'));

        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Ready,
            Ok(resp) => {
                debug!(url, status = %resp.status(), "Master returned non-success status");
                ProbeOutcome::NotReady(format!("master answered {}", resp.status()))
            }
            Err(e) => {
                debug!(url, error = %e, "Master info request failed");
                ProbeOutcome::NotReady(format!("master unreachable: {e}"))
            }
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, processes: &ProcessSet) -> ProbeOutcome {
        self.check(&processes.endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn ready_when_info_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INFO_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::default();
        assert_eq!(probe.check(&server.uri()).await, ProbeOutcome::Ready);

        // Trailing slashes on the endpoint are tolerated.
        let endpoint = format!("{}/", server.uri());
        assert_eq!(probe.check(&endpoint).await, ProbeOutcome::Ready);
    }

    #[tokio::test]
    async fn not_ready_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INFO_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let outcome = HttpHealthProbe::default().check(&server.uri()).await;
        assert!(matches!(outcome, ProbeOutcome::NotReady(ref reason) if reason.contains("503")));
    }

    #[tokio::test]
    async fn not_ready_when_unreachable() {
        let outcome = HttpHealthProbe::new(Duration::from_millis(200))
            .check("http://127.0.0.1:1")
            .await;
        assert!(matches!(outcome, ProbeOutcome::NotReady(_)));
    }
}
