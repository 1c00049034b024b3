//! Node backends for mcluster.
//!
//! This crate provides the [`ClusterBackend`] trait, which starts, stops and restarts the
//! nodes of a test cluster, and the [`HealthProbe`] trait used to decide when a cluster is
//! ready. Two backends are included:
//!
//! - [`LocalProcessBackend`] runs the master and agents as local child processes
//! - [`K8sBackend`] runs them as pods in a Kubernetes namespace
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Cluster Lifecycle Manager                     │
//! └─────────────────────────────────────────────────────────────────┘
//!                  │                               │
//!                  ▼                               ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │        ClusterBackend         │ │          HealthProbe          │
//! │  launch / terminate / restart │ │  Ready / NotReady / Exited    │
//! └───────────────────────────────┘ └───────────────────────────────┘
//!          │                 │                     │
//!          ▼                 ▼                     ▼
//! ┌────────────────┐ ┌────────────────┐ ┌───────────────────────────┐
//! │ Local process  │ │  K8s backend   │ │ GET {endpoint}/info       │
//! │ SIGTERM→KILL   │ │  Pod builder   │ │ pod Ready conditions      │
//! └────────────────┘ └────────────────┘ └───────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mcluster_config::ClusterConfigBuilder;
//! use mcluster_core::{ClusterId, NodeId, ScopeKey, Variant};
//! use mcluster_runner::{ClusterBackend, HealthProbe, LocalProcessBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = LocalProcessBackend::from_env();
//! let config = ClusterConfigBuilder::from_env().build(Variant::Restartable)?;
//! let cluster_id = ClusterId::generate(&ScopeKey::session(Variant::Restartable));
//!
//! let processes = backend.launch(cluster_id, &config).await?;
//! println!("master at {}", processes.endpoint);
//!
//! if backend.probe(&processes).await.is_ready() {
//!     let processes = backend.restart_node(&processes, NodeId::agent(0)).await?;
//!     backend.terminate(&processes).await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! For testing without processes or a Kubernetes cluster, enable the `test-utils` feature
//! and use the mock backend:
//!
//! ```ignore
//! use mcluster_runner::{ClusterBackend, MockBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MockBackend::new().failing_at_node(1);
//! assert!(backend.launch(cluster_id, &config).await.is_err());
//! assert_eq!(backend.started_nodes(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod k8s;
pub mod local;
pub mod pod;
pub mod probe;
pub mod types;

pub use backend::{BackendBinding, Backends, ClusterBackend, HealthProbe};
pub use error::{LaunchError, RestartError, Result};
pub use k8s::K8sBackend;
pub use local::LocalProcessBackend;
pub use probe::HttpHealthProbe;
pub use types::{
    node_plan, K8sBackendConfig, LocalBackendConfig, NodeIdent, NodeProcess, NodeRole,
    ProbeOutcome, ProcessSet,
};

#[cfg(any(test, feature = "test-utils"))]
pub use backend::mock::MockBackend;
