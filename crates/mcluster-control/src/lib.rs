//! Lifecycle management for shared mcluster test clusters.
//!
//! This crate decides when clusters are launched, shared between tests, restarted and torn
//! down. Tests reach it through the fixture factories in [`fixtures`], which return a
//! [`ClusterLease`] that gives the cluster back when the test ends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Tests (fixture factories, ClusterLease)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ClusterLifecycleManager                     │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐   │
//! │  │  Per-key    │ │  Readiness  │ │  Health             │   │
//! │  │  gates      │ │  Waiter     │ │  State Machine      │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │  Scope   │   │ Config   │   │ Backends │
//!        │ Registry │   │ Builder  │   │(proc/K8s)│
//!        └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use mcluster_control::fixtures::restartable_managed_cluster;
//! use mcluster_control::ClusterSession;
//! use mcluster_core::NodeId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = ClusterSession::from_env().await;
//!
//! let lease = restartable_managed_cluster(&session, "agent_reconnects").await?;
//! println!("master at {}", lease.endpoint());
//!
//! lease.inject_restart(NodeId::agent(0)).await?;
//! lease.release().await?;
//!
//! session.finish().await;
//! # Ok(())
//! # }
//! ```
//!
//! # State Machine
//!
//! Clusters follow a strict health state machine:
//!
//! - `Starting` → `Ready` (probe passed), `Failed`, or `Stopped`
//! - `Ready` → `Degraded` (restart or relaunch) or `Stopped`
//! - `Degraded` → `Ready` (recovered), `Failed`, or `Stopped`
//! - `Stopped` and `Failed` are terminal
//!
//! A ready cluster with outstanding acquisitions is in use. See the [`lifecycle`] module for
//! transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod cleanup;
pub mod error;
pub mod fixtures;
pub mod handle;
pub mod lifecycle;
pub mod manager;
pub mod readiness;
pub mod registry;
pub mod session;
pub mod types;

pub use error::{AcquireError, ControlError, ReadinessTimeoutError, Result};
pub use fixtures::ClusterLease;
pub use handle::{ClusterHandle, HandleSnapshot};
pub use lifecycle::HealthState;
pub use manager::ClusterLifecycleManager;
pub use readiness::ReadinessWaiter;
pub use registry::ScopeRegistry;
pub use session::{ClusterSession, SessionLock, SessionLockGuard};
pub use types::{ManagerConfig, SessionSettings};

// Re-export commonly used types from dependencies for convenience
pub use mcluster_config::ResourcePool;
pub use mcluster_core::{ClusterId, NodeId, ScopeKey, Variant};
