//! Cluster configuration for mcluster.
//!
//! This crate turns a [`Variant`](mcluster_core::Variant) into a validated, immutable
//! [`ClusterConfig`]: the resource pools, scheduler, restart policy and backend a cluster
//! is launched with. Building a config is side-effect-free.
//!
//! # Example
//!
//! ```
//! use mcluster_config::{BackendKind, ClusterConfigBuilder, SchedulerKind};
//! use mcluster_core::Variant;
//!
//! let builder = ClusterConfigBuilder::default();
//!
//! let config = builder.build(Variant::MultiResourcePools).unwrap();
//! assert_eq!(config.agent_count(), 2);
//! assert_eq!(config.backend(), BackendKind::LocalProcess);
//!
//! let config = builder.build_named("priority").unwrap();
//! assert_eq!(config.scheduler(), SchedulerKind::Priority);
//!
//! assert!(builder.build_named("gpu-heavy").is_err());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod builder;
pub mod error;
pub mod types;

pub use builder::{ClusterConfigBuilder, ClusterDefaults};
pub use error::{ConfigError, Result};
pub use types::{BackendKind, ClusterConfig, ResourcePool, RestartPolicy, SchedulerKind};
