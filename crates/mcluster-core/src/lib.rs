//! Core types for mcluster.
//!
//! This crate provides the foundational types shared by every other mcluster crate:
//!
//! - **Identifiers**: [`ClusterId`], [`NodeId`] and [`SessionId`]
//! - **Scope keys**: [`Variant`], [`Scope`] and [`ScopeKey`], the lookup key for shared clusters
//! - **Error types**: [`CoreError`]
//!
//! # Example
//!
//! ```
//! use mcluster_core::{ClusterId, NodeId, ScopeKey, Variant};
//!
//! let key = ScopeKey::session(Variant::MultiResourcePools);
//! assert_eq!(key.to_string(), "session/multi-resource-pools");
//!
//! let cluster_id = ClusterId::generate(&key);
//! assert_eq!(cluster_id.short().len(), 12);
//!
//! assert!(NodeId::MASTER.is_master());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod scope;

pub use error::{CoreError, Result};
pub use ids::{ClusterId, IdError, NodeId, SessionId};
pub use scope::{Scope, ScopeKey, Variant};
