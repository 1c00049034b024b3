//! Error types for configuration building.

use mcluster_core::CoreError;
use thiserror::Error;

/// A result type using `ConfigError`.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while building or validating a cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The requested variant is not recognized.
    #[error("unknown cluster variant: {0}")]
    UnknownVariant(String),

    /// A configuration must declare at least one resource pool.
    #[error("cluster configuration has no resource pools")]
    NoResourcePools,

    /// Two resource pools share a name.
    #[error("duplicate resource pool name: {0}")]
    DuplicatePool(String),

    /// A resource pool was declared with an empty name.
    #[error("resource pool name must not be empty")]
    EmptyPoolName,

    /// A resource pool has no capacity.
    #[error("resource pool {0} has zero capacity")]
    ZeroCapacity(String),

    /// Restart injection is enabled with a zero interval.
    #[error("restart policy is enabled but its interval is zero")]
    ZeroRestartInterval,

    /// Any other invalid setting.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<CoreError> for ConfigError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownVariant(name) => Self::UnknownVariant(name),
            other => Self::Invalid(other.to_string()),
        }
    }
}
