//! Common error types for mcluster.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors shared across the mcluster crates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The variant name does not match any known cluster variant.
    #[error("unknown cluster variant: {0}")]
    UnknownVariant(String),

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),
}
