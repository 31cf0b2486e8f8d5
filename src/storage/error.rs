//! Error types for repository operations

use thiserror::Error;

/// Result type alias for repository operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The requested record does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// A compare-and-swap lost against a concurrent writer
    #[error("conflicting update: {0}")]
    Conflict(String),

    /// Backend-specific failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        StoreError::NotFound(what.to_string())
    }
}
