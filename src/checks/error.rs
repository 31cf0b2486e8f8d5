//! Error type for check evaluation and the check engine

use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A referenced check, agent or result does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Caller supplied an invalid check definition
    #[error("{0}")]
    InvalidInput(String),

    /// A reported result could not be interpreted; it is dropped
    #[error("malformed check result: {0}")]
    Malformed(String),

    #[error(transparent)]
    Storage(StoreError),

    /// The engine actor is gone
    #[error("check engine is not running")]
    Stopped,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            other => EngineError::Storage(other),
        }
    }
}
