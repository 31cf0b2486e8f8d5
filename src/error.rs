//! Errors surfaced by the dispatcher and the bulk orchestrator
//!
//! The `Display` of every variant is the message shown to the operator.

use thiserror::Error;

use crate::queue::QueueError;
use crate::storage::StoreError;

pub const UNREACHABLE: &str = "Unable to contact the agent";

#[derive(Debug, Error)]
pub enum CommandError {
    /// Timeout or transport down
    #[error("Unable to contact the agent")]
    Unreachable,

    /// The agent is already doing what was asked
    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    CapabilityUnsupported(String),

    #[error("{0}")]
    InvalidInput(String),

    /// A non-ok answer from the agent, passed through verbatim
    #[error("{0}")]
    ApplicationError(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Storage(StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => CommandError::NotFound(what),
            other => CommandError::Storage(other),
        }
    }
}
