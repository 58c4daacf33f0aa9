//! Common error types for offsync.

use thiserror::Error;

use crate::types::RecordStatus;

/// Top-level error type for sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A record status change that the lifecycle does not allow.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: RecordStatus,
        to: RecordStatus,
    },

    /// Payload failed its integrity check.
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    /// The remote endpoint could not be reached or rejected the transfer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A transmission exceeded its time ceiling.
    #[error("Transmission timed out after {0} ms")]
    Timeout(u64),

    /// A transmission was abandoned because connectivity was lost.
    #[error("Transmission cancelled: {0}")]
    Cancelled(String),

    /// A store or queue is at its configured limit.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or delta codec failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::Cancelled(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
