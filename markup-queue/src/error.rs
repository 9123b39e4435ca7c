//! Error types for queue operations.

use crate::job::JobId;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Caller supplied an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Store could not be reached or rejected the operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Whether the error came from the backing store rather than the caller.
    pub fn is_store_error(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            Self::Redis(_) => true,
            Self::StoreUnavailable(_) => true,
            _ => false,
        }
    }
}

/// Error returned by a job handler. Any error counts as a failed attempt.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
