use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// Catalog page fetch failed; the backfill run that hit it is aborted.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Job handler failure. The message is stored verbatim as the job's
    /// failure reason.
    #[error("{0}")]
    Handler(String),

    #[error("Admin operation failed: {0}")]
    Admin(String),

    #[error("Job {0} is locked by an active worker")]
    JobLocked(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} already exists ({state})")]
    AlreadyExists { id: String, state: String },

    #[error("Unsupported state for {operation}: {state}")]
    UnsupportedState {
        operation: &'static str,
        state: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
