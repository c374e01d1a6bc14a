//! Error types for flowq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing flow, step, or trigger identifiers; bad definitions.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The backing store could not be reached. Retryable.
    #[error("store unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("operation not supported by the {adapter} adapter: {operation}")]
    UnsupportedOperation {
        adapter: &'static str,
        operation: &'static str,
    },

    #[error("step {step} failed after {attempts} attempt(s): {message}")]
    StepExecution {
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    /// A scheduler lock could not be (re)acquired. Non-fatal.
    #[error("lock contention on {0}")]
    LockContention(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether callers should back off and retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::AdapterUnavailable(_) | Error::LockContention(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Error::AdapterUnavailable(err.to_string()),
            other => Error::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
