//! Error type shared by the reference job drivers.

use thiserror::Error;

/// Errors a job driver can hit outside the work-unit retry machinery.
#[derive(Debug, Error)]
pub enum JobDriverError {
    /// The submitted source (path, record) failed validation.
    #[error("invalid source: {0}")]
    InvalidSource(String),
    /// A filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(String),
    /// The document store rejected a read or write.
    #[error("store error: {0}")]
    Store(#[from] bookforge_scheduler_core::error::StoreError),
    /// The sink rejected a synchronous write.
    #[error("sink error: {0}")]
    Sink(#[from] bookforge_scheduler_core::error::SinkError),
    /// A persisted document failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(String),
    /// The job-level retry budget for a unit was exhausted.
    #[error("retry budget exhausted: {0}")]
    RetryBudgetExhausted(String),
}

impl From<serde_json::Error> for JobDriverError {
    fn from(err: serde_json::Error) -> Self {
        JobDriverError::Serde(err.to_string())
    }
}
