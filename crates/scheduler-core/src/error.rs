//! Error types for the scheduler core.

use thiserror::Error;

/// Errors raised by the priority queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A `None` work unit was pushed.
    #[error("cannot push a nil work unit")]
    NilUnit,
}

/// Errors raised by the token-bucket rate limiter.
#[derive(Debug, Error)]
pub enum RateLimiterError {
    /// The wait was cancelled before a token became available.
    #[error("rate limiter wait cancelled")]
    Cancelled,
}

/// Errors raised by a provider or cpu worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The bounded work channel was full at submit time.
    #[error("worker queue full for pool {pool}")]
    WorkerQueueFull {
        /// Name of the pool that rejected the submission.
        pool: String,
    },
    /// No handler is registered for the requested cpu task.
    #[error("no handler registered for cpu task {task}")]
    UnknownTask {
        /// The unregistered task name.
        task: String,
    },
    /// The unit's payload kind does not match the pool's kind.
    #[error("unit kind mismatch: pool handles {expected:?}, unit carries {actual:?}")]
    KindMismatch {
        /// Kind the pool is configured for.
        expected: crate::types::WorkKind,
        /// Kind actually carried by the payload.
        actual: crate::types::WorkKind,
    },
    /// The pool's background tasks have already shut down.
    #[error("pool {pool} is stopped")]
    Stopped {
        /// Name of the stopped pool.
        pool: String,
    },
}

/// Errors raised by the write-through sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The operation was enqueued after `stop` was called.
    #[error("sink is stopped")]
    Stopped,
    /// The underlying document store rejected the operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The synchronous waiter was cancelled (e.g. by ctx cancellation).
    #[error("send_sync cancelled before completion")]
    Cancelled,
}

/// Errors raised by the document-store contract (consumed, not implemented, by the core).
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// Transport-level failure (network, serialization, etc).
    #[error("store transport error: {0}")]
    Transport(String),
    /// The store rejected the operation as invalid.
    #[error("store rejected operation: {0}")]
    Invalid(String),
    /// The requested document does not exist.
    #[error("document not found: {collection}/{doc_id}")]
    NotFound {
        /// Collection name.
        collection: String,
        /// Document id.
        doc_id: String,
    },
}

/// Errors raised by the scheduler itself.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No pool is registered for the requested name.
    #[error("no pool named {0:?} is registered")]
    UnknownPool(String),
    /// No pool of the requested kind is registered.
    #[error("no pool of kind {0:?} is registered")]
    NoPoolForKind(crate::types::WorkKind),
    /// The provider pinned on a unit does not match the unit's kind.
    #[error("pool {pool:?} has kind {pool_kind:?}, but unit requires {unit_kind:?}")]
    ProviderKindMismatch {
        /// Pinned pool name.
        pool: String,
        /// Kind the pinned pool actually handles.
        pool_kind: crate::types::WorkKind,
        /// Kind required by the unit.
        unit_kind: crate::types::WorkKind,
    },
    /// No job exists with the given record id.
    #[error("no job with record id {0:?}")]
    UnknownJob(String),
    /// No factory is registered for the requested job type.
    #[error("no factory registered for job type {0:?}")]
    UnknownJobType(String),
    /// The job manager rejected the record create/update.
    #[error("job manager error: {0}")]
    Manager(#[from] StoreError),
    /// `Job::start` returned an error.
    #[error("job start failed: {0}")]
    StartFailed(String),
    /// `Job::on_complete` returned an error.
    #[error("job on_complete failed: {0}")]
    OnCompleteFailed(String),
}
