//! Crate-level error types.
//!
//! One enum per concern: the store reports commit failures, the queue reports
//! per-job misuse, the registry reports wiring mistakes, and the service
//! wraps all of them for its public surface. Conflicts are the only
//! retryable kind; callers retry at the transaction boundary.

use thiserror::Error;

use crate::domain::{JobId, JobStatus, TaskName};

/// Errors raised by the transactional store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another transaction committed an overlapping write set first.
    #[error("concurrent commit conflict")]
    Conflict,

    /// The store was shut down; no further transactions will commit.
    #[error("store is closed")]
    Closed,

    /// Lower-level store failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by queue operations on an open transaction.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no such job {0}")]
    NoSuchJob(JobId),

    #[error("invalid status transition {from:?} -> {to:?} for {id}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Errors raised while wiring the task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate task {0}")]
    DuplicateTask(TaskName),
}

/// Failure reported by a task body; the message becomes the job's
/// diagnostic output.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(error: serde_json::Error) -> Self {
        Self(format!("payload decode: {error}"))
    }
}

/// Errors surfaced by the service adaptor.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("processing already started")]
    AlreadyProcessing,

    #[error("processing is not running")]
    NotProcessing,

    #[error("processor did not stop within the grace period")]
    ShutdownTimeout,

    #[error("invalid processor settings: {0}")]
    InvalidSettings(String),
}
