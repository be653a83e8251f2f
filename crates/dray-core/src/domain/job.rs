//! Job record: the per-job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueueError;

use super::ids::{JobId, OwnerId};
use super::task::TaskName;

/// Job status.
///
/// Transitions:
/// - Queued -> Claimed -> Processing -> Completed | Error
/// - Queued -> Cancelled (and Claimed -> Cancelled, permitted by the state
///   machine but not exposed through the service API)
///
/// Progression is monotonic; terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting in the pending sequence.
    Queued,

    /// Removed from the pending sequence and owned by one processor.
    Claimed,

    /// The task body is running.
    Processing,

    /// Finished; `output` holds the task's return value.
    Completed,

    /// Finished; `output` holds a diagnostic.
    Error,

    /// Withdrawn before any processor claimed it.
    Cancelled,
}

impl JobStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Would moving to `next` respect the state machine?
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Claimed)
                | (Queued, Cancelled)
                | (Claimed, Processing)
                | (Claimed, Error)
                | (Claimed, Cancelled)
                | (Processing, Completed)
                | (Processing, Error)
        )
    }
}

/// Durable state of one job.
///
/// The record is the single source of truth for a job; queue structures hold
/// ids only, and every state change goes through the guarded methods below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub task_name: TaskName,

    /// Opaque argument payload, handed to the task verbatim.
    pub input: Value,

    pub status: JobStatus,

    /// Terminal result payload, populated on Completed/Error.
    pub output: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Processor holding the claim, if any.
    pub owner: Option<OwnerId>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, task_name: TaskName, input: Value) -> Self {
        Self {
            id,
            task_name,
            input,
            status: JobStatus::Queued,
            output: None,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
            owner: None,
        }
    }

    /// Take the claim for `owner`.
    pub(crate) fn claim(&mut self, owner: OwnerId) -> Result<(), QueueError> {
        self.transition(JobStatus::Claimed)?;
        self.owner = Some(owner);
        self.claimed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task body as running.
    pub(crate) fn start_processing(&mut self) -> Result<(), QueueError> {
        self.transition(JobStatus::Processing)
    }

    /// Record a successful result.
    pub(crate) fn complete(&mut self, output: Value) -> Result<(), QueueError> {
        self.transition(JobStatus::Completed)?;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failure diagnostic.
    pub(crate) fn fail(&mut self, output: Value) -> Result<(), QueueError> {
        self.transition(JobStatus::Error)?;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Withdraw the job.
    pub(crate) fn cancel(&mut self) -> Result<(), QueueError> {
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), QueueError> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
