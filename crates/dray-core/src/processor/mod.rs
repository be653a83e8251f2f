//! Processors: the claim/execute loops.
//!
//! Two strategies share one transactional discipline. [`SimpleProcessor`]
//! runs one claim-execute-commit cycle at a time; [`MultiProcessor`] claims
//! from a dispatcher loop and executes on a bounded pool of worker tasks.

mod multi;
mod simple;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::JobId;
use crate::error::QueueError;
use crate::registry::{TaskContext, TaskRegistry};
use crate::store::Transaction;

pub use multi::MultiProcessor;
pub use simple::SimpleProcessor;

/// Which processor the service instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    Simple,
    Multi,
}

/// Persisted processor factory reference plus arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSettings {
    /// Factory reference; swappable between runs.
    pub kind: ProcessorKind,

    /// Idle poll interval.
    pub wait_time: Duration,

    /// Worker budget of the multi processor.
    pub max_threads: usize,

    /// Dispatcher pause after spawning a worker, serializing the
    /// claim-and-start handoff.
    pub thread_startup_wait: Duration,

    /// Bounded retries on commit conflicts.
    pub conflict_retry_limit: u32,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            kind: ProcessorKind::Simple,
            wait_time: Duration::from_secs(1),
            max_threads: 5,
            thread_startup_wait: Duration::from_millis(50),
            conflict_retry_limit: 5,
        }
    }
}

/// Backoff before retrying a conflicted commit: 10ms, 20ms, 40ms, ...
pub(crate) fn conflict_backoff(attempt: u32) -> Duration {
    Duration::from_millis(10u64.saturating_mul(1 << attempt.min(6)))
}

/// How a claim-execute cycle ended, short of a store error.
pub(crate) enum ExecutionOutcome {
    /// The job reached a terminal status in the transaction; commit it.
    Finalized,

    /// The task doomed the transaction; abort it and poison the id.
    Aborted,
}

/// Run the task for an already-claimed job inside the open transaction.
///
/// A missing task fails the job without a processing step; an abort request
/// leaves the transaction for the caller to roll back.
pub(crate) async fn execute_claimed(
    txn: &mut Transaction,
    registry: &TaskRegistry,
    id: JobId,
) -> Result<ExecutionOutcome, QueueError> {
    let record = txn.job(id)?.clone();
    let Some(task) = registry.resolve(&record.task_name) else {
        tracing::warn!(job = %id, task = %record.task_name, "task not registered");
        txn.mark_error(
            id,
            Value::String(format!("task not registered: {}", record.task_name)),
        )?;
        return Ok(ExecutionOutcome::Finalized);
    };

    txn.mark_processing(id)?;
    let mut ctx = TaskContext::new(&record.input);
    let result = task.execute(&mut ctx).await;
    if ctx.abort_requested() {
        return Ok(ExecutionOutcome::Aborted);
    }
    match result {
        Ok(output) => txn.mark_completed(id, output)?,
        Err(error) => txn.mark_error(id, Value::String(error.to_string()))?,
    }
    Ok(ExecutionOutcome::Finalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_match_documented_knobs() {
        let settings = ProcessorSettings::default();
        assert_eq!(settings.kind, ProcessorKind::Simple);
        assert_eq!(settings.wait_time, Duration::from_secs(1));
        assert_eq!(settings.max_threads, 5);
        assert_eq!(settings.thread_startup_wait, Duration::from_millis(50));
        assert_eq!(settings.conflict_retry_limit, 5);
    }

    #[test]
    fn settings_round_trip_through_serde() {
        let settings = ProcessorSettings {
            kind: ProcessorKind::Multi,
            max_threads: 2,
            ..ProcessorSettings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: ProcessorSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn conflict_backoff_doubles_and_caps() {
        assert_eq!(conflict_backoff(0), Duration::from_millis(10));
        assert_eq!(conflict_backoff(1), Duration::from_millis(20));
        assert_eq!(conflict_backoff(3), Duration::from_millis(80));
        assert_eq!(conflict_backoff(60), conflict_backoff(6));
    }
}
