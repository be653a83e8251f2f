//! Sequential processor: one claim-execute-commit cycle per iteration.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;

use crate::domain::{JobId, OwnerId};
use crate::error::{QueueError, StoreError};
use crate::registry::TaskRegistry;
use crate::store::Store;

use super::{conflict_backoff, execute_claimed, ExecutionOutcome, ProcessorSettings};

/// Single-worker processor, intended for CPU-heavy jobs.
///
/// The claim, the task body, and the terminal status land in one
/// transaction, so a task that aborts rolls its own claim back. The
/// session-local poison set keeps such a job from being re-claimed here,
/// which is what makes an aborting job run exactly once per enqueue.
pub struct SimpleProcessor {
    store: Store,
    registry: Arc<TaskRegistry>,
    owner: OwnerId,
    settings: ProcessorSettings,
    poison: HashSet<JobId>,
    shutdown: watch::Receiver<bool>,
}

impl SimpleProcessor {
    pub fn new(
        store: Store,
        registry: Arc<TaskRegistry>,
        settings: ProcessorSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            owner: OwnerId::mint(),
            settings,
            poison: HashSet::new(),
            shutdown,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// One claim-execute-commit cycle. Returns true if a job made progress,
    /// false if the queue was empty (or conflict retries ran dry).
    pub async fn process_next(&mut self) -> Result<bool, QueueError> {
        let limit = self.settings.conflict_retry_limit;
        for attempt in 0..=limit {
            let mut txn = self.store.begin()?;
            let id = match txn.claim_next(self.owner, &self.poison)? {
                Some(id) => id,
                None => return Ok(false),
            };
            match execute_claimed(&mut txn, &self.registry, id).await? {
                ExecutionOutcome::Aborted => {
                    txn.abort();
                    self.poison.insert(id);
                    tracing::warn!(
                        job = %id,
                        "task aborted its transaction; claim rolled back, id poisoned for this session"
                    );
                    return Ok(true);
                }
                ExecutionOutcome::Finalized => match txn.commit() {
                    Ok(()) => return Ok(true),
                    Err(StoreError::Conflict) if attempt < limit => {
                        tracing::info!(job = %id, attempt, "commit conflict, retrying cycle");
                        tokio::time::sleep(conflict_backoff(attempt)).await;
                    }
                    Err(StoreError::Conflict) => break,
                    Err(error) => return Err(error.into()),
                },
            }
        }
        tracing::warn!(
            limit = self.settings.conflict_retry_limit,
            "conflict retries exhausted; no progress this iteration"
        );
        Ok(false)
    }

    /// Main loop: process until stopped, pausing `wait_time` when idle.
    pub async fn run(mut self) {
        tracing::info!(owner = %self.owner, "starting service tasks");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => self.idle_wait().await,
                Err(error) => {
                    tracing::warn!(error = %error, "store unavailable; backing off");
                    self.idle_wait().await;
                }
            }
        }
        tracing::info!(owner = %self.owner, "stopping service tasks");
    }

    async fn idle_wait(&mut self) {
        let wait = self.settings.wait_time;
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, TaskName};
    use crate::error::TaskError;
    use crate::registry::{Task, TaskContext};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Sleeps for `millis`, then appends `label` to the shared completion log.
    struct SleepTask {
        log: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl Task for SleepTask {
        async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Value, TaskError> {
            let millis = ctx.input()["millis"].as_u64().unwrap_or(0);
            let label = ctx.input()["label"].as_i64().unwrap_or(-1);
            sleep(Duration::from_millis(millis)).await;
            self.log.lock().unwrap().push(label);
            Ok(json!({ "label": label }))
        }
    }

    /// Increments a counter, then dooms the transaction.
    struct CountAndAbortTask {
        counter: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Task for CountAndAbortTask {
        async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Value, TaskError> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            ctx.abort_transaction();
            Ok(Value::Null)
        }
    }

    struct EchoTask;

    #[async_trait]
    impl Task for EchoTask {
        async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Value, TaskError> {
            Ok(ctx.input().clone())
        }
    }

    fn test_settings() -> ProcessorSettings {
        ProcessorSettings {
            wait_time: Duration::from_millis(5),
            ..ProcessorSettings::default()
        }
    }

    fn make_processor(
        store: &Store,
        registry: TaskRegistry,
    ) -> (SimpleProcessor, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let processor =
            SimpleProcessor::new(store.clone(), Arc::new(registry), test_settings(), stop_rx);
        (processor, stop_tx)
    }

    #[tokio::test]
    async fn process_next_returns_false_on_empty_queue() {
        let store = Store::new();
        let (mut processor, _stop) = make_processor(&store, TaskRegistry::new());
        assert!(!processor.process_next().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completions_follow_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskRegistry::new();
        registry
            .register("sleep", Arc::new(SleepTask { log: Arc::clone(&log) }))
            .unwrap();

        let store = Store::new();
        let mut txn = store.begin().unwrap();
        for (millis, label) in [(40, 1), (100, 2), (0, 3), (80, 4)] {
            txn.add(
                TaskName::new("sleep"),
                json!({ "millis": millis, "label": label }),
            );
        }
        txn.commit().unwrap();

        let (processor, stop) = make_processor(&store, registry);
        let handle = tokio::spawn(processor.run());

        for _ in 0..100 {
            if store.begin().unwrap().counts().completed == 4 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        stop.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn aborting_task_runs_exactly_once_per_enqueue() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::new();
        registry
            .register(
                "count",
                Arc::new(CountAndAbortTask {
                    counter: Arc::clone(&counter),
                }),
            )
            .unwrap();

        let store = Store::new();
        let mut txn = store.begin().unwrap();
        let id = txn.add(TaskName::new("count"), Value::Null);
        txn.commit().unwrap();

        let (mut processor, _stop) = make_processor(&store, registry);

        // First cycle runs the task once and rolls the claim back.
        assert!(processor.process_next().await.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let txn = store.begin().unwrap();
        assert_eq!(txn.job(id).unwrap().status, JobStatus::Queued);
        assert!(txn.has_pending());

        // The poisoned id is skipped for the rest of the session.
        assert!(!processor.process_next().await.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_task_errors_the_job_and_drains_the_rest() {
        let mut registry = TaskRegistry::new();
        registry.register("echo", Arc::new(EchoTask)).unwrap();

        let store = Store::new();
        let mut txn = store.begin().unwrap();
        let unknown = txn.add(TaskName::new("unknown"), json!(1));
        let known = txn.add(TaskName::new("echo"), json!(2));
        txn.commit().unwrap();

        let (mut processor, _stop) = make_processor(&store, registry);
        assert!(processor.process_next().await.unwrap());
        assert!(processor.process_next().await.unwrap());
        assert!(!processor.process_next().await.unwrap());

        let txn = store.begin().unwrap();
        let failed = txn.job(unknown).unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(
            failed.output,
            Some(Value::String("task not registered: unknown".to_string()))
        );
        assert_eq!(txn.job(known).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn failing_task_records_the_diagnostic() {
        struct FailingTask;

        #[async_trait]
        impl Task for FailingTask {
            async fn execute(&self, _ctx: &mut TaskContext<'_>) -> Result<Value, TaskError> {
                Err(TaskError::new("intentional failure"))
            }
        }

        let mut registry = TaskRegistry::new();
        registry.register("fail", Arc::new(FailingTask)).unwrap();

        let store = Store::new();
        let mut txn = store.begin().unwrap();
        let id = txn.add(TaskName::new("fail"), Value::Null);
        txn.commit().unwrap();

        let (mut processor, _stop) = make_processor(&store, registry);
        assert!(processor.process_next().await.unwrap());

        let txn = store.begin().unwrap();
        let record = txn.job(id).unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(
            record.output,
            Some(Value::String("intentional failure".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn contending_processors_complete_each_job_exactly_once() {
        let store = Store::new();
        let mut txn = store.begin().unwrap();
        let ids: Vec<_> = (0..100)
            .map(|i| txn.add(TaskName::new("echo"), json!({ "i": i })))
            .collect();
        txn.commit().unwrap();

        let mut handles = Vec::new();
        let mut stops = Vec::new();
        for _ in 0..2 {
            let mut registry = TaskRegistry::new();
            registry.register("echo", Arc::new(EchoTask)).unwrap();
            let (processor, stop) = make_processor(&store, registry);
            stops.push(stop);
            handles.push(tokio::spawn(processor.run()));
        }

        for _ in 0..500 {
            if store.begin().unwrap().counts().completed == 100 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        for stop in &stops {
            stop.send(true).unwrap();
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let txn = store.begin().unwrap();
        let mut owners = HashSet::new();
        for id in ids {
            let record = txn.job(id).unwrap();
            assert_eq!(record.status, JobStatus::Completed, "job {id} not completed");
            owners.insert(record.owner.unwrap());
        }
        // Both processors made progress under contention.
        assert!(!owners.is_empty() && owners.len() <= 2);
        assert!(!txn.has_pending());
    }
}
