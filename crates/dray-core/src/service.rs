//! Service adaptor: binds the store, the registry, and a processor factory.
//!
//! Public operations are one transaction each, retried a bounded number of
//! times on commit conflicts. Start/stop commit the persisted `active` flag
//! so a restarted process can see whether processing was running; the loop
//! itself is process-local.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::domain::{JobId, JobRecord, TaskName};
use crate::error::{QueueError, ServiceError, StoreError};
use crate::observability::JobCounts;
use crate::processor::{
    conflict_backoff, MultiProcessor, ProcessorKind, ProcessorSettings, SimpleProcessor,
};
use crate::registry::TaskRegistry;
use crate::store::{Store, Transaction};

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The job service: public queue API plus processor lifecycle.
pub struct JobService {
    store: Store,
    registry: Arc<TaskRegistry>,
    running: Mutex<Option<RunningLoop>>,
    stop_grace: Duration,
}

impl JobService {
    pub fn new(store: Store, registry: Arc<TaskRegistry>) -> Self {
        Self {
            store,
            registry,
            running: Mutex::new(None),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Bound the wait in [`JobService::stop_processing`].
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Append a new job; returns its id.
    pub async fn add(
        &self,
        task_name: impl Into<TaskName>,
        input: Value,
    ) -> Result<JobId, ServiceError> {
        let task_name = task_name.into();
        self.with_retry("add", move |txn| {
            Ok(txn.add(task_name.clone(), input.clone()))
        })
        .await
    }

    /// Look a job up.
    pub async fn get(&self, id: JobId) -> Result<JobRecord, ServiceError> {
        let txn = self.store.begin().map_err(QueueError::from)?;
        Ok(txn.job(id)?.clone())
    }

    /// Withdraw a job; succeeds only while it is still Queued.
    pub async fn cancel(&self, id: JobId) -> Result<bool, ServiceError> {
        self.with_retry("cancel", move |txn| txn.cancel(id)).await
    }

    /// Snapshot of job counts by status.
    pub async fn counts(&self) -> Result<JobCounts, ServiceError> {
        let txn = self.store.begin().map_err(QueueError::from)?;
        Ok(txn.counts())
    }

    /// Remove terminal records; returns how many were purged.
    pub async fn purge_finished(&self) -> Result<usize, ServiceError> {
        self.with_retry("purge", |txn| Ok(txn.purge_finished()))
            .await
    }

    /// The persisted factory reference.
    pub async fn processor_factory(&self) -> Result<ProcessorKind, ServiceError> {
        Ok(self.processor_settings().await?.kind)
    }

    /// Swap the factory used by the next [`JobService::start_processing`].
    pub async fn set_processor_factory(&self, kind: ProcessorKind) -> Result<(), ServiceError> {
        let mut settings = self.processor_settings().await?;
        settings.kind = kind;
        self.set_processor_settings(settings).await
    }

    /// The persisted processor arguments.
    pub async fn processor_settings(&self) -> Result<ProcessorSettings, ServiceError> {
        let txn = self.store.begin().map_err(QueueError::from)?;
        Ok(txn.settings().clone())
    }

    /// Persist processor arguments for the next start.
    pub async fn set_processor_settings(
        &self,
        settings: ProcessorSettings,
    ) -> Result<(), ServiceError> {
        if settings.max_threads < 1 {
            return Err(ServiceError::InvalidSettings(
                "max_threads must be at least 1".to_string(),
            ));
        }
        self.with_retry("set_settings", move |txn| {
            txn.set_settings(settings.clone());
            Ok(())
        })
        .await
    }

    /// Is a processing loop running in this process?
    pub async fn is_processing(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Commit `active = true` and launch the configured processor's main
    /// loop in the background.
    pub async fn start_processing(&self) -> Result<(), ServiceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServiceError::AlreadyProcessing);
        }

        let settings = self
            .with_retry("start", |txn| {
                txn.set_active(true);
                Ok(txn.settings().clone())
            })
            .await?;

        let (stop, stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let registry = Arc::clone(&self.registry);
        let handle = match settings.kind {
            ProcessorKind::Simple => {
                tokio::spawn(SimpleProcessor::new(store, registry, settings, stop_rx).run())
            }
            ProcessorKind::Multi => {
                tokio::spawn(MultiProcessor::new(store, registry, settings, stop_rx).run())
            }
        };
        *running = Some(RunningLoop { stop, handle });
        Ok(())
    }

    /// Signal stop, wait up to the grace period for the loop (and its
    /// workers) to drain, and commit `active = false`.
    ///
    /// On a grace overrun the shutdown proceeds anyway: the store is closed
    /// so the abandoned loop's transactions fail to commit, jobs it still
    /// holds stay Claimed pending recovery, and the caller learns about it
    /// through [`ServiceError::ShutdownTimeout`]. The closed store remains
    /// readable, so those jobs are still visible via `get`/`counts`.
    pub async fn stop_processing(&self) -> Result<(), ServiceError> {
        let mut running = self.running.lock().await;
        let Some(RunningLoop { stop, handle }) = running.take() else {
            return Err(ServiceError::NotProcessing);
        };

        let _ = stop.send(true);
        let timed_out = tokio::time::timeout(self.stop_grace, handle).await.is_err();

        // Deactivate first: this commit has to land before the store stops
        // accepting writes.
        self.with_retry("stop", |txn| {
            txn.set_active(false);
            Ok(())
        })
        .await?;

        if timed_out {
            self.store.close();
            tracing::warn!(
                grace = ?self.stop_grace,
                "shutdown grace period exceeded; store closed, in-flight jobs remain claimed"
            );
            return Err(ServiceError::ShutdownTimeout);
        }
        Ok(())
    }

    /// Restart the processing loop when the persisted flag says it was
    /// running. Returns whether a loop was started.
    pub async fn resume_if_active(&self) -> Result<bool, ServiceError> {
        let active = {
            let txn = self.store.begin().map_err(QueueError::from)?;
            txn.is_active()
        };
        if !active || self.is_processing().await {
            return Ok(false);
        }
        self.start_processing().await?;
        Ok(true)
    }

    /// Run `op` in its own transaction, retrying conflicted commits with
    /// backoff up to the configured limit.
    async fn with_retry<T>(
        &self,
        op: &'static str,
        f: impl Fn(&mut Transaction) -> Result<T, QueueError>,
    ) -> Result<T, ServiceError> {
        let limit = {
            let txn = self.store.begin().map_err(QueueError::from)?;
            txn.settings().conflict_retry_limit
        };
        for attempt in 0..=limit {
            let mut txn = self.store.begin().map_err(QueueError::from)?;
            let value = f(&mut txn)?;
            match txn.commit() {
                Ok(()) => return Ok(value),
                Err(StoreError::Conflict) if attempt < limit => {
                    tracing::info!(op, attempt, "commit conflict, retrying");
                    tokio::time::sleep(conflict_backoff(attempt)).await;
                }
                Err(error) => return Err(QueueError::from(error).into()),
            }
        }
        Err(QueueError::from(StoreError::Conflict).into())
    }
}
