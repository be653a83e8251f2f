//! Pooled processor: one dispatcher, up to `max_threads` concurrent workers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{watch, Notify};

use crate::domain::{JobId, OwnerId};
use crate::error::{QueueError, StoreError};
use crate::registry::TaskRegistry;
use crate::store::Store;

use super::{conflict_backoff, execute_claimed, ExecutionOutcome, ProcessorSettings};

/// Bounded-pool processor, intended for I/O-bound jobs.
///
/// The dispatcher claims in its own transaction and hands the job to a
/// freshly spawned worker; the worker executes and finalizes in its own
/// transaction. Claims follow insertion order, completions do not. The
/// pause after each spawn serializes the claim-and-start handoff so
/// freshly started workers do not pile conflict errors onto each other.
pub struct MultiProcessor {
    store: Store,
    registry: Arc<TaskRegistry>,
    owner: OwnerId,
    settings: ProcessorSettings,
    poison: Arc<Mutex<HashSet<JobId>>>,
    live: Arc<AtomicUsize>,
    worker_done: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl MultiProcessor {
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
            poison: Arc::new(Mutex::new(HashSet::new())),
            live: Arc::new(AtomicUsize::new(0)),
            worker_done: Arc::new(Notify::new()),
            shutdown,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Workers currently executing a job.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Dispatch loop: claim while the budget allows, then drain on stop.
    pub async fn run(mut self) {
        tracing::info!(
            owner = %self.owner,
            max_threads = self.settings.max_threads,
            "starting service tasks"
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if self.live.load(Ordering::SeqCst) >= self.settings.max_threads {
                self.idle_wait().await;
                continue;
            }
            match self.dispatch_one().await {
                Ok(true) => self.startup_wait().await,
                Ok(false) => self.idle_wait().await,
                Err(error) => {
                    tracing::warn!(error = %error, "store unavailable; backing off");
                    self.idle_wait().await;
                }
            }
        }
        self.drain().await;
        tracing::info!(owner = %self.owner, "stopping service tasks");
    }

    /// Claim the oldest pending job and hand it to a fresh worker.
    /// Returns false when nothing was claimable.
    async fn dispatch_one(&mut self) -> Result<bool, QueueError> {
        let id = match self.claim_one().await? {
            Some(id) => id,
            None => return Ok(false),
        };

        // Bump before spawning so the budget check never undercounts.
        self.live.fetch_add(1, Ordering::SeqCst);
        let store = self.store.clone();
        let registry = Arc::clone(&self.registry);
        let poison = Arc::clone(&self.poison);
        let live = Arc::clone(&self.live);
        let done = Arc::clone(&self.worker_done);
        let limit = self.settings.conflict_retry_limit;
        tokio::spawn(async move {
            run_worker(store, registry, poison, id, limit).await;
            live.fetch_sub(1, Ordering::SeqCst);
            done.notify_one();
        });
        Ok(true)
    }

    /// One claim transaction, retried on conflict. Claim conflicts are
    /// routine when several processors share the queue.
    async fn claim_one(&self) -> Result<Option<JobId>, QueueError> {
        let limit = self.settings.conflict_retry_limit;
        for attempt in 0..=limit {
            let skip = self
                .poison
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let mut txn = self.store.begin()?;
            let id = match txn.claim_next(self.owner, &skip)? {
                Some(id) => id,
                None => return Ok(None),
            };
            match txn.commit() {
                Ok(()) => return Ok(Some(id)),
                Err(StoreError::Conflict) if attempt < limit => {
                    tracing::info!(job = %id, attempt, "claim conflict, retrying");
                    tokio::time::sleep(conflict_backoff(attempt)).await;
                }
                Err(StoreError::Conflict) => break,
                Err(error) => return Err(error.into()),
            }
        }
        tracing::warn!(
            limit = self.settings.conflict_retry_limit,
            "claim retries exhausted; no progress this iteration"
        );
        Ok(None)
    }

    /// Wait for the live-worker count to reach zero. Workers are never
    /// interrupted mid-task; each exit sends a wakeup.
    async fn drain(&self) {
        while self.live.load(Ordering::SeqCst) > 0 {
            self.worker_done.notified().await;
        }
    }

    async fn idle_wait(&mut self) {
        let wait = self.settings.wait_time;
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn startup_wait(&mut self) {
        let wait = self.settings.thread_startup_wait;
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

/// Execute and finalize one claimed job in the worker's own transaction.
///
/// An abort here rolls back only this transaction; the claim committed by
/// the dispatcher stands, so the job stays Claimed pending recovery. The id
/// is poisoned either way so the session counts it as handled.
async fn run_worker(
    store: Store,
    registry: Arc<TaskRegistry>,
    poison: Arc<Mutex<HashSet<JobId>>>,
    id: JobId,
    limit: u32,
) {
    for attempt in 0..=limit {
        let mut txn = match store.begin() {
            Ok(txn) => txn,
            Err(error) => {
                tracing::warn!(job = %id, error = %error, "store unavailable; job left claimed");
                return;
            }
        };
        match execute_claimed(&mut txn, &registry, id).await {
            Ok(ExecutionOutcome::Aborted) => {
                txn.abort();
                poison
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id);
                tracing::warn!(
                    job = %id,
                    "task aborted its transaction; job left claimed, id poisoned for this session"
                );
                return;
            }
            Ok(ExecutionOutcome::Finalized) => match txn.commit() {
                Ok(()) => return,
                Err(StoreError::Conflict) if attempt < limit => {
                    tracing::info!(job = %id, attempt, "commit conflict, retrying job");
                    tokio::time::sleep(conflict_backoff(attempt)).await;
                }
                Err(error) => {
                    tracing::warn!(job = %id, error = %error, "failed to commit job outcome");
                    return;
                }
            },
            Err(error) => {
                tracing::warn!(job = %id, error = %error, "failed to process claimed job");
                return;
            }
        }
    }
}
