//! Transactional store: versioned snapshots with optimistic concurrency.
//!
//! A [`Transaction`] clones the committed root at begin, mutates the clone,
//! and validates per-slot versions at commit. The first committer wins;
//! losers get [`StoreError::Conflict`] and re-run at their transaction
//! boundary. Readers always see a snapshot consistent with their begin.
//!
//! Conflict detection is per slot, not per store: one slot per job record,
//! one for the pending sequence, one for the service metadata. Two claimers
//! racing on the pending sequence always collide; two workers finalizing
//! different jobs never do.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::domain::{JobId, JobRecord};
use crate::error::StoreError;
use crate::processor::ProcessorSettings;

/// Version-checked unit of conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Slot {
    /// One job record.
    Job(JobId),
    /// The FIFO sequence of queued ids.
    Pending,
    /// Id counter, active flag, and processor settings.
    Meta,
}

/// Durable state reachable from the service root.
#[derive(Debug, Clone)]
pub(crate) struct ServiceRoot {
    /// All non-purged jobs.
    pub(crate) jobs: BTreeMap<JobId, JobRecord>,

    /// Ids with status Queued, in insertion order.
    pub(crate) pending: VecDeque<JobId>,

    /// Next job id to allocate.
    pub(crate) next_id: u64,

    /// Whether processing should be running (survives restart).
    pub(crate) active: bool,

    /// Processor factory reference plus arguments.
    pub(crate) settings: ProcessorSettings,
}

impl Default for ServiceRoot {
    fn default() -> Self {
        Self {
            jobs: BTreeMap::new(),
            pending: VecDeque::new(),
            next_id: 1,
            active: false,
            settings: ProcessorSettings::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Committed {
    root: ServiceRoot,
    versions: HashMap<Slot, u64>,
    closed: bool,
}

/// Handle to the shared store. Cheap to clone; every processor and worker
/// holds its own handle, mirroring one connection per worker.
#[derive(Debug, Clone, Default)]
pub struct Store {
    committed: Arc<Mutex<Committed>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction on a snapshot of the committed state.
    pub fn begin(&self) -> Result<Transaction, StoreError> {
        let committed = self.lock()?;
        Ok(Transaction {
            committed: Arc::clone(&self.committed),
            root: committed.root.clone(),
            base: committed.versions.clone(),
            writes: HashSet::new(),
        })
    }

    /// Shut the store down. Every commit from now on fails with
    /// [`StoreError::Closed`], including transactions already open, so
    /// abandoned loops cannot publish late outcomes. Snapshots can still be
    /// taken, keeping the final state inspectable after shutdown.
    pub fn close(&self) {
        if let Ok(mut committed) = self.committed.lock() {
            committed.closed = true;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Committed>, StoreError> {
        self.committed
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".to_string()))
    }
}

/// An open transaction: a private copy of the root plus the write set.
///
/// Dropping a transaction discards it; only [`Transaction::commit`] publishes
/// writes. Queue operations live in the `queue` module as methods on this
/// type.
#[derive(Debug)]
pub struct Transaction {
    committed: Arc<Mutex<Committed>>,
    pub(crate) root: ServiceRoot,
    base: HashMap<Slot, u64>,
    writes: HashSet<Slot>,
}

impl Transaction {
    /// Record `slot` as written so commit validates and publishes it.
    pub(crate) fn touch(&mut self, slot: Slot) {
        self.writes.insert(slot);
    }

    /// Validate the write set against committed versions and publish it.
    pub fn commit(self) -> Result<(), StoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut committed = self
            .committed
            .lock()
            .map_err(|_: PoisonError<_>| StoreError::Unavailable("store mutex poisoned".to_string()))?;
        if committed.closed {
            return Err(StoreError::Closed);
        }
        for slot in &self.writes {
            if committed.versions.get(slot) != self.base.get(slot) {
                return Err(StoreError::Conflict);
            }
        }
        for slot in &self.writes {
            match slot {
                Slot::Job(id) => match self.root.jobs.get(id) {
                    Some(record) => {
                        committed.root.jobs.insert(*id, record.clone());
                    }
                    None => {
                        committed.root.jobs.remove(id);
                    }
                },
                Slot::Pending => {
                    committed.root.pending = self.root.pending.clone();
                }
                Slot::Meta => {
                    committed.root.next_id = self.root.next_id;
                    committed.root.active = self.root.active;
                    committed.root.settings = self.root.settings.clone();
                }
            }
            *committed.versions.entry(*slot).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Discard the transaction. Equivalent to dropping it; the explicit form
    /// reads better at abort sites.
    pub fn abort(self) {}
}
