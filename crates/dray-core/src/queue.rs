//! Queue operations on an open [`Transaction`].
//!
//! Each caller owns its transaction boundary: processors wrap a whole
//! claim-execute cycle, the service wraps one operation per call. The
//! pending sequence holds ids with status Queued in insertion order;
//! `claim_next` removes from its front, so a single processor claims in
//! strict insertion order.

use std::collections::HashSet;

use serde_json::Value;

use crate::domain::{JobId, JobRecord, JobStatus, OwnerId, TaskName};
use crate::error::QueueError;
use crate::observability::JobCounts;
use crate::processor::ProcessorSettings;
use crate::store::{Slot, Transaction};

impl Transaction {
    /// Append a new Queued job and return its id.
    pub fn add(&mut self, task_name: TaskName, input: Value) -> JobId {
        let id = JobId::new(self.root.next_id);
        self.root.next_id += 1;
        self.root.jobs.insert(id, JobRecord::new(id, task_name, input));
        self.root.pending.push_back(id);
        self.touch(Slot::Meta);
        self.touch(Slot::Pending);
        self.touch(Slot::Job(id));
        id
    }

    /// Is any job waiting in the pending sequence?
    pub fn has_pending(&self) -> bool {
        !self.root.pending.is_empty()
    }

    /// Claim the oldest Queued job for `owner`, skipping ids in `skip`.
    ///
    /// Skipped ids stay in place so another processor can still claim them.
    /// Returns `None` when nothing claimable is pending.
    pub fn claim_next(
        &mut self,
        owner: OwnerId,
        skip: &HashSet<JobId>,
    ) -> Result<Option<JobId>, QueueError> {
        let position = self.root.pending.iter().position(|id| !skip.contains(id));
        let id = match position.and_then(|at| self.root.pending.remove(at)) {
            Some(id) => id,
            None => return Ok(None),
        };
        let record = self.root.jobs.get_mut(&id).ok_or(QueueError::NoSuchJob(id))?;
        record.claim(owner)?;
        self.touch(Slot::Pending);
        self.touch(Slot::Job(id));
        Ok(Some(id))
    }

    /// Claimed -> Processing.
    pub fn mark_processing(&mut self, id: JobId) -> Result<(), QueueError> {
        let record = self.root.jobs.get_mut(&id).ok_or(QueueError::NoSuchJob(id))?;
        record.start_processing()?;
        self.touch(Slot::Job(id));
        Ok(())
    }

    /// Processing -> Completed with the task's return value.
    pub fn mark_completed(&mut self, id: JobId, output: Value) -> Result<(), QueueError> {
        let record = self.root.jobs.get_mut(&id).ok_or(QueueError::NoSuchJob(id))?;
        record.complete(output)?;
        self.touch(Slot::Job(id));
        Ok(())
    }

    /// Claimed | Processing -> Error with a diagnostic output.
    pub fn mark_error(&mut self, id: JobId, output: Value) -> Result<(), QueueError> {
        let record = self.root.jobs.get_mut(&id).ok_or(QueueError::NoSuchJob(id))?;
        record.fail(output)?;
        self.touch(Slot::Job(id));
        Ok(())
    }

    /// Look up a job record.
    pub fn job(&self, id: JobId) -> Result<&JobRecord, QueueError> {
        self.root.jobs.get(&id).ok_or(QueueError::NoSuchJob(id))
    }

    /// Withdraw a Queued job. Returns false once a processor holds it.
    pub fn cancel(&mut self, id: JobId) -> Result<bool, QueueError> {
        let record = self.root.jobs.get_mut(&id).ok_or(QueueError::NoSuchJob(id))?;
        if record.status != JobStatus::Queued {
            return Ok(false);
        }
        record.cancel()?;
        self.root.pending.retain(|pending| *pending != id);
        self.touch(Slot::Pending);
        self.touch(Slot::Job(id));
        Ok(true)
    }

    /// Remove terminal records; returns how many were purged.
    pub fn purge_finished(&mut self) -> usize {
        let finished: Vec<JobId> = self
            .root
            .jobs
            .values()
            .filter(|record| record.status.is_terminal())
            .map(|record| record.id)
            .collect();
        for id in &finished {
            self.root.jobs.remove(id);
            self.touch(Slot::Job(*id));
        }
        finished.len()
    }

    /// Fold job statuses into a counts snapshot.
    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for record in self.root.jobs.values() {
            match record.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Claimed => counts.claimed += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Error => counts.error += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Persisted processing flag.
    pub fn is_active(&self) -> bool {
        self.root.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.root.active = active;
        self.touch(Slot::Meta);
    }

    /// Persisted processor factory reference and arguments.
    pub fn settings(&self) -> &ProcessorSettings {
        &self.root.settings
    }

    pub fn set_settings(&mut self, settings: ProcessorSettings) {
        self.root.settings = settings;
        self.touch(Slot::Meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::Store;
    use serde_json::json;

    fn seeded(n: u64) -> (Store, Vec<JobId>) {
        let store = Store::new();
        let mut txn = store.begin().unwrap();
        let ids = (0..n)
            .map(|i| txn.add(TaskName::new("echo"), json!({ "i": i })))
            .collect();
        txn.commit().unwrap();
        (store, ids)
    }

    #[test]
    fn add_assigns_monotonic_ids_and_queues_fifo() {
        let (store, ids) = seeded(3);
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);

        let txn = store.begin().unwrap();
        assert!(txn.has_pending());
        let record = txn.job(ids[0]).unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.input, json!({ "i": 0 }));
    }

    #[test]
    fn claim_next_follows_insertion_order() {
        let (store, ids) = seeded(3);
        let owner = OwnerId::mint();

        let mut txn = store.begin().unwrap();
        let none = HashSet::new();
        assert_eq!(txn.claim_next(owner, &none).unwrap(), Some(ids[0]));
        assert_eq!(txn.claim_next(owner, &none).unwrap(), Some(ids[1]));
        assert_eq!(txn.claim_next(owner, &none).unwrap(), Some(ids[2]));
        assert_eq!(txn.claim_next(owner, &none).unwrap(), None);

        let record = txn.job(ids[0]).unwrap();
        assert_eq!(record.status, JobStatus::Claimed);
        assert_eq!(record.owner, Some(owner));
        assert!(record.claimed_at.is_some());
    }

    #[test]
    fn claim_next_skips_poisoned_ids_but_leaves_them_pending() {
        let (store, ids) = seeded(2);
        let owner = OwnerId::mint();

        let mut txn = store.begin().unwrap();
        let skip: HashSet<JobId> = [ids[0]].into_iter().collect();
        assert_eq!(txn.claim_next(owner, &skip).unwrap(), Some(ids[1]));
        // The skipped id is still claimable by a caller without the poison.
        assert_eq!(txn.claim_next(owner, &HashSet::new()).unwrap(), Some(ids[0]));
    }

    #[test]
    fn a_job_is_claimed_by_at_most_one_committer() {
        let (store, ids) = seeded(1);
        let none = HashSet::new();

        let mut a = store.begin().unwrap();
        let mut b = store.begin().unwrap();
        assert_eq!(a.claim_next(OwnerId::mint(), &none).unwrap(), Some(ids[0]));
        assert_eq!(b.claim_next(OwnerId::mint(), &none).unwrap(), Some(ids[0]));

        a.commit().unwrap();
        assert!(matches!(
            b.commit(),
            Err(StoreError::Conflict)
        ));
    }

    #[test]
    fn marks_are_guarded_by_the_state_machine() {
        let (store, ids) = seeded(1);

        let mut txn = store.begin().unwrap();
        let err = txn.mark_completed(ids[0], json!(null)).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        txn.claim_next(OwnerId::mint(), &HashSet::new()).unwrap();
        txn.mark_processing(ids[0]).unwrap();
        txn.mark_completed(ids[0], json!("out")).unwrap();
        txn.commit().unwrap();

        let txn = store.begin().unwrap();
        let record = txn.job(ids[0]).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.output, Some(json!("out")));
    }

    #[test]
    fn cancel_succeeds_for_queued_only() {
        let (store, ids) = seeded(2);

        let mut txn = store.begin().unwrap();
        assert!(txn.cancel(ids[0]).unwrap());
        assert!(!txn.cancel(ids[0]).unwrap());

        txn.claim_next(OwnerId::mint(), &HashSet::new()).unwrap();
        assert!(!txn.cancel(ids[1]).unwrap());
        txn.commit().unwrap();

        let txn = store.begin().unwrap();
        assert_eq!(txn.job(ids[0]).unwrap().status, JobStatus::Cancelled);
        assert!(!txn.has_pending());
    }

    #[test]
    fn purge_removes_terminal_records_only() {
        let (store, ids) = seeded(3);

        let mut txn = store.begin().unwrap();
        txn.cancel(ids[0]).unwrap();
        txn.claim_next(OwnerId::mint(), &HashSet::new()).unwrap();
        txn.mark_processing(ids[1]).unwrap();
        txn.mark_completed(ids[1], json!(null)).unwrap();
        assert_eq!(txn.purge_finished(), 2);
        txn.commit().unwrap();

        let txn = store.begin().unwrap();
        assert!(txn.job(ids[0]).is_err());
        assert!(txn.job(ids[1]).is_err());
        assert_eq!(txn.job(ids[2]).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn counts_fold_every_status() {
        let (store, ids) = seeded(3);

        let mut txn = store.begin().unwrap();
        txn.cancel(ids[2]).unwrap();
        txn.claim_next(OwnerId::mint(), &HashSet::new()).unwrap();
        txn.mark_processing(ids[0]).unwrap();
        txn.mark_error(ids[0], json!("boom")).unwrap();
        txn.commit().unwrap();

        let counts = store.begin().unwrap().counts();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.error, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.total(), 3);
    }
}
