use serde::{Deserialize, Serialize};

/// Snapshot of job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: usize,
    pub claimed: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.queued + self.claimed + self.processing + self.completed + self.error + self.cancelled
    }
}
