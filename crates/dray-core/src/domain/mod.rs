//! Domain model (IDs, task names, job records).
pub mod ids;
pub mod job;
pub mod task;

pub use ids::{JobId, OwnerId};
pub use job::{JobRecord, JobStatus};
pub use task::TaskName;
