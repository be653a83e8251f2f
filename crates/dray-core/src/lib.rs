//! dray-core
//!
//! Durable FIFO job queue with transactional claim/dispatch processors.
//!
//! Module map:
//! - domain: ids, task names, the job record state machine
//! - store: versioned snapshots with optimistic concurrency
//! - queue: queue operations on an open transaction
//! - registry: name -> task lookup and the task execution contract
//! - processor: the single-worker and bounded-pool claim loops
//! - service: public API plus processor lifecycle
//! - observability: counts-by-status snapshots
//! - error: crate-level error types

pub mod domain;
pub mod error;
pub mod observability;
pub mod processor;
mod queue;
pub mod registry;
pub mod service;
pub mod store;

pub use domain::{JobId, JobRecord, JobStatus, OwnerId, TaskName};
pub use error::{QueueError, RegistryError, ServiceError, StoreError, TaskError};
pub use observability::JobCounts;
pub use processor::{MultiProcessor, ProcessorKind, ProcessorSettings, SimpleProcessor};
pub use registry::{Task, TaskContext, TaskRegistry};
pub use service::JobService;
pub use store::{Store, Transaction};
