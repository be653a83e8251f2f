//! Task registry: name-keyed lookup of executable units.
//!
//! Built during initialization (mutable), shared read-only during
//! processing behind an `Arc`, so the execution path takes no locks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::TaskName;
use crate::error::{RegistryError, TaskError};

/// Execution context handed to a task body.
///
/// Besides the input payload it carries the abort signal: a task that calls
/// [`TaskContext::abort_transaction`] dooms the surrounding transaction, and
/// the processor rolls the claim back instead of committing an outcome.
#[derive(Debug)]
pub struct TaskContext<'a> {
    input: &'a Value,
    abort: bool,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(input: &'a Value) -> Self {
        Self {
            input,
            abort: false,
        }
    }

    /// The job's opaque argument payload.
    pub fn input(&self) -> &Value {
        self.input
    }

    /// Doom the transaction this task runs under. The processor aborts
    /// instead of committing, and refuses to re-claim the job this session.
    pub fn abort_transaction(&mut self) {
        self.abort = true;
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort
    }
}

/// A named executable unit.
///
/// Returning `Ok` completes the job with the value as output; returning
/// `Err` fails it with the diagnostic. Flagging the context aborts the
/// transaction and discards either result.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Value, TaskError>;
}

/// Registry of tasks (name -> task).
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskName, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task under `name`. Duplicate names are rejected.
    pub fn register(
        &mut self,
        name: impl Into<TaskName>,
        task: Arc<dyn Task>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(RegistryError::DuplicateTask(name));
        }
        self.tasks.insert(name, task);
        Ok(())
    }

    /// Look a task up by name.
    pub fn resolve(&self, name: &TaskName) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
