//! Task processors and the registry that maps task types to them.
//!
//! A processor owns the business logic for one or more task types. The
//! worker looks the processor up by [`Task::task_type`], runs it on the
//! calling thread and classifies whatever it returns.

use crate::error::{Error, Result};
use crate::model::{Status, Task, TaskResult, WorkerIdentity};
use crate::worker::{ExecutionId, RunningState};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Fault raised by a processor.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Declared business or validation fault. Recorded as the task error.
    #[error("{0}")]
    Message(String),

    /// The task was interrupted. `status` is the terminal status to record.
    #[error("task interrupted with status {status}: {reason}")]
    Interrupted { status: Status, reason: String },

    /// Anything else.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ProcessError {
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    pub fn interrupted(status: Status, reason: impl Into<String>) -> Self {
        Self::Interrupted {
            status,
            reason: reason.into(),
        }
    }
}

/// Business logic for a set of task types.
pub trait TaskProcessor: Send + Sync {
    /// Task types this processor handles.
    fn handled_types(&self) -> &[&str];

    /// Run the task to completion on the calling thread.
    ///
    /// Long-running processors should call [`TaskContext::check_interrupted`]
    /// between steps so that an interruption ends the task promptly.
    fn process(
        &self,
        task: &Task,
        ctx: &TaskContext<'_>,
    ) -> std::result::Result<Option<TaskResult>, ProcessError>;
}

/// Execution context handed to a processor.
pub struct TaskContext<'a> {
    worker: &'a WorkerIdentity,
    state: &'a RunningState,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(worker: &'a WorkerIdentity, state: &'a RunningState) -> Self {
        Self { worker, state }
    }

    /// Worker running the task.
    pub fn worker(&self) -> &WorkerIdentity {
        self.worker
    }

    /// Worker invocation the task runs under.
    pub fn execution(&self) -> ExecutionId {
        self.state.execution()
    }

    /// Has an interruption been requested for this execution?
    pub fn is_interrupted(&self) -> bool {
        self.state.interruption().is_some()
    }

    /// Fail with [`ProcessError::Interrupted`] if an interruption was requested.
    pub fn check_interrupted(&self) -> std::result::Result<(), ProcessError> {
        match self.state.interruption() {
            Some(status) => Err(ProcessError::interrupted(
                status,
                format!("interrupted while running on {}", self.worker),
            )),
            None => Ok(()),
        }
    }
}

/// Lookup of the processor for a task.
pub trait ProcessorRegistry: Send + Sync {
    fn resolve(&self, task: &Task) -> Option<Arc<dyn TaskProcessor>>;
}

/// Registry keyed by task type. Each type has at most one processor.
#[derive(Default)]
pub struct TaskProcessorRepository {
    processors: HashMap<String, Arc<dyn TaskProcessor>>,
}

impl TaskProcessorRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for every type it handles.
    ///
    /// Fails without registering anything if one of its types is taken.
    pub fn register(&mut self, processor: Arc<dyn TaskProcessor>) -> Result<()> {
        let types = processor.handled_types();
        if let Some(taken) = types.iter().find(|t| self.processors.contains_key(**t)) {
            return Err(Error::DuplicateProcessor((*taken).to_string()));
        }
        for task_type in types {
            self.processors
                .insert((*task_type).to_string(), Arc::clone(&processor));
        }
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, processor: Arc<dyn TaskProcessor>) -> Result<Self> {
        self.register(processor)?;
        Ok(self)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl ProcessorRegistry for TaskProcessorRepository {
    fn resolve(&self, task: &Task) -> Option<Arc<dyn TaskProcessor>> {
        self.processors.get(&task.task_type).cloned()
    }
}
