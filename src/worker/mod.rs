//! Compute engine worker.
//!
//! A [`Worker`] runs one poll/execute/finalize cycle per [`Worker::run_once`]
//! call. The caller drives it from a dedicated thread; a worker never has
//! two tasks in flight.

mod controller;
mod pipeline;
mod selection;
mod state;

pub use controller::{CeWorkerController, ProcessingGuard, WorkerController};
pub use selection::TaskSelectionCursor;
pub use state::{ExecutionId, RunningState, RunningStateTracker, TrackedExecution};

use crate::error::panic_message;
use crate::listener::Listeners;
use crate::model::{Status, Task, WorkerIdentity, WorkerResult};
use crate::processor::ProcessorRegistry;
use crate::queue::TaskQueue;
use crate::telemetry::Profiler;
use parking_lot::Mutex;
use pipeline::TaskExecution;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, info_span};

pub struct Worker {
    identity: WorkerIdentity,
    queue: Arc<dyn TaskQueue>,
    processors: Arc<dyn ProcessorRegistry>,
    controller: Arc<dyn WorkerController>,
    listeners: Listeners,
    profiler: Profiler,
    running_state: RunningStateTracker,
    cursor: Mutex<TaskSelectionCursor>,
}

impl Worker {
    pub fn new(
        identity: WorkerIdentity,
        queue: Arc<dyn TaskQueue>,
        processors: Arc<dyn ProcessorRegistry>,
        controller: Arc<dyn WorkerController>,
        listeners: Listeners,
        profiler: Profiler,
    ) -> Self {
        Self {
            identity,
            queue,
            processors,
            controller,
            listeners,
            profiler,
            running_state: RunningStateTracker::new(),
            cursor: Mutex::new(TaskSelectionCursor::new()),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn ordinal(&self) -> usize {
        self.identity.ordinal
    }

    pub fn uuid(&self) -> &str {
        &self.identity.uuid
    }

    /// Is `execution` the invocation currently running on this worker?
    pub fn is_executed_by(&self, execution: ExecutionId) -> bool {
        self.running_state
            .current()
            .is_some_and(|state| state.execution() == execution)
    }

    pub fn current_execution(&self) -> Option<ExecutionId> {
        self.running_state.current().map(|state| state.execution())
    }

    /// Task in flight on this worker, if any.
    pub fn current_task(&self) -> Option<Task> {
        self.running_state.current().and_then(|state| state.task())
    }

    /// Ask the processor running under `execution` to stop with `status`.
    ///
    /// Returns false when `execution` is no longer running on this worker.
    pub fn interrupt(&self, execution: ExecutionId, status: Status) -> bool {
        match self.running_state.current() {
            Some(state) if state.execution() == execution => {
                state.interrupt(status);
                true
            }
            _ => false,
        }
    }

    /// Look for one task and run it to a terminal outcome.
    pub fn run_once(&self) -> WorkerResult {
        let span = info_span!(
            "ce.worker",
            "worker.ordinal" = self.identity.ordinal,
            "worker.uuid" = %self.identity.uuid,
        );
        let _entered = span.enter();
        let execution = self.running_state.enter(&self.identity);

        if !self.controller.is_enabled(&self.identity) {
            return WorkerResult::Disabled;
        }

        let Some(task) = self.select_task() else {
            return WorkerResult::NoTask;
        };

        let task_id = task.id.clone();
        let _processing = self.controller.register_processing(&self.identity);
        let run = catch_unwind(AssertUnwindSafe(|| {
            TaskExecution {
                worker: &self.identity,
                queue: self.queue.as_ref(),
                processors: self.processors.as_ref(),
                listeners: &self.listeners,
                state: execution.state(),
            }
            .run(task, &self.profiler)
        }));
        match run {
            Ok(outcome) => debug!(status = %outcome.status, "task processed"),
            Err(payload) => error!(
                task.id = %task_id,
                panic = %panic_message(payload.as_ref()),
                "an error occurred while executing task"
            ),
        }
        WorkerResult::TaskProcessed
    }

    fn select_task(&self) -> Option<Task> {
        let mut cursor = self.cursor.lock();
        let uuid = self.identity.uuid.as_str();
        match catch_unwind(AssertUnwindSafe(|| cursor.next_task(self.queue.as_ref(), uuid))) {
            Ok(Ok(task)) => task,
            Ok(Err(e)) => {
                error!(error = %e, "failed to pop the queue of analysis reports");
                None
            }
            Err(payload) => {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    "failed to pop the queue of analysis reports"
                );
                None
            }
        }
    }
}
