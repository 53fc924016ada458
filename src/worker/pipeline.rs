//! Lifecycle of one claimed task inside a worker cycle.
//!
//! profile start → attach + start listeners → processor → classify →
//! detach → queue finalize → profile stop → end listeners.
//!
//! Every step after the claim runs whatever happens before it; no fault
//! escapes [`TaskExecution::run`].

use super::RunningState;
use crate::error::panic_message;
use crate::listener::Listeners;
use crate::model::{ErrorKind, Status, Task, TaskError, TaskOutcome, WorkerIdentity};
use crate::processor::{ProcessError, ProcessorRegistry, TaskContext};
use crate::queue::TaskQueue;
use crate::telemetry::Profiler;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{error, warn};

pub(crate) struct TaskExecution<'a> {
    pub worker: &'a WorkerIdentity,
    pub queue: &'a dyn TaskQueue,
    pub processors: &'a dyn ProcessorRegistry,
    pub listeners: &'a Listeners,
    pub state: &'a RunningState,
}

impl TaskExecution<'_> {
    pub fn run(&self, task: Task, profiler: &Profiler) -> TaskOutcome {
        let profile = profiler.start(&task);

        self.state.set_task(Some(task.clone()));
        self.listeners.notify_start(&task);

        let outcome = profile.span().in_scope(|| self.execute(&task));

        self.state.set_task(None);
        profile.span().in_scope(|| self.finalize(&task, &outcome));

        let duration = profile.stop(outcome.status);
        self.listeners.notify_end(
            &task,
            outcome.status,
            duration,
            outcome.result.as_ref(),
            outcome.error.as_ref(),
        );
        outcome
    }

    fn execute(&self, task: &Task) -> TaskOutcome {
        let Some(processor) = self.processors.resolve(task) else {
            error!(
                "task.type" = %task.task_type,
                task.id = %task.id,
                "no task processor registered for this task type, the set of installed plugins may have changed"
            );
            return TaskOutcome::failed(None);
        };

        let ctx = TaskContext::new(self.worker, self.state);
        let processed = catch_unwind(AssertUnwindSafe(|| processor.process(task, &ctx)))
            .unwrap_or_else(|payload| {
                Err(ProcessError::Unexpected(anyhow::anyhow!(
                    "task processor panicked: {}",
                    panic_message(payload.as_ref())
                )))
            })
            .map_err(unwrap_interruption);

        match processed {
            Ok(result) => TaskOutcome::success(result),
            Err(ProcessError::Message(message)) => {
                warn!(task.id = %task.id, error = %message, "task failed");
                TaskOutcome::failed(Some(TaskError::new(ErrorKind::Message, message)))
            }
            Err(ProcessError::Interrupted { status, reason }) => {
                warn!(task.id = %task.id, %status, reason = %reason, "task interrupted");
                let error = (status == Status::Failed)
                    .then(|| TaskError::new(ErrorKind::Interrupted, reason));
                TaskOutcome {
                    status,
                    result: None,
                    error,
                }
            }
            Err(ProcessError::Unexpected(e)) => {
                error!(task.id = %task.id, error = ?e, "failed to execute task");
                TaskOutcome::failed(Some(TaskError::new(ErrorKind::Unexpected, format!("{e:#}"))))
            }
        }
    }

    fn finalize(&self, task: &Task, outcome: &TaskOutcome) {
        let removed = catch_unwind(AssertUnwindSafe(|| {
            self.queue.remove(
                task,
                outcome.status,
                outcome.result.as_ref(),
                outcome.error.as_ref(),
            )
        }));
        let fault = match removed {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("queue finalization panicked: {}", panic_message(payload.as_ref())),
        };
        match &outcome.error {
            Some(original) => error!(
                task.id = %task.id,
                status = %outcome.status,
                error = %fault,
                suppressed = %original,
                "failed to finalize task"
            ),
            None => error!(
                task.id = %task.id,
                status = %outcome.status,
                error = %fault,
                "failed to finalize task"
            ),
        }
    }
}

/// Surface an interruption that reached the worker wrapped in an `anyhow` chain.
fn unwrap_interruption(fault: ProcessError) -> ProcessError {
    let ProcessError::Unexpected(e) = fault else {
        return fault;
    };
    let interruption = e.chain().find_map(|cause| match cause.downcast_ref::<ProcessError>() {
        Some(ProcessError::Interrupted { status, reason }) => Some((*status, reason.clone())),
        _ => None,
    });
    match interruption {
        Some((status, reason)) => ProcessError::Interrupted { status, reason },
        None => ProcessError::Unexpected(e),
    }
}
