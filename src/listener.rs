//! Execution listeners.
//!
//! Listeners are told when a task starts and when it ends. They run on the
//! worker thread, in registration order. A failing or panicking listener is
//! logged and skipped; it never stops the other listeners or the task.

use crate::error::panic_message;
use crate::model::{Status, Task, TaskError, TaskResult};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

pub trait ExecutionListener: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_start(&self, task: &Task) -> anyhow::Result<()>;

    fn on_end(
        &self,
        task: &Task,
        status: Status,
        duration: Duration,
        result: Option<&TaskResult>,
        error: Option<&TaskError>,
    ) -> anyhow::Result<()>;
}

/// Ordered, fixed set of listeners.
#[derive(Clone, Default)]
pub struct Listeners {
    listeners: Vec<Arc<dyn ExecutionListener>>,
}

impl Listeners {
    pub fn new(listeners: Vec<Arc<dyn ExecutionListener>>) -> Self {
        Self { listeners }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn notify_start(&self, task: &Task) {
        self.notify("start", |listener| listener.on_start(task));
    }

    pub(crate) fn notify_end(
        &self,
        task: &Task,
        status: Status,
        duration: Duration,
        result: Option<&TaskResult>,
        error: Option<&TaskError>,
    ) {
        self.notify("end", |listener| {
            listener.on_end(task, status, duration, result, error)
        });
    }

    fn notify(&self, event: &str, call: impl Fn(&dyn ExecutionListener) -> anyhow::Result<()>) {
        for listener in &self.listeners {
            let listener = listener.as_ref();
            match catch_unwind(AssertUnwindSafe(|| call(listener))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(listener = listener.name(), event, error = ?e, "execution listener failed");
                }
                Err(payload) => {
                    error!(
                        listener = listener.name(),
                        event,
                        panic = %panic_message(payload.as_ref()),
                        "execution listener panicked"
                    );
                }
            }
        }
    }
}

impl FromIterator<Arc<dyn ExecutionListener>> for Listeners {
    fn from_iter<I: IntoIterator<Item = Arc<dyn ExecutionListener>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Counts finished tasks on `ce.tasks.finished`.
pub struct MetricsListener {
    finished: Counter<u64>,
}

impl MetricsListener {
    pub fn new(meter: &Meter) -> Self {
        Self {
            finished: crate::telemetry::metrics::tasks_finished(meter),
        }
    }
}

impl ExecutionListener for MetricsListener {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_start(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_end(
        &self,
        task: &Task,
        status: Status,
        _duration: Duration,
        _result: Option<&TaskResult>,
        _error: Option<&TaskError>,
    ) -> anyhow::Result<()> {
        self.finished.add(
            1,
            &[
                KeyValue::new("type", task.task_type.clone()),
                KeyValue::new("status", status.as_str()),
            ],
        );
        Ok(())
    }
}
