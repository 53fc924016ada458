//! Per-task profiling.
//!
//! A [`Profiler`] is built once at pool startup and handed to every worker.
//! Each execution gets a [`TaskProfile`] that owns the `ce.task` span, logs
//! the task context on start and the elapsed time on stop.

use crate::model::{Status, Task};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Histogram, Meter};
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::{Span, info};

/// Start the span wrapping one task execution.
///
/// `task.status` is declared empty and filled in by [`TaskProfile::stop`].
pub fn start_task_span(task: &Task) -> Span {
    tracing::info_span!(
        "ce.task",
        "task.id" = %task.id,
        "task.type" = %task.task_type,
        "task.project" = task.project_key(),
        "task.status" = tracing::field::Empty,
    )
}

#[derive(Clone, Default)]
pub struct Profiler {
    duration: Option<Histogram<f64>>,
}

impl Profiler {
    /// Profiler that also records `ce.task.duration_ms` on `meter`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            duration: Some(super::metrics::task_duration_ms(meter)),
        }
    }

    /// Open the profile of `task` and log that it starts.
    pub fn start(&self, task: &Task) -> TaskProfile {
        let span = start_task_span(task);
        let context = describe(task);
        span.in_scope(|| info!("Execute task | {context}"));
        TaskProfile {
            span,
            context,
            task_type: task.task_type.clone(),
            started: Instant::now(),
            duration: self.duration.clone(),
        }
    }
}

/// Running profile of one task execution.
pub struct TaskProfile {
    span: Span,
    context: String,
    task_type: String,
    started: Instant,
    duration: Option<Histogram<f64>>,
}

impl TaskProfile {
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Context line logged on start, e.g. `project=foo | type=REPORT | id=...`.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Close the profile with the final status. Returns the elapsed time.
    pub fn stop(self, status: Status) -> Duration {
        let elapsed = self.started.elapsed();
        self.span.record("task.status", status.as_str());
        self.span.in_scope(|| {
            info!(
                "Executed task | {} | status={} | time={}ms",
                self.context,
                status,
                elapsed.as_millis()
            );
        });
        if let Some(histogram) = &self.duration {
            histogram.record(
                elapsed.as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("type", self.task_type.clone()),
                    KeyValue::new("status", status.as_str()),
                ],
            );
        }
        elapsed
    }
}

fn describe(task: &Task) -> String {
    let mut context = String::new();
    if let Some(project) = task.project_key() {
        let _ = write!(context, "project={project} | ");
    }
    let _ = write!(context, "type={}", task.task_type);
    for (key, value) in &task.characteristics {
        let _ = write!(context, " | {key}={value}");
    }
    let _ = write!(context, " | id={}", task.id);
    if let Some(submitter) = task.submitter_name() {
        let _ = write!(context, " | submitter={submitter}");
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Component, Submitter};

    #[test]
    fn context_lists_project_type_characteristics_id_and_submitter() {
        let task = Task::new("REPORT")
            .with_id("T1")
            .main_component(Component::new("c-uuid").key("my-project"))
            .submitter(Submitter {
                uuid: "u-1".into(),
                login: Some("alice".into()),
            })
            .characteristic("branch", "main")
            .characteristic("pullRequest", "42");

        assert_eq!(
            describe(&task),
            "project=my-project | type=REPORT | branch=main | pullRequest=42 | id=T1 | submitter=alice"
        );
    }

    #[test]
    fn context_omits_missing_project_and_submitter() {
        let task = Task::new("ISSUE_SYNC").with_id("T2");
        assert_eq!(describe(&task), "type=ISSUE_SYNC | id=T2");
    }

    #[test]
    fn stop_without_meter_returns_elapsed() {
        let task = Task::new("REPORT");
        let profile = Profiler::default().start(&task);
        std::thread::sleep(Duration::from_millis(2));
        assert!(profile.stop(Status::Success) >= Duration::from_millis(2));
    }
}
