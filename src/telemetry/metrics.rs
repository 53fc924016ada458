//! Metric instrument factories.
//!
//! Instruments are built from a caller-supplied `Meter` so that tests can
//! skip them entirely. [`meter`] returns the globally registered one.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Shared meter for compute engine instruments.
pub fn meter() -> Meter {
    opentelemetry::global::meter("compute-engine")
}

/// Counter: finished tasks.
/// Labels: `type`, `status`.
pub fn tasks_finished(meter: &Meter) -> Counter<u64> {
    meter
        .u64_counter("ce.tasks.finished")
        .with_description("Number of tasks run to a terminal status")
        .build()
}

/// Histogram: task execution time in milliseconds.
/// Labels: `type`, `status`.
pub fn task_duration_ms(meter: &Meter) -> Histogram<f64> {
    meter
        .f64_histogram("ce.task.duration_ms")
        .with_description("Task execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
