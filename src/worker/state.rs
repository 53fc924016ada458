//! Live execution state of a worker.
//!
//! Each `run_once` call installs a fresh [`RunningState`] on entry and clears
//! it on exit. Both transitions are compare-and-set: an unexpected prior
//! state on entry is overwritten with a warning, and a state that was
//! replaced meanwhile is left alone on exit.

use crate::model::{Status, Task, WorkerIdentity};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use tracing::warn;

static NEXT_EXECUTION: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of one `run_once` invocation. Compared by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(u64);

impl ExecutionId {
    fn next() -> Self {
        Self(NEXT_EXECUTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// What a worker is doing right now.
#[derive(Debug)]
pub struct RunningState {
    execution: ExecutionId,
    thread: ThreadId,
    task: Mutex<Option<Task>>,
    interruption: Mutex<Option<Status>>,
}

impl RunningState {
    fn new() -> Self {
        Self {
            execution: ExecutionId::next(),
            thread: std::thread::current().id(),
            task: Mutex::new(None),
            interruption: Mutex::new(None),
        }
    }

    pub fn execution(&self) -> ExecutionId {
        self.execution
    }

    /// Thread that entered the invocation.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Task in flight, if one is attached.
    pub fn task(&self) -> Option<Task> {
        self.task.lock().clone()
    }

    /// Attach (`Some`) or detach (`None`) the task in flight.
    pub(crate) fn set_task(&self, task: Option<Task>) {
        *self.task.lock() = task;
    }

    /// Terminal status requested by an interruption, if any.
    pub fn interruption(&self) -> Option<Status> {
        *self.interruption.lock()
    }

    /// Request interruption. The first request wins.
    pub(crate) fn interrupt(&self, status: Status) {
        self.interruption.lock().get_or_insert(status);
    }
}

/// Per-worker slot holding the current [`RunningState`].
#[derive(Debug, Default)]
pub struct RunningStateTracker {
    slot: Mutex<Option<Arc<RunningState>>>,
}

impl RunningStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<RunningState>> {
        self.slot.lock().clone()
    }

    /// Replace the slot with `new` if it still holds exactly `expected`.
    ///
    /// On mismatch the slot is untouched and its actual value is returned.
    pub fn compare_and_set(
        &self,
        expected: Option<&Arc<RunningState>>,
        new: Option<Arc<RunningState>>,
    ) -> Result<(), Option<Arc<RunningState>>> {
        let mut slot = self.slot.lock();
        let matches = match (slot.as_ref(), expected) {
            (None, None) => true,
            (Some(actual), Some(expected)) => Arc::ptr_eq(actual, expected),
            _ => false,
        };
        if matches {
            *slot = new;
            Ok(())
        } else {
            Err(slot.clone())
        }
    }

    /// Install a fresh state for `worker`. Cleared when the returned guard drops.
    pub fn enter<'a>(&'a self, worker: &'a WorkerIdentity) -> TrackedExecution<'a> {
        let state = Arc::new(RunningState::new());
        if let Err(stale) = self.compare_and_set(None, Some(Arc::clone(&state))) {
            warn!(
                worker.ordinal = worker.ordinal,
                stale.execution = ?stale.as_ref().map(|s| s.execution()),
                "worker running state was not cleared by the previous execution, overwriting it"
            );
            *self.slot.lock() = Some(Arc::clone(&state));
        }
        TrackedExecution {
            tracker: self,
            worker,
            state,
        }
    }
}

/// Active execution. Dropping it returns the tracker to idle.
pub struct TrackedExecution<'a> {
    tracker: &'a RunningStateTracker,
    worker: &'a WorkerIdentity,
    state: Arc<RunningState>,
}

impl TrackedExecution<'_> {
    pub fn state(&self) -> &RunningState {
        &self.state
    }
}

impl Drop for TrackedExecution<'_> {
    fn drop(&mut self) {
        if let Err(actual) = self.tracker.compare_and_set(Some(&self.state), None) {
            warn!(
                worker.ordinal = self.worker.ordinal,
                execution = %self.state.execution(),
                actual.execution = ?actual.as_ref().map(|s| s.execution()),
                "worker running state was replaced during execution, leaving it in place"
            );
        }
    }
}
