//! Task queue interface and an in-memory implementation.
//!
//! Persistence and locking belong to the queue. Workers only `peek` (claim)
//! the next eligible task and `remove` it with its terminal outcome.

use crate::error::{Error, Result};
use crate::model::{Status, Task, TaskError, TaskId, TaskResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Durable queue of pending tasks, as seen by workers.
pub trait TaskQueue: Send + Sync {
    /// Claim the next pending task for `worker_uuid`.
    ///
    /// Ordinary tasks are eligible when `include_ordinary` is set, indexation
    /// tasks when `include_indexation` is set. Returns `None` when nothing
    /// eligible is pending.
    fn peek(
        &self,
        worker_uuid: &str,
        include_ordinary: bool,
        include_indexation: bool,
    ) -> Result<Option<Task>>;

    /// Persist the terminal outcome of a claimed task and drop it from the queue.
    fn remove(
        &self,
        task: &Task,
        status: Status,
        result: Option<&TaskResult>,
        error: Option<&TaskError>,
    ) -> Result<()>;

    /// Return tasks claimed by workers outside `known_worker_uuids` to the
    /// pending queue. Returns how many were reset.
    fn reset_tasks_with_unknown_workers(&self, known_worker_uuids: &HashSet<String>) -> Result<usize> {
        let _ = known_worker_uuids;
        Ok(0)
    }
}

/// Finished task as recorded in the queue history.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub task: Task,
    pub status: Status,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub worker_uuid: String,
    pub executed_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    in_progress: HashMap<TaskId, (Task, String)>,
    history: Vec<ActivityRecord>,
}

/// FIFO queue held in memory. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the pending queue.
    pub fn submit(&self, task: Task) -> TaskId {
        let id = task.id.clone();
        debug!(task.id = %id, task_type = %task.task_type, "task submitted");
        self.state.lock().pending.push_back(task);
        id
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.state.lock().in_progress.len()
    }

    /// Worker currently holding the task, if it is in progress.
    pub fn claimed_by(&self, id: &TaskId) -> Option<String> {
        self.state
            .lock()
            .in_progress
            .get(id)
            .map(|(_, worker)| worker.clone())
    }

    /// Finished tasks, oldest first.
    pub fn history(&self) -> Vec<ActivityRecord> {
        self.state.lock().history.clone()
    }
}

impl TaskQueue for InMemoryQueue {
    fn peek(
        &self,
        worker_uuid: &str,
        include_ordinary: bool,
        include_indexation: bool,
    ) -> Result<Option<Task>> {
        let mut state = self.state.lock();
        let position = state.pending.iter().position(|task| {
            if task.is_indexation() {
                include_indexation
            } else {
                include_ordinary
            }
        });
        let Some(task) = position.and_then(|idx| state.pending.remove(idx)) else {
            return Ok(None);
        };
        state
            .in_progress
            .insert(task.id.clone(), (task.clone(), worker_uuid.to_string()));
        debug!(task.id = %task.id, worker.uuid = worker_uuid, "task claimed");
        Ok(Some(task))
    }

    fn remove(
        &self,
        task: &Task,
        status: Status,
        result: Option<&TaskResult>,
        error: Option<&TaskError>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let (task, worker_uuid) = state
            .in_progress
            .remove(&task.id)
            .ok_or_else(|| Error::Queue(format!("task {} is not in progress", task.id)))?;
        state.history.push(ActivityRecord {
            task,
            status,
            result: result.cloned(),
            error: error.cloned(),
            worker_uuid,
            executed_at: Utc::now(),
        });
        Ok(())
    }

    fn reset_tasks_with_unknown_workers(&self, known_worker_uuids: &HashSet<String>) -> Result<usize> {
        let mut state = self.state.lock();
        let stale: Vec<TaskId> = state
            .in_progress
            .iter()
            .filter(|(_, (_, worker))| !known_worker_uuids.contains(worker))
            .map(|(id, _)| id.clone())
            .collect();

        let mut reset: Vec<Task> = stale
            .iter()
            .filter_map(|id| state.in_progress.remove(id))
            .map(|(task, _)| task)
            .collect();
        // Oldest submission ends up first in line.
        reset.sort_by_key(|task| std::cmp::Reverse(task.submitted_at));
        let count = reset.len();
        for task in reset {
            state.pending.push_front(task);
        }

        if count > 0 {
            warn!(count, "reset tasks claimed by unknown workers");
        }
        Ok(count)
    }
}
