//! Task selection for one worker.
//!
//! Indexation tasks get a bounded number of looks at startup. The cursor
//! alternates between "everything" and "indexation only" peeks until one
//! cycle finds neither indexation nor ordinary work; from then on the
//! worker only asks for ordinary tasks.

use crate::error::Result;
use crate::model::Task;
use crate::queue::TaskQueue;
use tracing::info;

#[derive(Debug)]
pub struct TaskSelectionCursor {
    include_ordinary: bool,
    indexation_lookup_enabled: bool,
}

impl Default for TaskSelectionCursor {
    fn default() -> Self {
        Self {
            include_ordinary: false,
            indexation_lookup_enabled: true,
        }
    }
}

impl TaskSelectionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indexation_lookup_enabled(&self) -> bool {
        self.indexation_lookup_enabled
    }

    /// Peek the queue for the next task of `worker_uuid`.
    pub fn next_task(&mut self, queue: &dyn TaskQueue, worker_uuid: &str) -> Result<Option<Task>> {
        if !self.indexation_lookup_enabled {
            return queue.peek(worker_uuid, true, false);
        }

        self.include_ordinary = !self.include_ordinary;
        if let Some(task) = queue.peek(worker_uuid, self.include_ordinary, true)? {
            return Ok(Some(task));
        }
        if self.include_ordinary {
            return Ok(None);
        }

        let task = queue.peek(worker_uuid, true, false)?;
        if task.is_none() {
            self.indexation_lookup_enabled = false;
            info!(
                worker.uuid = worker_uuid,
                "worker found no pending task (including indexation task), disabling indexation task lookup for this worker until next restart"
            );
        }
        Ok(task)
    }
}
