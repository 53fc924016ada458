//! Pool-level control of workers: which are enabled and which are busy.

use crate::config::CeConfiguration;
use crate::model::WorkerIdentity;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub trait WorkerController: Send + Sync {
    /// Should this worker look for tasks right now?
    fn is_enabled(&self, worker: &WorkerIdentity) -> bool;

    /// Record that `worker` started processing a task. Released when the guard drops.
    fn register_processing(&self, worker: &WorkerIdentity) -> ProcessingGuard;
}

/// Scoped registration of an in-flight task.
#[must_use = "processing is unregistered as soon as the guard is dropped"]
pub struct ProcessingGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ProcessingGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Guard with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Enables the first `worker_count()` workers and tracks the busy ones.
pub struct CeWorkerController {
    configuration: Arc<CeConfiguration>,
    processing: Arc<Mutex<HashSet<WorkerIdentity>>>,
}

impl CeWorkerController {
    pub fn new(configuration: Arc<CeConfiguration>) -> Self {
        Self {
            configuration,
            processing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn has_at_least_one_processing_worker(&self) -> bool {
        !self.processing.lock().is_empty()
    }

    /// Workers with a task in flight, by ordinal.
    pub fn processing_workers(&self) -> Vec<WorkerIdentity> {
        let mut workers: Vec<WorkerIdentity> = self.processing.lock().iter().cloned().collect();
        workers.sort_by_key(|w| w.ordinal);
        workers
    }
}

impl WorkerController for CeWorkerController {
    fn is_enabled(&self, worker: &WorkerIdentity) -> bool {
        worker.ordinal < self.configuration.worker_count()
    }

    fn register_processing(&self, worker: &WorkerIdentity) -> ProcessingGuard {
        self.processing.lock().insert(worker.clone());
        let processing = Arc::clone(&self.processing);
        let worker = worker.clone();
        ProcessingGuard::new(move || {
            processing.lock().remove(&worker);
        })
    }
}
