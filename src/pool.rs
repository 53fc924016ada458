//! Worker pool: one dedicated thread per worker plus a stale-task cleaner.
//!
//! The pool builds `worker_max_count()` workers up front. Which of them
//! actually poll the queue is decided on every cycle by the
//! [`CeWorkerController`], so resizing needs no restart.

use crate::config::CeConfiguration;
use crate::error::Result;
use crate::listener::Listeners;
use crate::model::{Status, TaskId, WorkerIdentity, WorkerResult};
use crate::processor::ProcessorRegistry;
use crate::queue::TaskQueue;
use crate::telemetry::Profiler;
use crate::worker::{CeWorkerController, Worker, WorkerController};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shutdown flag that sleeping threads can wait on.
#[derive(Default)]
struct Shutdown {
    requested: Mutex<bool>,
    wakeup: Condvar,
}

impl Shutdown {
    fn trigger(&self) {
        *self.requested.lock() = true;
        self.wakeup.notify_all();
    }

    fn is_requested(&self) -> bool {
        *self.requested.lock()
    }

    /// Sleep up to `timeout`. Returns true if shutdown was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.requested.lock();
        while !*requested {
            if self.wakeup.wait_until(&mut requested, deadline).timed_out() {
                break;
            }
        }
        *requested
    }
}

pub struct WorkerPool {
    configuration: Arc<CeConfiguration>,
    controller: Arc<CeWorkerController>,
    workers: Vec<Arc<Worker>>,
    shutdown: Arc<Shutdown>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Build the workers and start their threads.
    pub fn start(
        configuration: Arc<CeConfiguration>,
        queue: Arc<dyn TaskQueue>,
        processors: Arc<dyn ProcessorRegistry>,
        listeners: Listeners,
        profiler: Profiler,
    ) -> Result<Self> {
        let listener_count = listeners.len();
        let controller = Arc::new(CeWorkerController::new(Arc::clone(&configuration)));
        let workers: Vec<Arc<Worker>> = (0..configuration.worker_max_count())
            .map(|ordinal| {
                Arc::new(Worker::new(
                    WorkerIdentity::generate(ordinal),
                    Arc::clone(&queue),
                    Arc::clone(&processors),
                    Arc::clone(&controller) as Arc<dyn WorkerController>,
                    listeners.clone(),
                    profiler.clone(),
                ))
            })
            .collect();

        let mut pool = Self {
            configuration,
            controller,
            workers,
            shutdown: Arc::new(Shutdown::default()),
            threads: Vec::new(),
        };
        if let Err(e) = pool.spawn_threads(queue) {
            pool.shutdown.trigger();
            return Err(e);
        }
        info!(
            workers = pool.workers.len(),
            enabled = pool.configuration.worker_count(),
            listeners = listener_count,
            "compute engine worker pool started"
        );
        Ok(pool)
    }

    fn spawn_threads(&mut self, queue: Arc<dyn TaskQueue>) -> Result<()> {
        let polling_delay = self.configuration.queue_polling_delay();
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let shutdown = Arc::clone(&self.shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("ce-worker-{}", worker.ordinal()))
                .spawn(move || {
                    while !shutdown.is_requested() {
                        match worker.run_once() {
                            WorkerResult::TaskProcessed => {}
                            WorkerResult::Disabled | WorkerResult::NoTask => {
                                if shutdown.wait(polling_delay) {
                                    break;
                                }
                            }
                        }
                    }
                })?;
            self.threads.push(handle);
        }

        let known: HashSet<String> = self.worker_uuids();
        let initial_delay = self.configuration.clean_tasks_initial_delay();
        let delay = self.configuration.clean_tasks_delay();
        let shutdown = Arc::clone(&self.shutdown);
        let handle = std::thread::Builder::new()
            .name("ce-cleaner".to_string())
            .spawn(move || {
                if shutdown.wait(initial_delay) {
                    return;
                }
                loop {
                    if let Err(e) = queue.reset_tasks_with_unknown_workers(&known) {
                        error!(error = %e, "failed to reset tasks of unknown workers");
                    }
                    if shutdown.wait(delay) {
                        return;
                    }
                }
            })?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn controller(&self) -> &CeWorkerController {
        &self.controller
    }

    pub fn worker_uuids(&self) -> HashSet<String> {
        self.workers.iter().map(|w| w.uuid().to_string()).collect()
    }

    /// Signal the worker running `task_id`. Returns false if no worker holds it.
    pub fn interrupt_task(&self, task_id: &TaskId, status: Status) -> bool {
        for worker in &self.workers {
            let Some(execution) = worker.current_execution() else {
                continue;
            };
            let holds_task = worker
                .current_task()
                .is_some_and(|task| &task.id == task_id);
            if holds_task && worker.interrupt(execution, status) {
                info!(task.id = %task_id, %status, worker.ordinal = worker.ordinal(), "task interruption requested");
                return true;
            }
        }
        false
    }

    /// Stop polling and wait up to `timeout` for in-flight cycles.
    ///
    /// Returns true if every thread ended in time. Threads still running
    /// after the timeout are left detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.shutdown.trigger();
        let deadline = Instant::now() + timeout;
        while self.threads.iter().any(|t| !t.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        let mut all_finished = true;
        for handle in std::mem::take(&mut self.threads) {
            if !handle.is_finished() {
                all_finished = false;
                continue;
            }
            if handle.join().is_err() {
                error!("worker pool thread panicked");
            }
        }
        if all_finished {
            info!("compute engine worker pool stopped");
        } else {
            warn!(
                processing = ?self.controller.processing_workers(),
                "graceful stop timed out with tasks still in progress"
            );
        }
        all_finished
    }

    /// [`stop`](Self::stop) with the configured graceful stop timeout.
    pub fn stop_gracefully(&mut self) -> bool {
        let timeout = self.configuration.graceful_stop_timeout();
        self.stop(timeout)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
