use compute_engine::error::{Error, Result};
use compute_engine::listener::{ExecutionListener, Listeners};
use compute_engine::model::{
    ErrorKind, ISSUE_SYNC_TYPE, REPORT_TYPE, Status, Task, TaskError, TaskResult, WorkerIdentity,
    WorkerResult,
};
use compute_engine::processor::{ProcessError, TaskContext, TaskProcessor, TaskProcessorRepository};
use compute_engine::queue::{InMemoryQueue, TaskQueue};
use compute_engine::telemetry::Profiler;
use compute_engine::worker::{ProcessingGuard, Worker, WorkerController};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt as _;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// In-memory queue that records peeks and can be told to fail.
#[derive(Default)]
struct FakeQueue {
    inner: InMemoryQueue,
    peeks: Mutex<Vec<(bool, bool)>>,
    removes: AtomicUsize,
    fail_peek: AtomicBool,
    fail_remove: AtomicBool,
    panic_remove: AtomicBool,
}

impl FakeQueue {
    fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Arc<Self> {
        let queue = Self::default();
        for task in tasks {
            queue.inner.submit(task);
        }
        Arc::new(queue)
    }

    fn peeks(&self) -> Vec<(bool, bool)> {
        self.peeks.lock().clone()
    }
}

impl TaskQueue for FakeQueue {
    fn peek(&self, worker_uuid: &str, ordinary: bool, indexation: bool) -> Result<Option<Task>> {
        self.peeks.lock().push((ordinary, indexation));
        if self.fail_peek.load(Ordering::SeqCst) {
            return Err(Error::Queue("database unavailable".into()));
        }
        self.inner.peek(worker_uuid, ordinary, indexation)
    }

    fn remove(
        &self,
        task: &Task,
        status: Status,
        result: Option<&TaskResult>,
        error: Option<&TaskError>,
    ) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.panic_remove.load(Ordering::SeqCst) {
            panic!("queue storage exploded");
        }
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Error::Queue("cannot persist activity".into()));
        }
        self.inner.remove(task, status, result, error)
    }
}

struct FakeController {
    enabled: AtomicBool,
    processing: Arc<AtomicUsize>,
    registrations: AtomicUsize,
}

impl FakeController {
    fn enabled(enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(enabled),
            processing: Arc::new(AtomicUsize::new(0)),
            registrations: AtomicUsize::new(0),
        })
    }
}

impl WorkerController for FakeController {
    fn is_enabled(&self, _worker: &WorkerIdentity) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn register_processing(&self, _worker: &WorkerIdentity) -> ProcessingGuard {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.processing.fetch_add(1, Ordering::SeqCst);
        let processing = Arc::clone(&self.processing);
        ProcessingGuard::new(move || {
            processing.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

type ProcessFn =
    dyn Fn(&Task, &TaskContext<'_>) -> std::result::Result<Option<TaskResult>, ProcessError>
        + Send
        + Sync;

struct FnProcessor {
    types: Vec<&'static str>,
    process: Box<ProcessFn>,
}

impl FnProcessor {
    fn new(
        types: &[&'static str],
        process: impl Fn(&Task, &TaskContext<'_>) -> std::result::Result<Option<TaskResult>, ProcessError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            types: types.to_vec(),
            process: Box::new(process),
        })
    }
}

impl TaskProcessor for FnProcessor {
    fn handled_types(&self) -> &[&str] {
        &self.types
    }

    fn process(
        &self,
        task: &Task,
        ctx: &TaskContext<'_>,
    ) -> std::result::Result<Option<TaskResult>, ProcessError> {
        (self.process)(task, ctx)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Behaviour {
    Record,
    Fail,
    Panic,
}

/// Listener that records `start:<id>` / `end:<id>:<status>` events.
struct RecordingListener {
    behaviour: Behaviour,
    events: Mutex<Vec<String>>,
    ended: Mutex<Vec<(Status, Option<TaskError>)>>,
}

impl RecordingListener {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            events: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl ExecutionListener for RecordingListener {
    fn on_start(&self, task: &Task) -> anyhow::Result<()> {
        self.events.lock().push(format!("start:{}", task.id));
        match self.behaviour {
            Behaviour::Record => Ok(()),
            Behaviour::Fail => anyhow::bail!("listener refused start"),
            Behaviour::Panic => panic!("listener crashed on start"),
        }
    }

    fn on_end(
        &self,
        task: &Task,
        status: Status,
        _duration: Duration,
        _result: Option<&TaskResult>,
        error: Option<&TaskError>,
    ) -> anyhow::Result<()> {
        self.events.lock().push(format!("end:{}:{status}", task.id));
        self.ended.lock().push((status, error.cloned()));
        match self.behaviour {
            Behaviour::Record => Ok(()),
            Behaviour::Fail => anyhow::bail!("listener refused end"),
            Behaviour::Panic => panic!("listener crashed on end"),
        }
    }
}

/// Collects the message of every tracing event emitted while installed.
#[derive(Clone, Default)]
struct CapturedEvents(Arc<Mutex<Vec<String>>>);

impl CapturedEvents {
    fn during<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    fn starting_with(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|m| m.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedEvents {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut message = MessageVisitor(String::new());
        event.record(&mut message);
        self.0.lock().push(message.0);
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

struct Harness {
    queue: Arc<FakeQueue>,
    controller: Arc<FakeController>,
    worker: Arc<Worker>,
}

fn harness(
    queue: Arc<FakeQueue>,
    processors: Vec<Arc<dyn TaskProcessor>>,
    listeners: Vec<Arc<dyn ExecutionListener>>,
) -> Harness {
    let mut repository = TaskProcessorRepository::new();
    for processor in processors {
        repository.register(processor).unwrap();
    }
    let controller = FakeController::enabled(true);
    let worker = Arc::new(Worker::new(
        WorkerIdentity::new(0, "worker-0"),
        queue.clone(),
        Arc::new(repository),
        controller.clone(),
        Listeners::new(listeners),
        Profiler::default(),
    ));
    Harness {
        queue,
        controller,
        worker,
    }
}

fn report(id: &str) -> Task {
    Task::new(REPORT_TYPE).with_id(id)
}

fn succeeding() -> Arc<dyn TaskProcessor> {
    FnProcessor::new(&[REPORT_TYPE], |task, _| {
        Ok(Some(TaskResult::new(serde_json::json!({ "id": task.id.as_str() })).analysis("A1")))
    })
}

// ---------------------------------------------------------------------------
// Gate and selection
// ---------------------------------------------------------------------------

#[test]
fn disabled_worker_never_touches_the_queue() {
    let queue = FakeQueue::with_tasks([report("T1")]);
    let h = harness(queue, vec![succeeding()], vec![]);
    h.controller.enabled.store(false, Ordering::SeqCst);

    for _ in 0..3 {
        assert_eq!(h.worker.run_once(), WorkerResult::Disabled);
    }
    assert!(h.queue.peeks().is_empty());
    assert_eq!(h.queue.inner.pending_count(), 1);
    assert_eq!(h.controller.registrations.load(Ordering::SeqCst), 0);
    assert!(h.worker.current_execution().is_none());
}

#[test_log::test]
fn empty_queue_latches_to_ordinary_only_peeks() {
    let h = harness(Arc::new(FakeQueue::default()), vec![succeeding()], vec![]);

    for _ in 0..5 {
        assert_eq!(h.worker.run_once(), WorkerResult::NoTask);
    }
    assert_eq!(
        h.queue.peeks(),
        vec![
            (true, true),
            (false, true),
            (true, false),
            (true, false),
            (true, false),
            (true, false),
        ]
    );
}

#[test]
fn indexation_tasks_are_picked_before_latching() {
    let indexation = Task::new(ISSUE_SYNC_TYPE).with_id("IDX");
    let queue = FakeQueue::with_tasks([indexation]);
    let processor = FnProcessor::new(&[ISSUE_SYNC_TYPE], |_, _| Ok(None));
    let h = harness(queue, vec![processor], vec![]);

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);
    let history = h.queue.inner.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].task.id.as_str(), "IDX");
    assert_eq!(history[0].status, Status::Success);
    assert_eq!(history[0].worker_uuid, "worker-0");
}

#[test_log::test]
fn peek_fault_is_treated_as_no_task() {
    let h = harness(FakeQueue::with_tasks([report("T1")]), vec![succeeding()], vec![]);
    h.queue.fail_peek.store(true, Ordering::SeqCst);
    assert_eq!(h.worker.run_once(), WorkerResult::NoTask);

    h.queue.fail_peek.store(false, Ordering::SeqCst);
    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);
    assert_eq!(h.queue.inner.history().len(), 1);
}

// ---------------------------------------------------------------------------
// Outcome classification
// ---------------------------------------------------------------------------

#[test]
fn successful_task_is_recorded_with_its_result() {
    let listener = RecordingListener::new(Behaviour::Record);
    let h = harness(
        FakeQueue::with_tasks([report("T1")]),
        vec![succeeding()],
        vec![listener.clone()],
    );

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);

    let history = h.queue.inner.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Status::Success);
    let result = history[0].result.as_ref().unwrap();
    assert_eq!(result.analysis_uuid.as_deref(), Some("A1"));
    assert_eq!(result.data["id"], "T1");
    assert!(history[0].error.is_none());

    assert_eq!(listener.events(), vec!["start:T1", "end:T1:SUCCESS"]);
    assert_eq!(h.controller.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.processing.load(Ordering::SeqCst), 0);
    assert!(h.worker.current_task().is_none());
    assert!(h.worker.current_execution().is_none());
}

#[test]
fn business_fault_fails_the_task_with_its_message() {
    let processor = FnProcessor::new(&[REPORT_TYPE], |_, _| {
        Err(ProcessError::message("project has no branch named main"))
    });
    let h = harness(FakeQueue::with_tasks([report("T1")]), vec![processor], vec![]);

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);

    let record = &h.queue.inner.history()[0];
    assert_eq!(record.status, Status::Failed);
    assert_eq!(
        record.error,
        Some(TaskError::new(ErrorKind::Message, "project has no branch named main"))
    );
}

#[test]
fn interruption_uses_the_declared_status() {
    let processor = FnProcessor::new(&[REPORT_TYPE], |task, _| {
        let status = if task.id.as_str() == "cancel" {
            Status::Canceled
        } else {
            Status::Failed
        };
        Err(ProcessError::interrupted(status, "stopped by operator"))
    });
    let h = harness(
        FakeQueue::with_tasks([report("cancel"), report("fail")]),
        vec![processor],
        vec![],
    );

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);
    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);

    let history = h.queue.inner.history();
    assert_eq!(history[0].status, Status::Canceled);
    assert!(history[0].error.is_none());
    assert_eq!(history[1].status, Status::Failed);
    assert_eq!(
        history[1].error,
        Some(TaskError::new(ErrorKind::Interrupted, "stopped by operator"))
    );
}

fn sync_issues(status: Status) -> anyhow::Result<()> {
    Err(ProcessError::interrupted(status, "stopped by operator").into())
}

#[test]
fn interruption_wrapped_in_anyhow_keeps_the_declared_status() {
    use anyhow::Context as _;

    let processor = FnProcessor::new(&[REPORT_TYPE], |task, _| {
        if task.id.as_str() == "cancel" {
            sync_issues(Status::Canceled)?;
        } else {
            sync_issues(Status::Failed).context("syncing issues")?;
        }
        Ok(None)
    });
    let h = harness(
        FakeQueue::with_tasks([report("cancel"), report("fail")]),
        vec![processor],
        vec![],
    );

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);
    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);

    let history = h.queue.inner.history();
    assert_eq!(history[0].status, Status::Canceled);
    assert!(history[0].error.is_none());
    assert_eq!(history[1].status, Status::Failed);
    assert_eq!(
        history[1].error,
        Some(TaskError::new(ErrorKind::Interrupted, "stopped by operator"))
    );
}

#[test_log::test]
fn unexpected_fault_fails_the_task_and_the_worker_keeps_going() {
    let processor = FnProcessor::new(&[REPORT_TYPE], |task, _| {
        if task.id.as_str() == "T1" {
            Err(anyhow::anyhow!("index out of bounds").context("parsing report").into())
        } else {
            Ok(None)
        }
    });
    let h = harness(
        FakeQueue::with_tasks([report("T1"), report("T2")]),
        vec![processor],
        vec![],
    );

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);
    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);

    let history = h.queue.inner.history();
    assert_eq!(history[0].status, Status::Failed);
    let error = history[0].error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Unexpected);
    assert_eq!(error.message, "parsing report: index out of bounds");
    assert_eq!(history[1].status, Status::Success);
}

#[test_log::test]
fn processor_panic_is_recorded_as_unexpected_failure() {
    let processor = FnProcessor::new(&[REPORT_TYPE], |_, _| panic!("processor bug"));
    let h = harness(FakeQueue::with_tasks([report("T1")]), vec![processor], vec![]);

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);

    let record = &h.queue.inner.history()[0];
    assert_eq!(record.status, Status::Failed);
    let error = record.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Unexpected);
    assert!(error.message.contains("processor bug"));
    assert!(h.worker.current_execution().is_none());
}

#[test_log::test]
fn missing_processor_fails_the_task_without_error() {
    let listener = RecordingListener::new(Behaviour::Record);
    let h = harness(
        FakeQueue::with_tasks([Task::new("UNKNOWN").with_id("T1")]),
        vec![succeeding()],
        vec![listener.clone()],
    );

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);

    let record = &h.queue.inner.history()[0];
    assert_eq!(record.status, Status::Failed);
    assert!(record.error.is_none());
    assert_eq!(listener.events(), vec!["start:T1", "end:T1:FAILED"]);
}

// ---------------------------------------------------------------------------
// Finalization and listeners
// ---------------------------------------------------------------------------

#[test]
fn finalize_error_still_stops_the_profile_and_notifies_end_listeners_once() {
    let listener = RecordingListener::new(Behaviour::Record);
    let processor = FnProcessor::new(&[REPORT_TYPE], |_, _| Err(ProcessError::message("bad report")));
    let h = harness(
        FakeQueue::with_tasks([report("T1")]),
        vec![processor],
        vec![listener.clone()],
    );
    h.queue.fail_remove.store(true, Ordering::SeqCst);

    let events = CapturedEvents::default();
    assert_eq!(events.during(|| h.worker.run_once()), WorkerResult::TaskProcessed);

    assert_eq!(events.starting_with("failed to finalize task").len(), 1);
    let executed = events.starting_with("Executed task");
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("id=T1"));
    assert!(executed[0].contains("status=FAILED"));

    assert_eq!(h.queue.removes.load(Ordering::SeqCst), 1);
    assert_eq!(listener.events(), vec!["start:T1", "end:T1:FAILED"]);
    let ended = listener.ended.lock().clone();
    assert_eq!(
        ended,
        vec![(Status::Failed, Some(TaskError::new(ErrorKind::Message, "bad report")))]
    );
    assert!(h.worker.current_execution().is_none());
}

#[test]
fn finalize_panic_still_stops_the_profile_and_notifies_end_listeners_once() {
    let listener = RecordingListener::new(Behaviour::Record);
    let h = harness(
        FakeQueue::with_tasks([report("T1"), report("T2")]),
        vec![succeeding()],
        vec![listener.clone()],
    );
    h.queue.panic_remove.store(true, Ordering::SeqCst);

    let events = CapturedEvents::default();
    assert_eq!(events.during(|| h.worker.run_once()), WorkerResult::TaskProcessed);
    let executed = events.starting_with("Executed task");
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("status=SUCCESS"));
    assert_eq!(listener.events(), vec!["start:T1", "end:T1:SUCCESS"]);

    h.queue.panic_remove.store(false, Ordering::SeqCst);
    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);
    assert_eq!(h.queue.inner.history().len(), 1);
}

#[test]
fn listeners_report_their_size() {
    assert!(Listeners::default().is_empty());
    let listener: Arc<dyn ExecutionListener> = RecordingListener::new(Behaviour::Record);
    let listeners = Listeners::new(vec![listener]);
    assert_eq!(listeners.len(), 1);
    assert!(!listeners.is_empty());
}

#[test_log::test]
fn listener_faults_are_isolated() {
    let failing = RecordingListener::new(Behaviour::Fail);
    let panicking = RecordingListener::new(Behaviour::Panic);
    let recording = RecordingListener::new(Behaviour::Record);
    let h = harness(
        FakeQueue::with_tasks([report("T1")]),
        vec![succeeding()],
        vec![failing.clone(), panicking.clone(), recording.clone()],
    );

    assert_eq!(h.worker.run_once(), WorkerResult::TaskProcessed);

    for listener in [&failing, &panicking, &recording] {
        assert_eq!(listener.events(), vec!["start:T1", "end:T1:SUCCESS"]);
    }
    assert_eq!(h.queue.inner.history()[0].status, Status::Success);
}

// ---------------------------------------------------------------------------
// Introspection and interruption
// ---------------------------------------------------------------------------

#[test]
fn running_task_is_visible_and_can_be_interrupted() {
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let processor = FnProcessor::new(&[REPORT_TYPE], move |_, ctx| {
        let _ = started_tx.lock().send(());
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            ctx.check_interrupted()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(None)
    });
    let h = harness(FakeQueue::with_tasks([report("T1")]), vec![processor], vec![]);

    let worker = Arc::clone(&h.worker);
    let runner = std::thread::spawn(move || worker.run_once());

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(h.worker.current_task().unwrap().id.as_str(), "T1");
    let execution = h.worker.current_execution().unwrap();
    assert!(h.worker.is_executed_by(execution));
    assert_eq!(h.controller.processing.load(Ordering::SeqCst), 1);

    assert!(h.worker.interrupt(execution, Status::Canceled));
    assert_eq!(runner.join().unwrap(), WorkerResult::TaskProcessed);

    assert!(!h.worker.is_executed_by(execution));
    assert!(!h.worker.interrupt(execution, Status::Canceled));
    let record = &h.queue.inner.history()[0];
    assert_eq!(record.status, Status::Canceled);
    assert!(record.error.is_none());
    assert_eq!(h.controller.processing.load(Ordering::SeqCst), 0);
}

#[test]
fn each_cycle_gets_a_fresh_execution() {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let processor = FnProcessor::new(&[REPORT_TYPE], move |_, ctx| {
        let _ = tx.lock().send((ctx.execution(), ctx.is_interrupted()));
        Ok(None)
    });
    let h = harness(
        FakeQueue::with_tasks([report("T1"), report("T2")]),
        vec![processor],
        vec![],
    );

    h.worker.run_once();
    h.worker.run_once();
    let seen: Vec<_> = rx.try_iter().collect();
    assert_eq!(seen.len(), 2);
    let (first, second) = (seen[0], seen[1]);
    assert_ne!(first.0, second.0);
    assert!(!first.1 && !second.1);
    assert!(!h.worker.is_executed_by(first.0));
    assert!(!h.worker.is_executed_by(second.0));
}
