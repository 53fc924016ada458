use compute_engine::error::Error;
use compute_engine::model::{ISSUE_SYNC_TYPE, REPORT_TYPE, Task, TaskResult};
use compute_engine::processor::{
    ProcessError, ProcessorRegistry, TaskContext, TaskProcessor, TaskProcessorRepository,
};
use std::sync::Arc;

struct Named(&'static [&'static str]);

impl TaskProcessor for Named {
    fn handled_types(&self) -> &[&str] {
        self.0
    }

    fn process(&self, _task: &Task, _ctx: &TaskContext<'_>) -> Result<Option<TaskResult>, ProcessError> {
        Ok(None)
    }
}

#[test]
fn processors_resolve_by_task_type() {
    let repository = TaskProcessorRepository::new()
        .with(Arc::new(Named(&[REPORT_TYPE, "AUDIT"])))
        .unwrap()
        .with(Arc::new(Named(&[ISSUE_SYNC_TYPE])))
        .unwrap();

    assert_eq!(repository.task_types(), vec!["AUDIT", ISSUE_SYNC_TYPE, REPORT_TYPE]);
    let report = repository.resolve(&Task::new(REPORT_TYPE)).unwrap();
    assert_eq!(report.handled_types(), &[REPORT_TYPE, "AUDIT"]);
    assert!(repository.resolve(&Task::new("UNKNOWN")).is_none());
}

#[test]
fn duplicate_task_type_is_rejected_atomically() {
    let mut repository = TaskProcessorRepository::new();
    repository.register(Arc::new(Named(&[REPORT_TYPE]))).unwrap();

    let err = repository
        .register(Arc::new(Named(&["AUDIT", REPORT_TYPE])))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateProcessor(ref t) if t == REPORT_TYPE));
    assert_eq!(repository.task_types(), vec![REPORT_TYPE]);
}

#[test]
fn process_error_messages() {
    assert_eq!(ProcessError::message("no branch").to_string(), "no branch");
    let interrupted = ProcessError::interrupted(compute_engine::model::Status::Canceled, "operator");
    assert_eq!(
        interrupted.to_string(),
        "task interrupted with status CANCELED: operator"
    );
}
