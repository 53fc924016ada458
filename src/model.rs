//! Core data model.
//!
//! A task is a unit of queued work with a declared type. A worker claims a
//! task, hands it to the processor registered for that type, and records a
//! terminal [`Status`] together with an optional result and error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Task type of the maintenance-class indexation tasks.
pub const ISSUE_SYNC_TYPE: &str = "ISSUE_SYNC";
/// Task type of analysis report processing.
pub const REPORT_TYPE: &str = "REPORT";

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Declared type, used to pick the processor.
    pub task_type: String,

    /// Component the task applies to (e.g. a branch).
    pub component: Option<Component>,

    /// Top-level component (e.g. the project).
    pub main_component: Option<Component>,

    /// Who submitted the task. None for system-submitted tasks.
    pub submitter: Option<Submitter>,

    /// Free-form characteristics declared at submission.
    pub characteristics: BTreeMap<String, String>,

    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            task_type: task_type.into(),
            component: None,
            main_component: None,
            submitter: None,
            characteristics: BTreeMap::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn component(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    pub fn main_component(mut self, component: Component) -> Self {
        self.main_component = Some(component);
        self
    }

    pub fn submitter(mut self, submitter: Submitter) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn characteristic(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.characteristics.insert(key.into(), value.into());
        self
    }

    /// Does this task belong to the indexation class?
    pub fn is_indexation(&self) -> bool {
        self.task_type == ISSUE_SYNC_TYPE
    }

    /// Key of the main component, if any.
    pub fn project_key(&self) -> Option<&str> {
        self.main_component.as_ref().and_then(|c| c.key.as_deref())
    }

    /// Submitter login, falling back to the submitter uuid.
    pub fn submitter_name(&self) -> Option<&str> {
        self.submitter
            .as_ref()
            .map(|s| s.login.as_deref().unwrap_or(&s.uuid))
    }
}

/// Newtype for task ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub uuid: String,
    pub key: Option<String>,
    pub name: Option<String>,
}

impl Component {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            key: None,
            name: None,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    pub uuid: String,
    pub login: Option<String>,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Terminal status of a processed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failed,
    Canceled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::Failed => "FAILED",
            Status::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Payload produced by a successful processor. Opaque to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub analysis_uuid: Option<String>,
    pub data: serde_json::Value,
}

impl TaskResult {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            analysis_uuid: None,
            data,
        }
    }

    pub fn analysis(mut self, uuid: impl Into<String>) -> Self {
        self.analysis_uuid = Some(uuid.into());
        self
    }
}

/// Classification of a recorded task error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Declared business or validation fault.
    Message,
    /// Task was interrupted and the interruption declared a failure.
    Interrupted,
    /// Anything else, including panics.
    Unexpected,
}

/// Error recorded against a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TaskError {}

/// Terminal outcome of one task execution. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: Status,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
}

impl TaskOutcome {
    pub fn success(result: Option<TaskResult>) -> Self {
        Self {
            status: Status::Success,
            result,
            error: None,
        }
    }

    pub fn failed(error: Option<TaskError>) -> Self {
        Self {
            status: Status::Failed,
            result: None,
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Identity of a worker within the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    /// 0-based rank within the pool.
    pub ordinal: usize,
    /// Stable identifier used for audit correlation.
    pub uuid: String,
}

impl WorkerIdentity {
    pub fn new(ordinal: usize, uuid: impl Into<String>) -> Self {
        Self {
            ordinal,
            uuid: uuid.into(),
        }
    }

    /// Identity with a freshly generated uuid.
    pub fn generate(ordinal: usize) -> Self {
        Self::new(ordinal, Uuid::new_v4().to_string())
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} (uuid={})", self.ordinal, self.uuid)
    }
}

/// What one worker cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerResult {
    /// The worker is disabled; the queue was not consulted.
    Disabled,
    /// No task was available.
    NoTask,
    /// A task was claimed and run to a terminal outcome.
    TaskProcessed,
}
