//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work handed to agents. Each task tracks
//! its status, dependencies, timing and either a result or an error.

use crate::core::artifact::Artifact;
use crate::core::role::Role;
use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier for a task, unique within one run.
///
/// Workflow steps derive ids from step names (`build`, `build.api`), so
/// ids are human-readable strings rather than UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status in its lifecycle.
///
/// Pending -> Ready -> Running -> Completed | Failed. A pending task can
/// also fail directly when a dependency fails or the run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, dependencies not yet satisfied.
    #[default]
    Pending,
    /// Every dependency completed; waiting for a concurrency slot.
    Ready,
    /// Dispatched to an agent.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Completed and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Output of a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskResult {
    /// Artifacts in order of appearance in the response.
    pub artifacts: Vec<Artifact>,
    /// The raw generated text.
    pub raw_text: String,
}

impl TaskResult {
    pub fn new(artifacts: Vec<Artifact>, raw_text: impl Into<String>) -> Self {
        Self {
            artifacts,
            raw_text: raw_text.into(),
        }
    }
}

/// Recorded failure of a task.
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

impl From<&Error> for TaskError {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A single schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the run.
    pub id: TaskId,
    /// Which specialized behaviour to invoke.
    pub role: Role,
    /// What the task should accomplish.
    pub description: String,
    /// Opaque key/value pairs merged into the prompt.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Tasks that must complete before this one becomes ready.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Dispatch priority; lower values go first.
    #[serde(default)]
    pub priority: i32,
    /// Workflow step that produced this task, if any.
    #[serde(default)]
    pub step: Option<String>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Present only when Completed.
    pub result: Option<TaskResult>,
    /// Present only when Failed.
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<TaskId>, role: Role, description: &str) -> Self {
        Self {
            id: id.into(),
            role,
            description: description.to_string(),
            context: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            priority: 0,
            step: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Add a dependency on another task.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_step(mut self, step: &str) -> Self {
        self.step = Some(step.to_string());
        self
    }

    /// Mark the task as ready for execution.
    pub fn mark_ready(&mut self) -> Result<()> {
        self.guard_open("mark ready")?;
        self.status = TaskStatus::Ready;
        Ok(())
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) -> Result<()> {
        self.guard_open("start")?;
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Store the result and transition to Completed.
    pub fn complete(&mut self, result: TaskResult) -> Result<()> {
        self.guard_open("complete")?;
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Store the error and transition to Failed.
    pub fn fail(&mut self, error: TaskError) -> Result<()> {
        self.guard_open("fail")?;
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Artifacts of a completed task; empty otherwise.
    pub fn artifacts(&self) -> &[Artifact] {
        self.result
            .as_ref()
            .map(|r| r.artifacts.as_slice())
            .unwrap_or(&[])
    }

    fn guard_open(&self, action: &str) -> Result<()> {
        if self.is_finished() {
            return Err(Error::Validation(format!(
                "cannot {} task {}: already {}",
                action, self.id, self.status
            )));
        }
        Ok(())
    }
}
