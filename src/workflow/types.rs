//! Core workflow type definitions.

use crate::core::{Artifact, Role, Task, TaskId, TaskStatus};
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for a workflow run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Aggregated result of a step, used to pick outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutcome {
    #[default]
    Continue,
    Failed,
    NeedsReview,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepOutcome::Continue => write!(f, "continue"),
            StepOutcome::Failed => write!(f, "failed"),
            StepOutcome::NeedsReview => write!(f, "needs-review"),
        }
    }
}

impl std::str::FromStr for StepOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "continue" => Ok(StepOutcome::Continue),
            "failed" => Ok(StepOutcome::Failed),
            "needs-review" => Ok(StepOutcome::NeedsReview),
            other => Err(format!("unknown step outcome: {}", other)),
        }
    }
}

/// Incoming edge of a step.
///
/// In TOML either a bare step name or `{ step = "review", when = "needs-review" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predecessor {
    Step(String),
    Conditional { step: String, when: StepOutcome },
}

impl Predecessor {
    pub fn step(&self) -> &str {
        match self {
            Predecessor::Step(step) | Predecessor::Conditional { step, .. } => step,
        }
    }

    /// Outcome the edge is conditional on, if any.
    pub fn condition(&self) -> Option<StepOutcome> {
        match self {
            Predecessor::Step(_) => None,
            Predecessor::Conditional { when, .. } => Some(*when),
        }
    }
}

/// One named step of a workflow template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    pub role: Role,
    /// Task description; may contain `{{input}}` placeholders.
    pub description: String,
    /// Context template merged into the prompt.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub after: Vec<Predecessor>,
    /// Fan-out parts. Each part becomes its own task `<step>.<part>`.
    #[serde(default)]
    pub fan_out: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

impl StepTemplate {
    pub fn new(name: &str, role: Role, description: &str) -> Self {
        Self {
            name: name.to_string(),
            role,
            description: description.to_string(),
            context: BTreeMap::new(),
            after: Vec::new(),
            fan_out: Vec::new(),
            priority: 0,
        }
    }

    pub fn after(mut self, step: &str) -> Self {
        self.after.push(Predecessor::Step(step.to_string()));
        self
    }

    pub fn after_when(mut self, step: &str, when: StepOutcome) -> Self {
        self.after.push(Predecessor::Conditional {
            step: step.to_string(),
            when,
        });
        self
    }

    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    pub fn fan_out(mut self, parts: &[&str]) -> Self {
        self.fan_out = parts.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Ids of the tasks this step expands into, in fan-out order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        if self.fan_out.is_empty() {
            vec![TaskId::new(self.name.clone())]
        } else {
            self.fan_out
                .iter()
                .map(|part| TaskId::new(format!("{}.{}", self.name, part)))
                .collect()
        }
    }
}

/// Declarative workflow description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    #[serde(default, rename = "step")]
    pub steps: Vec<StepTemplate>,
}

impl WorkflowTemplate {
    pub fn new(id: &str, steps: Vec<StepTemplate>) -> Self {
        Self {
            id: id.to_string(),
            steps,
        }
    }

    /// Parse a template from TOML (`[[step]]` tables).
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Status of a workflow run in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    /// Interrupted by the run-level cancellation signal; resumable.
    Cancelled,
}

impl RunStatus {
    /// Completed and Failed runs are never driven again.
    pub fn is_final(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failure recorded against a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub step: String,
    /// Failing task, or `None` when the step as a whole reported failure.
    pub task_id: Option<TaskId>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One execution of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub template_id: String,
    pub steps: Vec<StepTemplate>,
    /// Values substituted into `{{name}}` placeholders.
    pub inputs: BTreeMap<String, String>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub completed_steps: BTreeSet<String>,
    /// Steps none of whose incoming edges was taken.
    #[serde(default)]
    pub skipped_steps: BTreeSet<String>,
    #[serde(default)]
    pub step_outcomes: BTreeMap<String, StepOutcome>,
    /// Steps presently executing; several when branches run side by side.
    #[serde(default)]
    pub current_step: Vec<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<RunError>,
    /// Non-fatal problems such as failed checkpoint writes.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl WorkflowRun {
    pub fn new(template: &WorkflowTemplate, inputs: BTreeMap<String, String>) -> Self {
        Self {
            id: RunId::new(),
            template_id: template.id.clone(),
            steps: template.steps.clone(),
            inputs,
            tasks: BTreeMap::new(),
            completed_steps: BTreeSet::new(),
            skipped_steps: BTreeSet::new(),
            step_outcomes: BTreeMap::new(),
            current_step: Vec::new(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Whether the step has completed or was skipped.
    pub fn is_settled(&self, step: &str) -> bool {
        self.completed_steps.contains(step) || self.skipped_steps.contains(step)
    }

    /// Tasks belonging to `step`, in fan-out order.
    pub fn step_tasks(&self, step: &StepTemplate) -> Vec<&Task> {
        step.task_ids()
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    /// Artifacts of every completed task, in step order.
    pub fn artifacts(&self) -> Vec<&Artifact> {
        self.steps
            .iter()
            .flat_map(|step| self.step_tasks(step))
            .flat_map(|task| task.artifacts())
            .collect()
    }

    /// Artifacts produced by the tasks of `step`.
    pub fn step_artifacts(&self, step: &StepTemplate) -> Vec<Artifact> {
        self.step_tasks(step)
            .into_iter()
            .flat_map(|task| task.artifacts().iter().cloned())
            .collect()
    }

    pub fn all_tasks_completed(&self) -> bool {
        self.tasks.values().all(|t| t.status == TaskStatus::Completed)
    }
}
