//! Workflow engine: the live loop, resume and cancellation.
//!
//! Every ready step gets its own [`Scheduler`]; all of them draw from one
//! run-wide pool of task slots. Whenever a step finishes the engine records
//! its outcome, commits a checkpoint and launches the steps that became
//! ready, while other steps keep running. The loop ends once nothing is
//! running and nothing more can start.

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::graph::StepGraph;
use super::types::{RunError, RunId, RunStatus, StepOutcome, StepTemplate, WorkflowRun, WorkflowTemplate};
use crate::core::{Artifact, Task, TaskStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::orchestration::{Scheduler, SchedulerConfig, SchedulerOutcome, TaskRunner, DEFAULT_MAX_CONCURRENCY};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `{{name}}` placeholder in a description or context template.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").unwrap());

/// `OUTCOME: needs-review` / `Verdict: continue` line in a response.
static OUTCOME_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*\**(?:outcome|verdict)\**\s*:\s*\**([a-z_-]+)\**\s*$").unwrap());

/// Replace `{{name}}` placeholders from `vars`; unknown names stay verbatim.
pub fn render_template(text: &str, vars: &BTreeMap<String, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Engine settings (`[engine]` in the config file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrently running tasks per run.
    pub max_concurrency: usize,
    pub fail_fast: bool,
    /// Where the file checkpoint store lives; `~` is expanded.
    pub checkpoint_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            fail_fast: true,
            checkpoint_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: self.max_concurrency,
            fail_fast: self.fail_fast,
        }
    }
}

/// Aggregates a finished step's tasks into the outcome that selects edges.
pub trait OutcomeEvaluator: Send + Sync {
    fn evaluate(&self, step: &StepTemplate, tasks: &[&Task]) -> StepOutcome;
}

impl<F> OutcomeEvaluator for F
where
    F: Fn(&StepTemplate, &[&Task]) -> StepOutcome + Send + Sync,
{
    fn evaluate(&self, step: &StepTemplate, tasks: &[&Task]) -> StepOutcome {
        self(step, tasks)
    }
}

/// `Failed` if any task failed. Otherwise the last `OUTCOME: <label>` line
/// found in the tasks' raw responses, defaulting to `Continue`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvaluator;

impl OutcomeEvaluator for DefaultEvaluator {
    fn evaluate(&self, _step: &StepTemplate, tasks: &[&Task]) -> StepOutcome {
        if tasks.iter().any(|t| t.status != TaskStatus::Completed) {
            return StepOutcome::Failed;
        }
        tasks
            .iter()
            .filter_map(|t| t.result.as_ref())
            .flat_map(|r| OUTCOME_LINE_RE.captures_iter(&r.raw_text))
            .filter_map(|caps| caps[1].parse::<StepOutcome>().ok())
            .last()
            .unwrap_or_default()
    }
}

/// Progress notifications from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    RunStarted { run_id: RunId },
    StepStarted { run_id: RunId, step: String, tasks: usize },
    StepCompleted { run_id: RunId, step: String, outcome: StepOutcome },
    StepSkipped { run_id: RunId, step: String },
    CheckpointSaved { run_id: RunId },
    RunFinished { run_id: RunId, status: RunStatus },
}

/// Drives workflow runs.
///
/// The engine's cancellation token is the run-level signal: cancelling it
/// stops new steps and new tasks, lets in-flight calls wind down and leaves
/// the run `Cancelled` and resumable.
pub struct WorkflowEngine {
    config: EngineConfig,
    runner: Arc<dyn TaskRunner>,
    store: Arc<dyn CheckpointStore>,
    evaluator: Arc<dyn OutcomeEvaluator>,
    events: Option<mpsc::UnboundedSender<WorkflowEvent>>,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    /// Create a new engine.
    ///
    /// # Arguments
    ///
    /// * `config` - Concurrency limit and fail-fast policy
    /// * `runner` - Executes individual tasks, normally an `AgentExecutor`
    /// * `store` - Where checkpoints are committed
    pub fn new(config: EngineConfig, runner: Arc<dyn TaskRunner>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            config,
            runner,
            store,
            evaluator: Arc::new(DefaultEvaluator),
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn OutcomeEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal run-level cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Start a new run of `template` and drive it to a stop.
    ///
    /// # Errors
    /// `InvalidTemplate` or `CyclicDependency` if the step graph is invalid.
    /// Checkpoint failures are recorded as run warnings, never returned.
    pub async fn start(
        &self,
        template: &WorkflowTemplate,
        inputs: BTreeMap<String, String>,
    ) -> Result<WorkflowRun> {
        let graph = StepGraph::from_template(template)?;
        let mut run = WorkflowRun::new(template, inputs);

        info!(run_id = %run.id, template = %run.template_id, steps = graph.len(), "run started");
        self.emit(WorkflowEvent::RunStarted { run_id: run.id });

        let frontier = graph.frontier(&run).ready;
        self.commit(&mut run, frontier).await;
        self.drive(&graph, run).await
    }

    /// Continue a run from its last checkpoint.
    ///
    /// Completed steps and completed tasks are never executed again. A
    /// run that already finished is returned exactly as checkpointed.
    ///
    /// # Errors
    /// `Checkpoint` if the snapshot cannot be loaded.
    pub async fn resume(&self, run_id: &RunId) -> Result<WorkflowRun> {
        let checkpoint = self.store.load(run_id).await?;
        let mut run = checkpoint.run;

        if run.status.is_final() {
            info!(run_id = %run.id, status = %run.status, "run already finished, nothing to resume");
            return Ok(run);
        }

        let graph = StepGraph::from_steps(&run.steps)?;
        info!(
            run_id = %run.id,
            completed = run.completed_steps.len(),
            frontier = ?checkpoint.frontier,
            "resuming run"
        );
        run.status = RunStatus::Running;
        self.emit(WorkflowEvent::RunStarted { run_id: run.id });
        self.drive(&graph, run).await
    }

    async fn drive(&self, graph: &StepGraph, mut run: WorkflowRun) -> Result<WorkflowRun> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        // Stops new steps and winds down running ones; follows `self.cancel`.
        let halt = self.cancel.child_token();
        let mut in_flight: JoinSet<(String, Result<SchedulerOutcome>)> = JoinSet::new();
        // Steps that were running at the last checkpoint start over.
        run.current_step.clear();

        loop {
            let frontier = graph.frontier(&run);
            for name in &frontier.skipped {
                if run.skipped_steps.insert(name.clone()) {
                    debug!(run_id = %run.id, step = %name, "step skipped");
                    self.emit(WorkflowEvent::StepSkipped {
                        run_id: run.id,
                        step: name.clone(),
                    });
                }
            }

            if !halt.is_cancelled() && !self.failed_fast(graph, &run) {
                for name in &frontier.ready {
                    if run.current_step.contains(name) {
                        continue;
                    }
                    let Some(step) = graph.step(name) else {
                        continue;
                    };
                    let scheduler = self.step_scheduler(graph, &run, step, &permits, &halt)?;
                    run.current_step.push(name.clone());
                    let name = name.clone();
                    in_flight.spawn(async move {
                        let mut scheduler = scheduler;
                        let outcome = scheduler.run().await;
                        (name, outcome)
                    });
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (name, outcome) = joined.map_err(|e| Error::Validation(format!("step aborted: {}", e)))?;
            let outcome = outcome?;
            run.current_step.retain(|running| running != &name);
            for task in outcome.tasks {
                run.tasks.insert(task.id.clone(), task);
            }

            let Some(step) = graph.step(&name) else {
                continue;
            };
            let tasks = run.step_tasks(step);
            let all_completed = tasks.iter().all(|t| t.status == TaskStatus::Completed);
            if halt.is_cancelled() && !all_completed {
                // Cut short; runs again on resume.
                debug!(run_id = %run.id, step = %name, "step interrupted");
                continue;
            }
            let step_outcome = self.evaluator.evaluate(step, &tasks);
            self.record_step(&mut run, step, step_outcome);
            let next = graph.frontier(&run).ready;
            self.commit(&mut run, next).await;

            if self.failed_fast(graph, &run) && !halt.is_cancelled() {
                warn!(
                    run_id = %run.id,
                    steps = ?graph.unhandled_failures(&run),
                    running = ?run.current_step,
                    "fail-fast: stopping after step failure"
                );
                halt.cancel();
            }
        }

        if !self.failed_fast(graph, &run) && self.cancel.is_cancelled() && !graph.frontier(&run).ready.is_empty() {
            return Ok(self.interrupt(graph, run).await);
        }

        run.current_step.clear();
        let failed = !run.all_tasks_completed() || !graph.unhandled_failures(&run).is_empty();
        run.status = if failed { RunStatus::Failed } else { RunStatus::Completed };
        run.completed_at = Some(Utc::now());

        info!(
            run_id = %run.id,
            status = %run.status,
            completed_steps = run.completed_steps.len(),
            skipped_steps = run.skipped_steps.len(),
            errors = run.errors.len(),
            "run finished"
        );
        self.commit(&mut run, Vec::new()).await;
        self.emit(WorkflowEvent::RunFinished {
            run_id: run.id,
            status: run.status,
        });
        Ok(run)
    }

    /// True when fail-fast is on and some failure has no handler.
    fn failed_fast(&self, graph: &StepGraph, run: &WorkflowRun) -> bool {
        self.config.fail_fast && !graph.unhandled_failures(run).is_empty()
    }

    /// Build the scheduler that runs one step's tasks.
    ///
    /// Every step of a run draws from the same `permits`, so the run as a
    /// whole never has more than `max_concurrency` tasks executing.
    fn step_scheduler(
        &self,
        graph: &StepGraph,
        run: &WorkflowRun,
        step: &StepTemplate,
        permits: &Arc<Semaphore>,
        halt: &CancellationToken,
    ) -> Result<Scheduler> {
        let inputs = upstream_artifacts(graph, run, step);
        let tasks = build_tasks(run, step);
        let mut scheduler = Scheduler::new(self.config.scheduler_config(), Arc::clone(&self.runner))
            .with_cancel(halt.child_token())
            .with_permits(Arc::clone(permits));
        for task in &tasks {
            scheduler.set_inputs(task.id.clone(), inputs.clone());
        }

        info!(run_id = %run.id, step = %step.name, tasks = tasks.len(), "step started");
        self.emit(WorkflowEvent::StepStarted {
            run_id: run.id,
            step: step.name.clone(),
            tasks: tasks.len(),
        });
        scheduler.submit(tasks)?;
        Ok(scheduler)
    }

    fn record_step(&self, run: &mut WorkflowRun, step: &StepTemplate, outcome: StepOutcome) {
        let now = Utc::now();
        let mut errors: Vec<RunError> = run
            .step_tasks(step)
            .into_iter()
            .filter_map(|task| {
                task.error.as_ref().map(|err| RunError {
                    step: step.name.clone(),
                    task_id: Some(task.id.clone()),
                    kind: err.kind,
                    message: err.message.clone(),
                    timestamp: now,
                })
            })
            .collect();
        if outcome == StepOutcome::Failed && errors.is_empty() {
            errors.push(RunError {
                step: step.name.clone(),
                task_id: None,
                kind: ErrorKind::Validation,
                message: format!("step {} reported a failed outcome", step.name),
                timestamp: now,
            });
        }

        if errors.is_empty() {
            info!(run_id = %run.id, step = %step.name, outcome = %outcome, "step completed");
        } else {
            warn!(run_id = %run.id, step = %step.name, outcome = %outcome, errors = errors.len(), "step completed with errors");
        }

        run.errors.extend(errors);
        run.completed_steps.insert(step.name.clone());
        run.step_outcomes.insert(step.name.clone(), outcome);
        self.emit(WorkflowEvent::StepCompleted {
            run_id: run.id,
            step: step.name.clone(),
            outcome,
        });
    }

    async fn interrupt(&self, graph: &StepGraph, mut run: WorkflowRun) -> WorkflowRun {
        run.current_step.clear();
        run.status = RunStatus::Cancelled;
        info!(run_id = %run.id, completed_steps = run.completed_steps.len(), "run cancelled");

        let frontier = graph.frontier(&run).ready;
        self.commit(&mut run, frontier).await;
        self.emit(WorkflowEvent::RunFinished {
            run_id: run.id,
            status: run.status,
        });
        run
    }

    /// Persist a checkpoint. A failed write becomes a run warning.
    async fn commit(&self, run: &mut WorkflowRun, frontier: Vec<String>) {
        let checkpoint = Checkpoint::new(run, frontier);
        match self.store.save(&checkpoint).await {
            Ok(()) => {
                debug!(run_id = %run.id, "checkpoint saved");
                self.emit(WorkflowEvent::CheckpointSaved { run_id: run.id });
            }
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "checkpoint save failed");
                run.warnings.push(e.to_string());
            }
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Artifacts of every completed predecessor of `step`, in graph order.
fn upstream_artifacts(graph: &StepGraph, run: &WorkflowRun, step: &StepTemplate) -> Vec<Artifact> {
    graph
        .incoming(&step.name)
        .into_iter()
        .filter(|(pred, _)| run.completed_steps.contains(&pred.name))
        .flat_map(|(pred, _)| run.step_artifacts(pred))
        .collect()
}

/// Expand `step` into its tasks, reusing any that already completed.
fn build_tasks(run: &WorkflowRun, step: &StepTemplate) -> Vec<Task> {
    let mut vars = run.inputs.clone();
    vars.insert("step".to_string(), step.name.clone());

    let parts: Vec<Option<&String>> = if step.fan_out.is_empty() {
        vec![None]
    } else {
        step.fan_out.iter().map(Some).collect()
    };

    step.task_ids()
        .into_iter()
        .zip(parts)
        .map(|(id, part)| {
            if let Some(done) = run.tasks.get(&id).filter(|t| t.status == TaskStatus::Completed) {
                return done.clone();
            }
            let mut vars = vars.clone();
            if let Some(part) = part {
                vars.insert("part".to_string(), part.clone());
            }
            let mut task = Task::new(id, step.role, &render_template(&step.description, &vars))
                .with_step(&step.name)
                .with_priority(step.priority);
            for (key, value) in &step.context {
                task = task.with_context(key, &render_template(value, &vars));
            }
            if let Some(part) = part {
                task = task.with_context("part", part);
            }
            task
        })
        .collect()
}
