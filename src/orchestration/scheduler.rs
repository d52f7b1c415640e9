//! Scheduler for parallel task execution.
//!
//! The Scheduler owns the tasks of one batch, promotes them through the
//! DAG as their dependencies complete and dispatches ready tasks to a
//! [`TaskRunner`] while respecting the concurrency limit. Workers report
//! back over an mpsc channel; completion order is unconstrained.
//! Several schedulers can share one [`Semaphore`] so that a single limit
//! holds across batches running side by side.

use crate::core::{Artifact, Task, TaskDAG, TaskError, TaskId, TaskResult, TaskStatus};
use crate::error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of tasks allowed to run at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Executes a single task.
///
/// Runners receive the task, the artifacts it may read and a cancellation
/// token; they report only through their return value.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        task: &Task,
        inputs: &[Artifact],
        cancel: CancellationToken,
    ) -> Result<TaskResult>;
}

/// Scheduling policy for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum tasks in Running state at once (K).
    pub max_concurrency: usize,
    /// Cancel the rest of the batch as soon as one task fails.
    pub fail_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            fail_fast: true,
        }
    }
}

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow external components to react to task state changes
/// without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Every dependency of the task has completed.
    TaskReady { task_id: TaskId },
    /// The task was dispatched to a runner.
    TaskStarted { task_id: TaskId },
    /// A task completed successfully.
    TaskCompleted {
        task_id: TaskId,
        /// Number of artifacts it produced.
        artifacts: usize,
    },
    /// A task failed, was cancelled or lost a dependency.
    TaskFailed { task_id: TaskId, error: TaskError },
    /// Every task in the batch reached a terminal state.
    AllTasksComplete,
}

/// Final state of every task in a batch, in submission order.
#[derive(Debug, Clone)]
pub struct SchedulerOutcome {
    pub tasks: Vec<Task>,
}

impl SchedulerOutcome {
    /// Check whether every task completed.
    pub fn all_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    pub fn failed(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}

type Completion = (TaskId, Result<TaskResult>);

/// Dependency-aware, bounded-concurrency task scheduler.
///
/// # Example
///
/// ```ignore
/// let mut scheduler = Scheduler::new(SchedulerConfig::default(), runner)
///     .with_events(event_tx);
/// scheduler.submit(tasks)?;
/// let outcome = scheduler.run().await?;
/// ```
pub struct Scheduler {
    config: SchedulerConfig,
    runner: Arc<dyn TaskRunner>,
    dag: TaskDAG,
    /// Extra artifacts handed to specific tasks (upstream step outputs).
    inputs: HashMap<TaskId, Vec<Artifact>>,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    cancel: CancellationToken,
    /// Shared run slots; a worker holds one while its runner executes.
    permits: Option<Arc<Semaphore>>,
    running: usize,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Arguments
    ///
    /// * `config` - Concurrency limit and fail-fast policy
    /// * `runner` - Executes each dispatched task
    pub fn new(config: SchedulerConfig, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            config,
            runner,
            dag: TaskDAG::new(),
            inputs: HashMap::new(),
            event_tx: None,
            cancel: CancellationToken::new(),
            permits: None,
            running: 0,
        }
    }

    /// Emit lifecycle events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Use `token` as the batch cancellation signal.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Draw run slots from `permits` in addition to the local limit.
    ///
    /// A task waiting for a slot still counts as running here. If the
    /// batch is cancelled first it fails as `Cancelled` without reaching
    /// the runner.
    pub fn with_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = Some(permits);
        self
    }

    /// Give `task_id` additional input artifacts.
    pub fn set_inputs(&mut self, task_id: TaskId, artifacts: Vec<Artifact>) {
        self.inputs.insert(task_id, artifacts);
    }

    /// Submit the batch.
    ///
    /// Tasks that are already Completed or Failed keep their state and are
    /// never dispatched; any other task starts over as Pending.
    ///
    /// # Errors
    /// - `CyclicDependency` if the dependencies form a cycle
    /// - `Validation` for duplicate ids or unknown dependencies
    pub fn submit(&mut self, tasks: Vec<Task>) -> Result<()> {
        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                if !task.is_finished() {
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                }
                task
            })
            .collect();
        self.dag = TaskDAG::from_tasks(tasks)?;
        debug!(
            tasks = self.dag.task_count(),
            dependencies = self.dag.dependency_count(),
            "batch submitted"
        );
        Ok(())
    }

    /// Run the batch until every task is terminal.
    ///
    /// # Errors
    /// `SchedulingStalled` if tasks remain that can never become ready.
    pub async fn run(&mut self) -> Result<SchedulerOutcome> {
        let capacity = self.dag.task_count().max(1);
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(capacity);

        info!(
            tasks = self.dag.task_count(),
            max_concurrency = self.config.max_concurrency,
            fail_fast = self.config.fail_fast,
            "scheduler started"
        );

        loop {
            self.promote();

            if self.cancel.is_cancelled() {
                self.cancel_unstarted();
            } else {
                self.dispatch_ready(&done_tx);
            }

            if self.running == 0 {
                if self.dag.all_finished() {
                    break;
                }
                let stuck: Vec<String> = self
                    .dag
                    .ids_with_status(TaskStatus::Pending)
                    .into_iter()
                    .map(|id| id.to_string())
                    .collect();
                return Err(Error::SchedulingStalled(stuck.join(", ")));
            }

            match done_rx.recv().await {
                Some((task_id, result)) => {
                    self.running -= 1;
                    self.handle_completion(task_id, result);
                }
                // We hold a sender, so the channel cannot close while tasks run.
                None => break,
            }
        }

        self.emit(SchedulerEvent::AllTasksComplete);
        let dag = std::mem::take(&mut self.dag);
        let outcome = SchedulerOutcome {
            tasks: dag.into_tasks(),
        };
        info!(
            completed = outcome.tasks.iter().filter(|t| t.status == TaskStatus::Completed).count(),
            failed = outcome.failed().len(),
            "scheduler finished"
        );
        Ok(outcome)
    }

    /// Move Pending tasks to Ready, or to Failed when a dependency failed.
    ///
    /// Repeats until nothing changes so failures propagate transitively.
    fn promote(&mut self) {
        loop {
            let mut changed = false;

            for id in self.dag.ids_with_status(TaskStatus::Pending) {
                let deps: Vec<(TaskId, TaskStatus)> = self
                    .dag
                    .dependencies_of(&id)
                    .into_iter()
                    .map(|d| (d.id.clone(), d.status))
                    .collect();

                if let Some((failed_dep, _)) = deps.iter().find(|(_, s)| *s == TaskStatus::Failed) {
                    let err = Error::DependencyFailed {
                        task: id.to_string(),
                        dependency: failed_dep.to_string(),
                    };
                    debug!(task_id = %id, dependency = %failed_dep, "dependency failed");
                    self.fail_task(&id, TaskError::from(&err));
                    changed = true;
                } else if deps.iter().all(|(_, s)| *s == TaskStatus::Completed) {
                    if let Some(task) = self.dag.get_task_mut(&id) {
                        if task.mark_ready().is_ok() {
                            self.emit(SchedulerEvent::TaskReady { task_id: id });
                            changed = true;
                        }
                    }
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Dispatch ready tasks by ascending priority, then submission order.
    fn dispatch_ready(&mut self, done_tx: &mpsc::Sender<Completion>) {
        let limit = self.config.max_concurrency.max(1);
        if self.running >= limit {
            return;
        }

        let mut ready: Vec<(i32, usize, TaskId)> = self
            .dag
            .ids_with_status(TaskStatus::Ready)
            .into_iter()
            .filter_map(|id| {
                let priority = self.dag.get_task(&id)?.priority;
                let position = self.dag.position(&id)?;
                Some((priority, position, id))
            })
            .collect();
        ready.sort();

        for (_, _, id) in ready.into_iter().take(limit - self.running) {
            let inputs = self.inputs_for(&id);
            let Some(task) = self.dag.get_task_mut(&id) else {
                continue;
            };
            if task.start().is_err() {
                continue;
            }
            let task = task.clone();

            self.running += 1;
            self.emit(SchedulerEvent::TaskStarted {
                task_id: id.clone(),
            });
            debug!(task_id = %id, running = self.running, "task dispatched");

            let runner = Arc::clone(&self.runner);
            let cancel = self.cancel.child_token();
            let permits = self.permits.clone();
            let tx = done_tx.clone();
            tokio::spawn(async move {
                let worker = tokio::spawn(async move {
                    let _slot = match permits {
                        Some(permits) => tokio::select! {
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            slot = permits.acquire_owned() => Some(slot.map_err(|_| Error::Cancelled)?),
                        },
                        None => None,
                    };
                    runner.run(&task, &inputs, cancel).await
                });
                let result = match worker.await {
                    Ok(result) => result,
                    Err(join_err) => Err(Error::Validation(format!(
                        "task runner aborted: {}",
                        join_err
                    ))),
                };
                let _ = tx.send((id, result)).await;
            });
        }
    }

    fn handle_completion(&mut self, task_id: TaskId, result: Result<TaskResult>) {
        match result {
            Ok(result) => {
                let artifacts = result.artifacts.len();
                if let Some(task) = self.dag.get_task_mut(&task_id) {
                    if task.complete(result).is_ok() {
                        info!(task_id = %task_id, artifacts, "task completed");
                        self.emit(SchedulerEvent::TaskCompleted { task_id, artifacts });
                    }
                }
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "task failed");
                self.fail_task(&task_id, TaskError::from(&err));
                if self.config.fail_fast && !self.cancel.is_cancelled() {
                    info!(task_id = %task_id, "fail-fast: cancelling remaining tasks");
                    self.cancel.cancel();
                }
            }
        }
    }

    /// Fail every task that has not started yet.
    fn cancel_unstarted(&mut self) {
        let mut ids = self.dag.ids_with_status(TaskStatus::Pending);
        ids.extend(self.dag.ids_with_status(TaskStatus::Ready));
        for id in ids {
            self.fail_task(&id, TaskError::new(ErrorKind::Cancelled, "run cancelled before task started"));
        }
    }

    fn fail_task(&mut self, id: &TaskId, error: TaskError) {
        if let Some(task) = self.dag.get_task_mut(id) {
            if task.fail(error.clone()).is_ok() {
                self.emit(SchedulerEvent::TaskFailed {
                    task_id: id.clone(),
                    error,
                });
            }
        }
    }

    /// Extra inputs for the task followed by its completed dependencies' artifacts.
    fn inputs_for(&self, id: &TaskId) -> Vec<Artifact> {
        let mut inputs = self.inputs.get(id).cloned().unwrap_or_default();
        for dep in self.dag.dependencies_of(id) {
            inputs.extend(dep.artifacts().iter().cloned());
        }
        inputs
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
