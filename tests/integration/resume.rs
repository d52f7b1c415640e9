//! Cancellation, durable checkpoints and resume.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use conductor::core::{Artifact, Role, Task, TaskId, TaskResult, TaskStatus};
use conductor::orchestration::TaskRunner;
use conductor::workflow::{
    CheckpointStore, EngineConfig, FileCheckpointStore, RunId, RunStatus, StepTemplate, WorkflowEngine,
    WorkflowTemplate,
};
use conductor::{Error, ErrorKind, Result};

/// Runs every task quickly. When the task named `trip_on` starts, it
/// fires `trip` and then waits for its own cancellation.
#[derive(Default)]
struct InterruptingRunner {
    trip_on: Option<String>,
    trip: CancellationToken,
    calls: Mutex<Vec<String>>,
}

impl InterruptingRunner {
    fn tripping_on(task_id: &str) -> Self {
        Self {
            trip_on: Some(task_id.to_string()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for InterruptingRunner {
    async fn run(&self, task: &Task, inputs: &[Artifact], cancel: CancellationToken) -> Result<TaskResult> {
        let id = task.id.to_string();
        self.calls.lock().unwrap().push(id.clone());

        if self.trip_on.as_deref() == Some(id.as_str()) {
            // Let faster siblings finish before the interrupt lands.
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.trip.cancel();
            cancel.cancelled().await;
            return Err(Error::Cancelled);
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        let content = format!("{} saw {} inputs", id, inputs.len());
        let artifact = Artifact::new(format!("{}.txt", id), content.clone(), task.id.clone(), task.role);
        Ok(TaskResult::new(vec![artifact], content))
    }
}

fn pipeline() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "pipeline",
        vec![
            StepTemplate::new("design", Role::Architect, "Design"),
            StepTemplate::new("build", Role::Developer, "Build {{part}}")
                .after("design")
                .fan_out(&["x", "y"]),
            StepTemplate::new("test", Role::Tester, "Test").after("build"),
        ],
    )
}

/// Engine over `store` whose run-level token follows `runner.trip`.
fn engine_with(runner: Arc<InterruptingRunner>, store: Arc<FileCheckpointStore>) -> WorkflowEngine {
    let engine = WorkflowEngine::new(EngineConfig::default(), runner.clone(), store);
    let engine_cancel = engine.cancel_token();
    let trip = runner.trip.clone();
    tokio::spawn(async move {
        trip.cancelled().await;
        engine_cancel.cancel();
    });
    engine
}

/// Test: Interrupted run resumes without redoing finished work
///
/// Given: a design -> build(x, y) -> test pipeline interrupted while build.y runs
/// When: a fresh engine resumes the run from the file checkpoint
/// Then: only build.y and test execute again and the run completes
#[tokio::test]
async fn test_cancel_then_resume_skips_completed_tasks() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));

    let first = Arc::new(InterruptingRunner::tripping_on("build.y"));
    let engine = engine_with(first.clone(), store.clone());
    let interrupted = engine.start(&pipeline(), BTreeMap::new()).await.unwrap();

    assert_eq!(interrupted.status, RunStatus::Cancelled);
    assert_eq!(first.calls(), vec!["design", "build.x", "build.y"]);
    assert!(interrupted.completed_steps.contains("design"));
    assert!(!interrupted.completed_steps.contains("build"));
    assert_eq!(
        interrupted.tasks[&TaskId::from("build.x")].status,
        TaskStatus::Completed
    );
    assert!(store.path_for(&interrupted.id).exists());

    let checkpoint = store.load(&interrupted.id).await.unwrap();
    assert_eq!(checkpoint.run.status, RunStatus::Cancelled);
    assert_eq!(checkpoint.frontier, vec!["build".to_string()]);

    let second = Arc::new(InterruptingRunner::default());
    let engine = engine_with(second.clone(), store.clone());
    let resumed = engine.resume(&interrupted.id).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(second.calls(), vec!["build.y", "test"]);
    assert_eq!(resumed.id, interrupted.id);
    assert_eq!(
        resumed.tasks[&TaskId::from("build.x")],
        interrupted.tasks[&TaskId::from("build.x")]
    );
    let paths: Vec<&str> = resumed.artifacts().iter().map(|a| a.path.as_str()).collect();
    assert_eq!(paths, vec!["design.txt", "build.x.txt", "build.y.txt", "test.txt"]);
    assert!(resumed.errors.is_empty());

    let stored = store.load(&resumed.id).await.unwrap();
    assert_eq!(stored.run, resumed);
}

/// Test: Resuming a finished run changes nothing
///
/// Given: a run that completed and was checkpointed to disk
/// When: it is resumed by another engine
/// Then: the returned snapshot equals the original and no task runs again
#[tokio::test]
async fn test_resume_completed_run_is_identity() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));

    let first = Arc::new(InterruptingRunner::default());
    let run = engine_with(first.clone(), store.clone())
        .start(&pipeline(), BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(first.calls().len(), 4);

    let second = Arc::new(InterruptingRunner::default());
    let resumed = engine_with(second.clone(), store.clone())
        .resume(&run.id)
        .await
        .unwrap();

    assert_eq!(resumed, run);
    assert!(second.calls().is_empty());
    assert_eq!(store.list().await.unwrap(), vec![run.id]);
}

/// Test: Resuming an unknown run fails
///
/// Given: an empty checkpoint directory
/// When: a random run id is resumed
/// Then: the error is a checkpoint error
#[tokio::test]
async fn test_resume_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    let engine = engine_with(Arc::new(InterruptingRunner::default()), store);

    let err = engine.resume(&RunId::new()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Checkpoint);
}
