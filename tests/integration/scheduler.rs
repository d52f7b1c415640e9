//! Scheduler ordering and concurrency with real runners.

use std::sync::Arc;

use tokio::sync::mpsc;

use conductor::core::{Role, Task, TaskId, TaskStatus};
use conductor::orchestration::{Scheduler, SchedulerConfig, SchedulerEvent};
use conductor::ErrorKind;

use super::fixtures::{default_executor, task_line, Mark, RecordingRunner, ScriptedService};

fn config(max_concurrency: usize, fail_fast: bool) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        fail_fast,
    }
}

fn diamond() -> Vec<Task> {
    vec![
        Task::new("a", Role::Architect, "design"),
        Task::new("b", Role::Developer, "backend").depends_on("a"),
        Task::new("c", Role::Developer, "frontend").depends_on("a"),
        Task::new("d", Role::Tester, "verify").depends_on("b").depends_on("c"),
    ]
}

fn start(id: &str) -> Mark {
    Mark::Start(id.to_string())
}

fn finish(id: &str) -> Mark {
    Mark::Finish(id.to_string())
}

/// Test: Diamond executes in dependency order with two slots
///
/// Given: A -> {B, C} -> D and a concurrency limit of 2
/// When: the batch runs
/// Then: B and C overlap, D waits for both, and at most two tasks ever run
#[tokio::test(start_paused = true)]
async fn test_diamond_with_two_slots() {
    let runner = Arc::new(RecordingRunner::with_delays(&[("a", 10), ("b", 30), ("c", 30), ("d", 10)]));
    let mut scheduler = Scheduler::new(config(2, true), runner.clone());
    scheduler.submit(diamond()).unwrap();

    let outcome = scheduler.run().await.unwrap();

    assert!(outcome.all_completed());
    assert!(runner.position(&finish("a")) < runner.position(&start("b")));
    assert!(runner.position(&finish("a")) < runner.position(&start("c")));
    assert!(runner.position(&start("c")) < runner.position(&finish("b")));
    assert!(runner.position(&start("b")) < runner.position(&finish("c")));
    assert!(runner.position(&finish("b")) < runner.position(&start("d")));
    assert!(runner.position(&finish("c")) < runner.position(&start("d")));
    assert_eq!(runner.peak(), 2);
}

/// Test: Concurrency bound holds for a wide batch
///
/// Given: ten independent tasks and a limit of 3
/// When: the batch runs
/// Then: every task completes and no more than three ever run at once
#[tokio::test(start_paused = true)]
async fn test_wide_batch_respects_limit() {
    let runner = Arc::new(RecordingRunner::default());
    let mut scheduler = Scheduler::new(config(3, true), runner.clone());
    let tasks = (0..10)
        .map(|i| Task::new(format!("t{}", i), Role::Developer, "work"))
        .collect();
    scheduler.submit(tasks).unwrap();

    let outcome = scheduler.run().await.unwrap();

    assert!(outcome.all_completed());
    assert_eq!(outcome.tasks.len(), 10);
    assert_eq!(runner.peak(), 3);
}

/// Test: Failure propagates to dependents without fail-fast
///
/// Given: the diamond where B fails and fail-fast is off
/// When: the batch runs
/// Then: C still completes, D fails with DependencyFailed and never starts
#[tokio::test(start_paused = true)]
async fn test_failure_blocks_dependents() {
    let mut runner = RecordingRunner::default();
    runner.failing.insert("b".to_string());
    let runner = Arc::new(runner);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(config(2, false), runner.clone()).with_events(tx);
    scheduler.submit(diamond()).unwrap();

    let outcome = scheduler.run().await.unwrap();

    assert_eq!(outcome.get(&TaskId::from("c")).unwrap().status, TaskStatus::Completed);
    let d = outcome.get(&TaskId::from("d")).unwrap();
    assert_eq!(d.status, TaskStatus::Failed);
    assert_eq!(d.error.as_ref().unwrap().kind, ErrorKind::DependencyFailed);
    assert!(!runner.timeline().contains(&start("d")));

    let mut failed = Vec::new();
    let mut finished = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SchedulerEvent::TaskFailed { task_id, .. } => failed.push(task_id.to_string()),
            SchedulerEvent::AllTasksComplete => finished = true,
            _ => {}
        }
    }
    assert!(failed.contains(&"b".to_string()));
    assert!(failed.contains(&"d".to_string()));
    assert!(finished);
}

/// Test: Executor receives upstream artifacts
///
/// Given: a design task and a build task depending on it, run by the agent executor
/// When: the batch runs against a scripted service
/// Then: the build prompt lists the file produced by the design task
#[tokio::test(start_paused = true)]
async fn test_executor_sees_dependency_artifacts() {
    let service = ScriptedService::echo();
    let executor = default_executor(service.clone());
    let mut scheduler = Scheduler::new(config(4, true), executor);
    scheduler
        .submit(vec![
            Task::new("design", Role::Architect, "Design the api"),
            Task::new("build", Role::Developer, "Build the service").depends_on("design"),
        ])
        .unwrap();

    let outcome = scheduler.run().await.unwrap();

    assert!(outcome.all_completed());
    let design = outcome.get(&TaskId::from("design")).unwrap();
    assert_eq!(design.artifacts()[0].path, "api.md");

    let requests = service.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(task_line(&requests[0].user_prompt), "Design the api");
    let build_prompt = &requests[1].user_prompt;
    assert_eq!(task_line(build_prompt), "Build the service");
    assert!(build_prompt.contains("## Existing files"));
    assert!(build_prompt.contains("File: api.md"));
    assert!(build_prompt.contains("Design the api"));
}
