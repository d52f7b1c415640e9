//! End-to-end runs: template -> engine -> scheduler -> executor -> artifacts.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use conductor::agent::{GenerationRequest, ServiceError, ServiceErrorKind};
use conductor::core::TaskId;
use conductor::workflow::{
    EngineConfig, MemoryCheckpointStore, RunStatus, StepOutcome, WorkflowEngine, WorkflowEvent,
    WorkflowTemplate,
};
use conductor::ErrorKind;

use super::fixtures::{default_executor, task_line, Reply, ScriptedService};

const FEATURE_TEMPLATE: &str = r#"
id = "feature"

[[step]]
name = "requirements"
role = "product_manager"
description = "Write requirements for {{feature}}"

[[step]]
name = "build"
role = "developer"
description = "Implement {{feature}} ({{part}})"
after = ["requirements"]
fan_out = ["api", "ui"]

[[step]]
name = "review"
role = "reviewer"
description = "Review the {{feature}} implementation"
after = ["build"]

[[step]]
name = "fix"
role = "developer"
description = "Address review comments"
after = [{ step = "review", when = "needs-review" }]

[[step]]
name = "docs"
role = "tech_writer"
description = "Document {{feature}}"
after = ["review"]
"#;

fn role_of(req: &GenerationRequest) -> &str {
    req.user_prompt
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("## Task ("))
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or("")
}

/// Plays every role of the feature template. The reviewer answers with
/// `verdict`.
fn feature_team(verdict: &'static str) -> impl Fn(&GenerationRequest) -> Reply + Send + Sync {
    move |req| {
        let reply = match role_of(req) {
            "product_manager" => "File: requirements.md\n```markdown\n# Login\nUsers sign in.\n```".to_string(),
            "developer" if req.user_prompt.contains("- part: api") => {
                "```python:api/app.py\ndef login():\n    return True\n```".to_string()
            }
            "developer" if req.user_prompt.contains("- part: ui") => {
                "```javascript:ui/app.js\nexport const login = () => true;\n```".to_string()
            }
            "developer" => "File: api/app.py\n```python\ndef login():\n    return check()\n```".to_string(),
            "reviewer" => format!("Reviewed both parts.\nOUTCOME: {}", verdict),
            "tech_writer" => "File: README.md\n```markdown\n# Login\n```".to_string(),
            other => return Err(ServiceError::new(ServiceErrorKind::Validation, format!("unexpected role {}", other))),
        };
        Ok(reply)
    }
}

fn feature_inputs() -> BTreeMap<String, String> {
    BTreeMap::from([("feature".to_string(), "login".to_string())])
}

fn engine_for(service: Arc<ScriptedService>) -> WorkflowEngine {
    WorkflowEngine::new(
        EngineConfig::default(),
        default_executor(service),
        Arc::new(MemoryCheckpointStore::new()),
    )
}

/// Test: Feature pipeline runs to completion
///
/// Given: the feature template and a reviewer that approves
/// When: the run starts with feature=login
/// Then: every step but the conditional fix completes and artifacts come out in step order
#[tokio::test(start_paused = true)]
async fn test_feature_pipeline_completes() {
    let service = ScriptedService::new(feature_team("continue"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine_for(service.clone()).with_events(tx);
    let template = WorkflowTemplate::from_toml(FEATURE_TEMPLATE).unwrap();

    let run = engine.start(&template, feature_inputs()).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.errors.is_empty());
    assert!(run.completed_at.is_some());
    for step in ["requirements", "build", "review", "docs"] {
        assert!(run.completed_steps.contains(step), "{} not completed", step);
    }
    assert!(run.skipped_steps.contains("fix"));
    assert_eq!(run.step_outcomes["review"], StepOutcome::Continue);

    let paths: Vec<&str> = run.artifacts().iter().map(|a| a.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["requirements.md", "api/app.py", "ui/app.js", "review.md", "README.md"]
    );

    let prompts: Vec<String> = service.requests().into_iter().map(|r| r.user_prompt).collect();
    assert_eq!(prompts.len(), 5);
    assert!(prompts.iter().any(|p| task_line(p) == "Implement login (api)"));
    assert!(prompts.iter().any(|p| task_line(p) == "Implement login (ui)"));
    let review = prompts
        .iter()
        .find(|p| task_line(p) == "Review the login implementation")
        .unwrap();
    assert!(review.contains("File: api/app.py"));
    assert!(review.contains("File: ui/app.js"));

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(WorkflowEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::RunFinished {
            status: RunStatus::Completed,
            ..
        })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, WorkflowEvent::StepSkipped { step, .. } if step == "fix")));
}

/// Test: Review verdict routes to the fix step
///
/// Given: the feature template and a reviewer that asks for changes
/// When: the run starts
/// Then: the fix step runs with the review in its prompt
#[tokio::test(start_paused = true)]
async fn test_needs_review_runs_fix_step() {
    let service = ScriptedService::new(feature_team("needs-review"));
    let engine = engine_for(service.clone());
    let template = WorkflowTemplate::from_toml(FEATURE_TEMPLATE).unwrap();

    let run = engine.start(&template, feature_inputs()).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_outcomes["review"], StepOutcome::NeedsReview);
    assert!(run.completed_steps.contains("fix"));
    assert!(run.completed_steps.contains("docs"));
    assert!(run.skipped_steps.is_empty());

    let fix_prompt = service
        .requests()
        .into_iter()
        .map(|r| r.user_prompt)
        .find(|p| task_line(p) == "Address review comments")
        .unwrap();
    assert!(fix_prompt.contains("File: review.md"));
    assert!(fix_prompt.contains("OUTCOME: needs-review"));

    let fix = &run.tasks[&TaskId::from("fix")];
    assert_eq!(fix.artifacts()[0].path, "api/app.py");
    assert!(fix.artifacts()[0].content.contains("check()"));
}

/// Test: Duplicate paths in one response keep the first block
///
/// Given: a single-step template whose response names a.py twice
/// When: the run completes
/// Then: one a.py artifact holds the first block's content
#[tokio::test(start_paused = true)]
async fn test_duplicate_paths_keep_first() {
    let service = ScriptedService::new(|_| {
        Ok("File: a.py\n```python\nfirst = 1\n```\n\nFile: a.py\n```python\nsecond = 2\n```\n\n```python:b.py\nb = 1\n```".to_string())
    });
    let engine = engine_for(service);
    let template = WorkflowTemplate::from_toml(
        "id = \"single\"\n[[step]]\nname = \"build\"\nrole = \"developer\"\ndescription = \"Write a.py\"\n",
    )
    .unwrap();

    let run = engine.start(&template, BTreeMap::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let artifacts = run.artifacts();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[0].path, "a.py");
    assert_eq!(artifacts[0].content, "first = 1\n");
    assert_eq!(artifacts[1].path, "b.py");
}

/// Test: Unhandled failure stops the run under fail-fast
///
/// Given: a two-step template whose first step is rejected with an authentication error
/// When: the run starts
/// Then: the run fails, the error is recorded and the second step never reaches the service
#[tokio::test(start_paused = true)]
async fn test_unhandled_failure_fails_run() {
    let service = ScriptedService::new(|req| match role_of(req) {
        "developer" => Err(ServiceError::new(ServiceErrorKind::Authentication, "invalid api key").with_status(401)),
        _ => Ok("OUTCOME: continue".to_string()),
    });
    let engine = engine_for(service.clone());
    let template = WorkflowTemplate::from_toml(
        r#"
id = "broken"

[[step]]
name = "build"
role = "developer"
description = "Build it"

[[step]]
name = "review"
role = "reviewer"
description = "Review it"
after = ["build"]
"#,
    )
    .unwrap();

    let run = engine.start(&template, BTreeMap::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_outcomes["build"], StepOutcome::Failed);
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.errors[0].step, "build");
    assert_eq!(run.errors[0].kind, ErrorKind::Authentication);
    assert!(!run.completed_steps.contains("review"));
    assert_eq!(service.call_count(), 1);
}
