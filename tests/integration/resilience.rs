//! Resilience behaviour seen through the agent executor.

use conductor::agent::budget::{estimate_tokens, TRUNCATION_MARKER};
use conductor::agent::{AgentRequest, ServiceError, ServiceErrorKind};
use conductor::core::{Role, TaskId};
use conductor::resilience::{BreakerConfig, CircuitState};
use conductor::{Error, ErrorKind};

use super::fixtures::{executor_for, fast_retry, ScriptedService};

fn request(user_prompt: String) -> AgentRequest {
    AgentRequest {
        task_id: TaskId::from("build"),
        role: Role::Developer,
        system_instructions: Role::Developer.system_instructions().to_string(),
        user_prompt,
    }
}

fn breaker_threshold(failure_threshold: u32) -> BreakerConfig {
    BreakerConfig {
        failure_threshold,
        ..BreakerConfig::default()
    }
}

/// Test: Breaker opens and short-circuits the next call
///
/// Given: a breaker with threshold 3 and a service that always fails transiently
/// When: one execution exhausts three attempts and a second execution follows
/// Then: the second execution fails with CircuitOpen without reaching the service
#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold() {
    let service = ScriptedService::new(|_| Err(ServiceError::transient("502 bad gateway")));
    let (executor, breaker) = executor_for(service.clone(), fast_retry(3), breaker_threshold(3));

    let first = executor.execute(&request("hello".into()), None).await;
    assert!(matches!(first, Err(Error::RetryExhausted { attempts: 3, .. })));
    assert_eq!(service.call_count(), 3);
    assert_eq!(breaker.state().await, CircuitState::Open);

    let second = executor.execute(&request("hello".into()), None).await;
    let err = second.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(service.call_count(), 3);
}

/// Test: Transient failures recover within the retry budget
///
/// Given: a service that fails twice then answers
/// When: one execution runs with three attempts
/// Then: the call succeeds on the third attempt and the breaker stays closed
#[tokio::test(start_paused = true)]
async fn test_retry_recovers_from_transient_failures() {
    let service = ScriptedService::new(|_| Ok("```python:app.py\nprint('ok')\n```".to_string()));
    service.push(Err(ServiceError::transient("connection reset")));
    service.push(Err(ServiceError::new(ServiceErrorKind::Timeout, "slow")));
    let (executor, breaker) = executor_for(service.clone(), fast_retry(3), breaker_threshold(5));

    let output = executor.execute(&request("hello".into()), None).await.unwrap();

    assert_eq!(service.call_count(), 3);
    assert_eq!(output.artifacts[0].path, "app.py");
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures().await, 0);
}

/// Test: Non-transient errors are not retried
///
/// Given: a service that rejects the credentials
/// When: one execution runs with three attempts allowed
/// Then: the service is called once and the error surfaces as Authentication
#[tokio::test(start_paused = true)]
async fn test_authentication_error_not_retried() {
    let service = ScriptedService::new(|_| {
        Err(ServiceError::new(ServiceErrorKind::Authentication, "bad key").with_status(401))
    });
    let (executor, breaker) = executor_for(service.clone(), fast_retry(3), breaker_threshold(3));

    let err = executor.execute(&request("hello".into()), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(service.call_count(), 1);
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

/// Test: Oversized prompt is truncated once and retried
///
/// Given: a 20,000 character prompt and a service with a 4096 token limit
/// When: the first attempt is rejected as too large
/// Then: the retry fits in 4096 - 1024 reserved tokens and succeeds
#[tokio::test(start_paused = true)]
async fn test_context_overflow_truncates_and_succeeds() {
    let service = ScriptedService::new(|_| Ok("File: notes.md\n```markdown\ndone\n```".to_string()));
    service.push(Err(ServiceError::context_exceeded(Some(4096), Some(5200))));
    let (executor, _) = executor_for(service.clone(), fast_retry(3), breaker_threshold(5));

    let output = executor.execute(&request("x".repeat(20_000)), None).await.unwrap();

    assert!(output.truncated);
    assert_eq!(output.artifacts[0].path, "notes.md");

    let requests = service.requests();
    assert_eq!(requests.len(), 2);
    let retry = &requests[1];
    let total = estimate_tokens(&retry.role_instructions) + estimate_tokens(&retry.user_prompt);
    assert!(total <= 4096 - 1024, "retry used {} tokens", total);
    assert!(retry.user_prompt.ends_with(TRUNCATION_MARKER));
}

/// Test: A second context rejection is final
///
/// Given: a service that rejects every prompt as too large
/// When: one execution runs
/// Then: exactly two calls are made and the error is ContextBudgetExceeded
#[tokio::test(start_paused = true)]
async fn test_context_overflow_twice_fails() {
    let service = ScriptedService::new(|_| Err(ServiceError::context_exceeded(Some(2048), None)));
    let (executor, _) = executor_for(service.clone(), fast_retry(3), breaker_threshold(5));

    let err = executor.execute(&request("y".repeat(20_000)), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ContextBudgetExceeded);
    assert_eq!(service.call_count(), 2);
}
