//! Agent executor: one task, one round-trip to the text-generation service.
//!
//! Every network attempt goes pool -> breaker -> client under the retry
//! policy. A context-size rejection triggers exactly one truncated retry.
//! The executor never touches task or run state; it only returns results.

use super::budget::{estimate_tokens, truncate_for_budget};
use super::client::{GenerationRequest, ServiceErrorKind};
use crate::core::{Artifact, Role, Task, TaskId, TaskResult};
use crate::error::{Error, Result};
use crate::extract::extract_artifacts;
use crate::orchestration::TaskRunner;
use crate::resilience::{CallOutcome, CircuitBreaker, ConnectionPool, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request shaping and deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub temperature: f32,
    pub max_completion_tokens: u32,
    /// Tokens held back for the completion when truncating.
    pub reserved_completion_tokens: usize,
    /// Share of the available budget the system instructions may use.
    pub system_share: f64,
    /// Deadline for a single network attempt.
    #[serde(rename = "call_timeout_ms", with = "crate::config::duration_ms")]
    pub call_timeout: Duration,
    /// Context limit assumed when the service rejects a prompt without reporting one.
    pub fallback_context_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_completion_tokens: 4096,
            reserved_completion_tokens: 1024,
            system_share: 0.3,
            call_timeout: Duration::from_secs(120),
            fallback_context_limit: 8192,
        }
    }
}

/// The resilience stack in front of one downstream service.
///
/// The breaker and pool are shared by every executor calling the service.
#[derive(Debug, Clone)]
pub struct ServiceGuard {
    pub retry: RetryPolicy,
    pub breaker: Arc<CircuitBreaker>,
    pub pool: ConnectionPool,
    pub endpoint: String,
}

/// Everything needed to call the service for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub role: Role,
    pub system_instructions: String,
    pub user_prompt: String,
}

impl AgentRequest {
    /// Build the request for a task, folding upstream artifacts into the prompt.
    pub fn for_task(task: &Task, inputs: &[Artifact]) -> Self {
        Self {
            task_id: task.id.clone(),
            role: task.role,
            system_instructions: task.role.system_instructions().to_string(),
            user_prompt: task
                .role
                .build_user_prompt(&task.description, &task.context, inputs),
        }
    }
}

/// Successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub artifacts: Vec<Artifact>,
    pub raw_text: String,
    /// Whether the prompts had to be truncated to fit the context budget.
    pub truncated: bool,
}

pub struct AgentExecutor {
    guard: ServiceGuard,
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(guard: ServiceGuard, config: ExecutorConfig) -> Self {
        Self { guard, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute one request.
    ///
    /// # Errors
    /// - `ContextBudgetExceeded` when the truncated retry is rejected as well
    /// - `CircuitOpen`, `Authentication`, `Validation` straight from the first attempt
    /// - `RetryExhausted` when transient failures outlast the retry policy
    /// - `Cancelled` when `cancel` fires during a retry backoff
    pub async fn execute(
        &self,
        request: &AgentRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AgentOutput> {
        info!(
            task_id = %request.task_id,
            role = %request.role,
            system_tokens = estimate_tokens(&request.system_instructions),
            user_tokens = estimate_tokens(&request.user_prompt),
            "executing agent request"
        );

        let first = self
            .call(&request.system_instructions, &request.user_prompt, cancel)
            .await;

        let limit = match first {
            Ok(text) => return Ok(self.finish(request, text, false)),
            Err(Error::ContextBudgetExceeded { limit, .. }) => {
                limit.unwrap_or(self.config.fallback_context_limit)
            }
            Err(e) => return Err(e),
        };

        let prompts = truncate_for_budget(
            &request.system_instructions,
            &request.user_prompt,
            limit,
            self.config.reserved_completion_tokens,
            self.config.system_share,
        );
        warn!(
            task_id = %request.task_id,
            context_limit = limit,
            available_tokens = prompts.available_tokens,
            system_budget = prompts.system_budget,
            user_budget = prompts.user_budget,
            "context budget exceeded, retrying with truncated prompts"
        );

        match self.call(&prompts.system, &prompts.user, cancel).await {
            Ok(text) => Ok(self.finish(request, text, true)),
            Err(Error::ContextBudgetExceeded { .. }) => Err(Error::ContextBudgetExceeded {
                limit: Some(limit),
                prompt_tokens: Some(prompts.estimated_tokens()),
            }),
            Err(e) => Err(e),
        }
    }

    fn finish(&self, request: &AgentRequest, text: String, truncated: bool) -> AgentOutput {
        let artifacts = extract_artifacts(&text, &request.task_id, request.role);
        debug!(
            task_id = %request.task_id,
            artifacts = artifacts.len(),
            truncated,
            "agent request succeeded"
        );
        AgentOutput {
            artifacts,
            raw_text: text,
            truncated,
        }
    }

    /// One logical call: retry policy around breaker around a pooled attempt.
    async fn call(
        &self,
        system: &str,
        user: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let request = GenerationRequest {
            role_instructions: system.to_string(),
            user_prompt: user.to_string(),
            temperature: self.config.temperature,
            max_completion_tokens: self.config.max_completion_tokens,
            stream: false,
        };
        let request = &request;

        self.guard
            .retry
            .run(cancel, |attempt| async move {
                debug!(attempt, endpoint = %self.guard.endpoint, "service attempt");
                self.guard.breaker.call(|| self.attempt(request)).await
            })
            .await
    }

    async fn attempt(&self, request: &GenerationRequest) -> Result<String> {
        let pool = &self.guard.pool;
        let conn = pool.acquire(&self.guard.endpoint)?;
        let client = conn.client().clone();

        match tokio::time::timeout(self.config.call_timeout, client.generate(request)).await {
            Err(_) => {
                pool.release(conn, CallOutcome::Failure);
                Err(Error::Timeout(self.config.call_timeout))
            }
            Ok(Ok(text)) => {
                pool.release(conn, CallOutcome::Success);
                Ok(text)
            }
            Ok(Err(err)) => {
                let outcome = match err.kind {
                    ServiceErrorKind::Transient | ServiceErrorKind::Timeout => CallOutcome::Failure,
                    _ => CallOutcome::Neutral,
                };
                pool.release(conn, outcome);
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl TaskRunner for AgentExecutor {
    async fn run(
        &self,
        task: &Task,
        inputs: &[Artifact],
        cancel: CancellationToken,
    ) -> Result<TaskResult> {
        let request = AgentRequest::for_task(task, inputs);
        let output = self.execute(&request, Some(&cancel)).await?;
        Ok(TaskResult::new(output.artifacts, output.raw_text))
    }
}
