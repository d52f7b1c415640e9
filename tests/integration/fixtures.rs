//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted text-generation service and its client factory
//! - Executors wired to that service
//! - A recording task runner that tracks dispatch order and concurrency

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conductor::agent::{
    AgentExecutor, ClientFactory, ExecutorConfig, GenerationRequest, ServiceError, ServiceGuard,
    TextGenClient,
};
use conductor::core::{Artifact, Task, TaskResult};
use conductor::orchestration::TaskRunner;
use conductor::resilience::{BreakerConfig, CircuitBreaker, ConnectionPool, PoolConfig, RetryPolicy};
use conductor::{Error, Result};

pub const ENDPOINT: &str = "scripted://textgen";

pub type Reply = std::result::Result<String, ServiceError>;
type Responder = Box<dyn Fn(&GenerationRequest) -> Reply + Send + Sync>;

/// In-memory text-generation service.
///
/// Queued replies are served first; after that the responder decides.
/// Every request is recorded.
pub struct ScriptedService {
    queue: Mutex<VecDeque<Reply>>,
    responder: Responder,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedService {
    pub fn new(responder: impl Fn(&GenerationRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answers every request with a single markdown file named after the
    /// first line of the task description.
    pub fn echo() -> Arc<Self> {
        Self::new(|req| {
            let name = task_line(&req.user_prompt)
                .split_whitespace()
                .last()
                .unwrap_or("out")
                .to_string();
            Ok(format!("File: {}.md\n```markdown\n{}\n```\n", name, task_line(&req.user_prompt)))
        })
    }

    pub fn push(&self, reply: Reply) {
        self.queue.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// The line following `## Task (...)` in a user prompt.
pub fn task_line(prompt: &str) -> &str {
    prompt.lines().nth(1).unwrap_or("").trim()
}

#[async_trait]
impl TextGenClient for ScriptedService {
    async fn generate(&self, request: &GenerationRequest) -> std::result::Result<String, ServiceError> {
        self.requests.lock().unwrap().push(request.clone());
        let queued = self.queue.lock().unwrap().pop_front();
        match queued {
            Some(reply) => reply,
            None => (self.responder)(request),
        }
    }
}

/// Hands out the same scripted service for every endpoint.
pub struct ScriptedFactory(pub Arc<ScriptedService>);

impl ClientFactory for ScriptedFactory {
    fn create(&self, _endpoint: &str) -> Result<Arc<dyn TextGenClient>> {
        Ok(self.0.clone())
    }
}

/// Retry policy with short, deterministic delays.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        jitter: false,
    }
}

/// Executor wired to `service` through a fresh pool and breaker.
pub fn executor_for(
    service: Arc<ScriptedService>,
    retry: RetryPolicy,
    breaker: BreakerConfig,
) -> (Arc<AgentExecutor>, Arc<CircuitBreaker>) {
    let pool = ConnectionPool::new(PoolConfig::default(), Arc::new(ScriptedFactory(service)));
    let breaker = Arc::new(CircuitBreaker::new(ENDPOINT, breaker));
    let guard = ServiceGuard {
        retry,
        breaker: breaker.clone(),
        pool,
        endpoint: ENDPOINT.to_string(),
    };
    (Arc::new(AgentExecutor::new(guard, ExecutorConfig::default())), breaker)
}

/// Executor with default breaker settings and fast retries.
pub fn default_executor(service: Arc<ScriptedService>) -> Arc<AgentExecutor> {
    executor_for(service, fast_retry(3), BreakerConfig::default()).0
}

/// What the recording runner observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    Start(String),
    Finish(String),
}

/// Task runner that sleeps per task and records a start/finish timeline.
#[derive(Default)]
pub struct RecordingRunner {
    pub delays: HashMap<String, Duration>,
    pub failing: HashSet<String>,
    timeline: Mutex<Vec<Mark>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingRunner {
    pub fn with_delays(delays: &[(&str, u64)]) -> Self {
        Self {
            delays: delays
                .iter()
                .map(|(id, ms)| (id.to_string(), Duration::from_millis(*ms)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn timeline(&self) -> Vec<Mark> {
        self.timeline.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn position(&self, mark: &Mark) -> usize {
        self.timeline()
            .iter()
            .position(|m| m == mark)
            .unwrap_or_else(|| panic!("{:?} not recorded", mark))
    }
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(&self, task: &Task, _inputs: &[Artifact], _cancel: CancellationToken) -> Result<TaskResult> {
        let id = task.id.to_string();
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.timeline.lock().unwrap().push(Mark::Start(id.clone()));

        let delay = self.delays.get(&id).copied().unwrap_or(Duration::from_millis(5));
        tokio::time::sleep(delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.timeline.lock().unwrap().push(Mark::Finish(id.clone()));

        if self.failing.contains(&id) {
            return Err(Error::Validation(format!("{} failed", id)));
        }
        let artifact = Artifact::new(format!("{}.txt", id), id.clone(), task.id.clone(), task.role);
        Ok(TaskResult::new(vec![artifact], id))
    }
}
