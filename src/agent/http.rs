//! HTTP text-generation client built on reqwest.
//!
//! Speaks an OpenAI-style chat-completions wire format. Failed responses are
//! classified by [`classify_response`], which is kept free of I/O so it can
//! be tested directly.

use super::client::{ClientFactory, GenerationRequest, ServiceError, ServiceErrorKind, TextGenClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    context_limit: Option<usize>,
    #[serde(default)]
    prompt_tokens: Option<usize>,
}

impl ErrorBody {
    fn is_context_exceeded(&self) -> bool {
        [self.kind.as_deref(), self.code.as_deref()]
            .into_iter()
            .flatten()
            .any(|tag| tag == "context_size_exceeded" || tag == "context_length_exceeded")
    }
}

/// "maximum context length is 8192 tokens"
static LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)maximum context length is (\d+)").unwrap());

/// "your messages resulted in 9000 tokens"
static PROMPT_TOKENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:resulted in|requested) (\d+) tokens").unwrap());

fn capture_number(pattern: &Regex, text: &str) -> Option<usize> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Classify a non-success HTTP response.
///
/// 408, 429 and 5xx are transient; 401 and 403 are authentication
/// failures; 400, 413 and 422 carrying a context-size tag are context
/// budget failures; every other 4xx is a validation failure.
pub fn classify_response(status: u16, body: &str) -> ServiceError {
    let parsed: ErrorBody = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|env| env.error)
        .unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| body.trim().chars().take(200).collect());

    let kind = match status {
        408 | 429 | 500..=599 => ServiceErrorKind::Transient,
        401 | 403 => ServiceErrorKind::Authentication,
        400 | 413 | 422 if parsed.is_context_exceeded() => ServiceErrorKind::ContextSizeExceeded,
        _ => ServiceErrorKind::Validation,
    };

    let mut err = ServiceError::new(kind, message).with_status(status);
    if kind == ServiceErrorKind::ContextSizeExceeded {
        err.context_limit = parsed
            .context_limit
            .or_else(|| capture_number(&LIMIT_RE, &err.message));
        err.prompt_tokens = parsed
            .prompt_tokens
            .or_else(|| capture_number(&PROMPT_TOKENS_RE, &err.message));
    }
    err
}

fn classify_transport(err: &reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::new(ServiceErrorKind::Timeout, err.to_string())
    } else {
        ServiceError::transient(err.to_string())
    }
}

/// reqwest-backed [`TextGenClient`].
pub struct HttpClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpClient {
    pub fn new(http: reqwest::Client, endpoint: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl TextGenClient for HttpClient {
    async fn generate(&self, request: &GenerationRequest) -> std::result::Result<String, ServiceError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.role_instructions,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_completion_tokens,
            // Responses are always read whole.
            stream: false,
        };

        let mut builder = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await.map_err(|e| classify_transport(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            debug!(endpoint = %self.endpoint, status = status.as_u16(), "generation request failed");
            return Err(classify_response(status.as_u16(), &text));
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| classify_transport(&e))?;
        Ok(parsed
            .choices
            .into_iter()
            .filter_map(|choice| choice.message.content)
            .collect::<Vec<_>>()
            .join(""))
    }
}

/// Builds [`HttpClient`] handles; each handle owns its own connection pool.
pub struct HttpClientFactory {
    model: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(model: &str, api_key: Option<String>, request_timeout: Duration) -> Self {
        Self {
            model: model.to_string(),
            api_key,
            request_timeout,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self, endpoint: &str) -> Result<Arc<dyn TextGenClient>> {
        let http = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| Error::Validation(format!("failed to build HTTP client: {}", e)))?;
        Ok(Arc::new(HttpClient::new(
            http,
            endpoint,
            &self.model,
            self.api_key.clone(),
        )))
    }
}
