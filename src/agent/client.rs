//! Text-generation service contract.
//!
//! The executor talks to the service only through [`TextGenClient`]; the
//! pool builds clients with a [`ClientFactory`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub role_instructions: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_completion_tokens: u32,
    pub stream: bool,
}

/// Classification of a failed service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    /// Connection reset, 5xx, rate limiting.
    Transient,
    Timeout,
    ContextSizeExceeded,
    Authentication,
    Validation,
}

/// Structured error returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
    #[serde(default)]
    pub status: Option<u16>,
    /// The service's actual context limit, when it reports one.
    #[serde(default)]
    pub context_limit: Option<usize>,
    #[serde(default)]
    pub prompt_tokens: Option<usize>,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            context_limit: None,
            prompt_tokens: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Transient, message)
    }

    pub fn context_exceeded(limit: Option<usize>, prompt_tokens: Option<usize>) -> Self {
        Self {
            context_limit: limit,
            prompt_tokens,
            ..Self::new(ServiceErrorKind::ContextSizeExceeded, "context size exceeded")
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<ServiceError> for Error {
    fn from(err: ServiceError) -> Self {
        match err.kind {
            ServiceErrorKind::Transient => Error::TransientNetwork(err.to_string()),
            // The executor's own deadline produces Timeout with the real duration.
            ServiceErrorKind::Timeout => Error::TransientNetwork(format!("timeout: {}", err)),
            ServiceErrorKind::ContextSizeExceeded => Error::ContextBudgetExceeded {
                limit: err.context_limit,
                prompt_tokens: err.prompt_tokens,
            },
            ServiceErrorKind::Authentication => Error::Authentication(err.to_string()),
            ServiceErrorKind::Validation => Error::Validation(err.to_string()),
        }
    }
}

/// A handle on the text-generation service.
#[async_trait]
pub trait TextGenClient: Send + Sync {
    /// Perform one generation round-trip.
    async fn generate(&self, request: &GenerationRequest) -> std::result::Result<String, ServiceError>;
}

/// Builds client handles for an endpoint.
pub trait ClientFactory: Send + Sync {
    fn create(&self, endpoint: &str) -> Result<Arc<dyn TextGenClient>>;
}
