use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Could not determine home directory")]
    NoHomeDir,

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Context budget exceeded (limit: {limit:?} tokens, prompt: {prompt_tokens:?} tokens)")]
    ContextBudgetExceeded {
        limit: Option<usize>,
        prompt_tokens: Option<usize>,
    },

    #[error("Circuit open for service: {service}")]
    CircuitOpen { service: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Task {task} depends on failed task {dependency}")]
    DependencyFailed { task: String, dependency: String },

    #[error("Cyclic dependency detected at: {0}")]
    CyclicDependency(String),

    #[error("Connection pool exhausted for {endpoint} (max: {max})")]
    PoolExhausted { endpoint: String, max: usize },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<Error> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Scheduling stalled with unmet dependencies: {0}")]
    SchedulingStalled(String),

    #[error("Invalid workflow template: {0}")]
    InvalidTemplate(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Serializable classification of an [`Error`].
///
/// Tasks, run error records and checkpoints store the kind plus the
/// rendered message, never the error value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Serialization,
    TransientNetwork,
    Timeout,
    ContextBudgetExceeded,
    CircuitOpen,
    Validation,
    Authentication,
    DependencyFailed,
    CyclicDependency,
    PoolExhausted,
    Checkpoint,
    RetryExhausted,
    Cancelled,
    SchedulingStalled,
    InvalidTemplate,
    TaskNotFound,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ContextBudgetExceeded => "context_budget_exceeded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SchedulingStalled => "scheduling_stalled",
            ErrorKind::InvalidTemplate => "invalid_template",
            ErrorKind::TaskNotFound => "task_not_found",
        };
        write!(f, "{}", name)
    }
}

impl Error {
    /// Map this error to its serializable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::NoHomeDir => ErrorKind::Io,
            Error::Json(_) | Error::TomlParse(_) | Error::TomlSerialize(_) => {
                ErrorKind::Serialization
            }
            Error::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ContextBudgetExceeded { .. } => ErrorKind::ContextBudgetExceeded,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            Error::CyclicDependency(_) => ErrorKind::CyclicDependency,
            Error::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Error::Checkpoint(_) => ErrorKind::Checkpoint,
            Error::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::SchedulingStalled(_) => ErrorKind::SchedulingStalled,
            Error::InvalidTemplate(_) => ErrorKind::InvalidTemplate,
            Error::TaskNotFound(_) => ErrorKind::TaskNotFound,
        }
    }

    /// Whether the retry policy may attempt the operation again.
    ///
    /// Pool exhaustion is terminal for the attempt that hit it but is
    /// retried like a network hiccup.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientNetwork(_) | Error::Timeout(_) | Error::PoolExhausted { .. }
        )
    }

    /// Whether this failure counts against a circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, Error::TransientNetwork(_) | Error::Timeout(_))
    }
}
