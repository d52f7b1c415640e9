//! Agent execution: prompt budgeting, the service client contract and the
//! executor that turns one task into one service round-trip.

pub mod budget;
pub mod client;
pub mod executor;
pub mod http;

pub use client::{ClientFactory, GenerationRequest, ServiceError, ServiceErrorKind, TextGenClient};
pub use executor::{AgentExecutor, AgentOutput, AgentRequest, ExecutorConfig, ServiceGuard};
pub use http::{HttpClient, HttpClientFactory};
