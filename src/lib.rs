//! Conductor: a task-orchestration engine for role-specialized text
//! generation agents.
//!
//! Layers, leaf first:
//! - [`resilience`]: retry, circuit breaker and connection pool
//! - [`agent`]: one task, one guarded round-trip to the service
//! - [`extract`]: generated text to file artifacts
//! - [`orchestration`]: dependency-aware, bounded-concurrency scheduling
//! - [`workflow`]: step graphs, checkpoints and resume

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod extract;
pub mod log;
pub mod orchestration;
pub mod resilience;
pub mod util;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
