//! Integration test suite for conductor.
//!
//! These tests wire the real components together (executor, resilience
//! stack, scheduler, workflow engine and checkpoint stores) against a
//! scripted in-memory text-generation service.
//!
//! # Test Categories
//!
//! - `resilience`: retry, breaker and truncation behaviour seen through the executor
//! - `scheduler`: dependency ordering and the concurrency bound
//! - `workflow_e2e`: full runs from template to artifacts
//! - `resume`: cancellation, checkpoints and resume
//!
//! # CI Compatibility
//!
//! No test opens a network connection.

mod fixtures;

mod resilience;
mod resume;
mod scheduler;
mod workflow_e2e;
