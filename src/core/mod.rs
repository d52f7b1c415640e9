//! Core domain models for the conductor engine.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system, including tasks, artifacts, roles and the
//! execution DAG.

pub mod artifact;
pub mod dag;
pub mod role;
pub mod task;

pub use artifact::Artifact;
pub use dag::TaskDAG;
pub use role::Role;
pub use task::{Task, TaskError, TaskId, TaskResult, TaskStatus};
