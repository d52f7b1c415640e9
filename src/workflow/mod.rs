//! Workflow state machine: declarative step graphs driven through the
//! scheduler, with checkpointing and resume.

pub mod checkpoint;
pub mod engine;
pub mod graph;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use engine::{
    render_template, DefaultEvaluator, EngineConfig, OutcomeEvaluator, WorkflowEngine, WorkflowEvent,
};
pub use graph::{EdgeCondition, Frontier, StepGraph};
pub use types::{
    Predecessor, RunError, RunId, RunStatus, StepOutcome, StepTemplate, WorkflowRun, WorkflowTemplate,
};
