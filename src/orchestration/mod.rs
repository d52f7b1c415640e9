//! Orchestration layer: dependency-aware, bounded-concurrency execution of
//! task batches.

mod scheduler;

pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerEvent, SchedulerOutcome, TaskRunner,
    DEFAULT_MAX_CONCURRENCY,
};
