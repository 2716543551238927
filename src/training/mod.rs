//! Training infrastructure: run context, optimizer and learning-rate
//! schedule, the in-process rank group, metrics, whole-volume evaluation and
//! the epoch-loop orchestrator.

pub mod context;
pub mod distributed;
pub mod evaluate;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use context::RunContext;
pub use trainer::{run, run_with_store, RunPhase, RunReport, Trainer, TrainerConfig};
