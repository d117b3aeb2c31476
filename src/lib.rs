//! pipeflow - a queue-driven pipeline execution engine
//!
//! Pipelines are directed graphs of typed nodes. Executions advance one
//! step message at a time: a worker pulls a message off the [`WorkQueue`],
//! the [`ExecutionEngine`] dispatches the node's handler and commits the
//! outcome, and the next messages go back on the queue.

pub mod actions;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use actions::{ActionHandler, ActionInput, ActionRegistry, Capability, StateUpdate, StepResult};
pub use crate::core::config::{EngineConfig, PipelineConfig, RateLimitConfig};
pub use crate::core::{
    ActionError, EngineError, Execution, ExecutionContext, ExecutionStatus, Node, OnError, Pipeline,
    RetryPolicy, StepLog, StepMessage, StepStatus, ValidationError,
};
pub use execution::{
    ExecutionEngine, ExecutionEvent, InMemoryQueue, StartOptions, StartedExecution, WorkQueue,
    WorkerPool,
};
pub use persistence::{InMemoryStore, Store};
