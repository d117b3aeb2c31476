//! Pipeline execution: the engine, its work queue and the worker pool

pub mod engine;
pub mod queue;
pub mod retry;
pub mod worker;

pub use engine::{
    EventHandler, ExecutionEngine, ExecutionEvent, ExecutionProgress, StartOptions, StartedExecution,
};
pub use queue::{Delivery, EnqueueOptions, InMemoryQueue, WorkQueue};
pub use worker::{RateLimiter, WorkerPool};
