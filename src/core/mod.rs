//! Core domain models for pipelines
//!
//! This module defines the graph a pipeline is made of, the execution
//! record that tracks one run of it, and the pure pieces (templates,
//! conditions) the engine evaluates against that record.

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod state;
pub mod template;

pub use context::*;
pub use error::*;
pub use graph::*;
pub use state::*;
