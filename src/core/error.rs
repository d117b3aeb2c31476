//! Error types for graph validation, action dispatch and the engine

use thiserror::Error;
use uuid::Uuid;

/// Structural defects found while validating a pipeline graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("pipeline has no nodes")]
    EmptyPipeline,

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("node id '{0}' is reserved")]
    ReservedNodeId(String),

    #[error("trigger node '{0}' does not exist")]
    MissingTrigger(String),

    #[error("trigger node '{id}' has type '{node_type}', which cannot start a pipeline")]
    NotTriggerCapable { id: String, node_type: String },

    #[error("edge '{edge_id}' references unknown {end} node '{node_id}'")]
    DanglingEdge {
        edge_id: String,
        end: &'static str,
        node_id: String,
    },

    #[error("node '{0}' has a retry policy with zero max attempts")]
    InvalidRetryPolicy(String),
}

/// Failure reported by an action handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The action ran and failed
    #[error("{message}")]
    Failed { message: String, retryable: bool },

    /// The node's inputs cannot be used by this action; retrying will not help
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The action did not finish within the node's timeout
    #[error("timed out after {0}ms")]
    Timeout(u64),
}

impl ActionError {
    /// A failure that the node's retry policy may retry
    pub fn retryable(message: impl Into<String>) -> Self {
        ActionError::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that must not be retried even when a policy exists
    pub fn fatal(message: impl Into<String>) -> Self {
        ActionError::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ActionError::Failed { retryable, .. } => *retryable,
            ActionError::InvalidInput(_) => false,
            ActionError::Timeout(_) => true,
        }
    }
}

/// Errors surfaced by the execution engine to its callers
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pipeline validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("pipeline '{0}' not found")]
    PipelineNotFound(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),

    /// Every compare-and-set attempt lost to a concurrent writer
    #[error("execution {0} kept changing under concurrent writers")]
    Conflict(Uuid),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        EngineError::Store(err)
    }
}
