//! Application-registered capabilities

use crate::actions::{ActionHandler, ActionInput, StepResult};
use crate::core::ActionError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// An external service a pipeline node can call
///
/// Implementations receive the resolved inputs through the snapshot and
/// return the node's output. Plain errors are treated as transient and
/// retried according to the node's policy; return an [`ActionError`]
/// (for instance [`ActionError::InvalidInput`]) to opt out.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, input: &ActionInput) -> anyhow::Result<Value>;
}

/// Adapts a [`Capability`] to the handler interface
pub struct CapabilityHandler<C> {
    capability: C,
}

impl<C: Capability> CapabilityHandler<C> {
    pub fn new(capability: C) -> Self {
        Self { capability }
    }
}

#[async_trait]
impl<C: Capability> ActionHandler for CapabilityHandler<C> {
    async fn execute(&self, input: ActionInput) -> Result<StepResult, ActionError> {
        debug!(
            node_type = %input.node.node_type,
            step_id = %input.node.id,
            "Invoking capability"
        );
        match self.capability.invoke(&input).await {
            Ok(output) => Ok(StepResult::success(output)),
            Err(err) => Err(match err.downcast::<ActionError>() {
                Ok(action_error) => action_error,
                Err(other) => ActionError::retryable(format!("{:#}", other)),
            }),
        }
    }
}
