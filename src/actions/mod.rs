//! Action dispatch - the handlers the engine runs for each node type
//!
//! Every node type maps to an [`ActionHandler`]. The engine hands the
//! handler an owned [`ActionInput`] snapshot and applies whatever the
//! handler declares in its [`StepResult`]; handlers never touch the
//! execution record themselves.

pub mod capability;
pub mod logic;

use crate::core::{ActionError, ExecutionContext, Node, NodeKind, NodeState, DEFAULT_HANDLE};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use capability::{Capability, CapabilityHandler};

/// Read-only view of everything a handler may look at
#[derive(Debug, Clone)]
pub struct ActionInput {
    pub node: Node,
    /// Node inputs after template resolution
    pub inputs: Map<String, Value>,
    pub context: ExecutionContext,
    /// This node's engine-owned state, if any
    pub node_state: Option<NodeState>,
    /// Nodes with an edge into this one
    pub upstream: Vec<String>,
    /// Upstream nodes that have completed or been skipped
    pub settled: HashSet<String>,
    /// Unsettled upstream nodes that outstanding work can still reach
    pub pending_upstream: HashSet<String>,
    pub execution_id: Uuid,
    pub retry_count: u32,
}

impl ActionInput {
    /// First present input among `keys`, so `compareValue` and `compare_value` both work
    pub fn input(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().find_map(|key| self.inputs.get(*key))
    }

    pub fn input_or_null(&self, keys: &[&str]) -> &Value {
        self.input(keys).unwrap_or(&Value::Null)
    }
}

/// How a handler wants its node state changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StateUpdate {
    #[default]
    Keep,
    Set(NodeState),
    Clear,
}

/// What a handler declares after a successful dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Write `output` to the context and follow edges labelled `handle`
    Success {
        output: Value,
        handle: String,
        state: StateUpdate,
    },
    /// Dispatch the same step again after `delay`
    Suspend { delay: Duration, state: StateUpdate },
    /// Nothing to advance yet; another arrival will move the node on
    Wait { state: StateUpdate },
}

impl StepResult {
    /// Success on the default handle
    pub fn success(output: Value) -> Self {
        Self::branch(output, DEFAULT_HANDLE)
    }

    pub fn branch(output: Value, handle: impl Into<String>) -> Self {
        StepResult::Success {
            output,
            handle: handle.into(),
            state: StateUpdate::Keep,
        }
    }

    pub fn with_state(mut self, update: StateUpdate) -> Self {
        match &mut self {
            StepResult::Success { state, .. }
            | StepResult::Suspend { state, .. }
            | StepResult::Wait { state } => *state = update,
        }
        self
    }

    pub fn state(&self) -> &StateUpdate {
        match self {
            StepResult::Success { state, .. }
            | StepResult::Suspend { state, .. }
            | StepResult::Wait { state } => state,
        }
    }
}

/// Handler for one node type
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the node; an error is a handler failure subject to the node's policy
    async fn execute(&self, input: ActionInput) -> Result<StepResult, ActionError>;
}

/// Mapping from node type to handler
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// An empty registry; see [`ActionRegistry::with_builtins`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the trigger and `logic.*` handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("trigger", logic::TriggerHandler);
        registry.register("logic.condition", logic::ConditionHandler);
        registry.register("logic.switch", logic::SwitchHandler);
        registry.register("logic.loop", logic::LoopHandler);
        registry.register("logic.merge", logic::MergeHandler);
        registry.register("logic.delay", logic::DelayHandler);
        registry
    }

    /// Register (or replace) the handler for `node_type`
    pub fn register<H>(&mut self, node_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: ActionHandler + 'static,
    {
        self.handlers.insert(node_type.into(), Arc::new(handler));
        self
    }

    /// Register an application capability under `node_type`
    pub fn register_capability<C>(&mut self, node_type: impl Into<String>, capability: C) -> &mut Self
    where
        C: Capability + 'static,
    {
        self.register(node_type, CapabilityHandler::new(capability))
    }

    /// Handler for `node_type`; `trigger.*` types fall back to `trigger`
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn ActionHandler>> {
        if let Some(handler) = self.handlers.get(node_type) {
            return Some(handler.clone());
        }
        match NodeKind::of(node_type) {
            NodeKind::Trigger => self.handlers.get("trigger").cloned(),
            _ => None,
        }
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.get(node_type).is_some()
    }

    /// Registered node types, sorted
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}
