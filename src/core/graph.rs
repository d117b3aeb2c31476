//! Pipeline graph model - nodes, edges and structural validation

use crate::core::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Handle used by edges that do not name one
pub const DEFAULT_HANDLE: &str = "default";

/// Context key holding the initiating payload; no node may use it as an id
pub const TRIGGER_KEY: &str = "trigger";

/// Coarse classification of a node type string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// `trigger` or `trigger.*` - an entry point
    Trigger,
    /// `logic.*` - built-in operators provided by the engine
    Logic,
    /// Anything else - a capability registered by the application
    Capability,
}

impl NodeKind {
    pub fn of(node_type: &str) -> Self {
        if node_type == "trigger" || node_type.starts_with("trigger.") {
            NodeKind::Trigger
        } else if node_type.starts_with("logic.") {
            NodeKind::Logic
        } else {
            NodeKind::Capability
        }
    }
}

/// What to do once a node's failure is not (or no longer) retried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Fail the whole execution
    #[default]
    Fail,
    /// Skip the node and follow its default edge
    Continue,
    /// Same as `Fail` once the retry policy is exhausted
    Retry,
}

/// Delay strategy between a failed attempt and its retry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    #[default]
    Fixed,
    Exponential,
}

/// Per-node retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,

    #[serde(default, alias = "backoffType")]
    pub backoff_type: BackoffType,

    /// Base delay in milliseconds
    #[serde(default, alias = "backoffDelay")]
    pub backoff_delay: u64,
}

impl RetryPolicy {
    /// Whether a failure at zero-based attempt `retry_count` may be retried
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) < self.max_attempts
    }
}

/// A typed unit of work in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,

    #[serde(rename = "type", alias = "node_type")]
    pub node_type: String,

    #[serde(default)]
    pub label: String,

    /// Input configuration; strings may contain `{{path}}` references
    #[serde(default)]
    pub inputs: Map<String, Value>,

    #[serde(default, alias = "retryPolicy", skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default, alias = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, alias = "onError")]
    pub on_error: OnError,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            label: String::new(),
            inputs: Map::new(),
            retry_policy: None,
            timeout_ms: None,
            on_error: OnError::Fail,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::of(&self.node_type)
    }
}

/// A directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: String,

    #[serde(alias = "sourceNodeId", alias = "source")]
    pub source_node_id: String,

    #[serde(alias = "targetNodeId", alias = "target")]
    pub target_node_id: String,

    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source_node_id: source,
            target_node_id: target,
            source_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        let handle = handle.into();
        self.id = format!("{}:{}->{}", self.source_node_id, handle, self.target_node_id);
        self.source_handle = Some(handle);
        self
    }

    /// The handle this edge answers to
    pub fn handle(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(DEFAULT_HANDLE)
    }
}

/// Immutable definition of one pipeline version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub name: String,

    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,

    #[serde(alias = "triggerNodeId")]
    pub trigger_node_id: String,
}

fn default_version() -> u32 {
    1
}

impl Pipeline {
    /// Get a node by ID
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The entry node, if the definition is sound
    pub fn trigger_node(&self) -> Option<&Node> {
        self.node(&self.trigger_node_id)
    }

    /// Check the structural invariants an execution relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.nodes.is_empty() {
            return Err(ValidationError::EmptyPipeline);
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id == TRIGGER_KEY {
                return Err(ValidationError::ReservedNodeId(node.id.clone()));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
            if node.retry_policy.as_ref().is_some_and(|p| p.max_attempts == 0) {
                return Err(ValidationError::InvalidRetryPolicy(node.id.clone()));
            }
        }

        let trigger = self
            .trigger_node()
            .ok_or_else(|| ValidationError::MissingTrigger(self.trigger_node_id.clone()))?;
        if trigger.kind() != NodeKind::Trigger {
            return Err(ValidationError::NotTriggerCapable {
                id: trigger.id.clone(),
                node_type: trigger.node_type.clone(),
            });
        }

        for edge in &self.edges {
            for (end, node_id) in [("source", &edge.source_node_id), ("target", &edge.target_node_id)] {
                if !ids.contains(node_id.as_str()) {
                    return Err(ValidationError::DanglingEdge {
                        edge_id: edge.id.clone(),
                        end,
                        node_id: node_id.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// First node reached from `from` through `handle`, or `None` at the end of a path
    pub fn next_node(&self, from: &str, handle: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.source_node_id == from && e.handle() == handle)
            .map(|e| e.target_node_id.as_str())
    }

    /// Every node reached from `from` through `handle`, in definition order
    pub fn next_nodes(&self, from: &str, handle: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.source_node_id == from && e.handle() == handle)
            .map(|e| e.target_node_id.as_str())
            .collect()
    }

    /// Distinct source nodes with an edge into `node_id`
    pub fn upstream_of(&self, node_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.target_node_id == node_id)
            .filter(|e| seen.insert(e.source_node_id.as_str()))
            .map(|e| e.source_node_id.clone())
            .collect()
    }

    /// `starts` plus every node reachable from them over any edge
    pub fn reachable_from<'a, I>(&'a self, starts: I) -> HashSet<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = starts.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            stack.extend(
                self.edges
                    .iter()
                    .filter(|e| e.source_node_id == id)
                    .map(|e| e.target_node_id.as_str()),
            );
        }
        seen
    }
}
