//! Pipeline and engine configuration from YAML

use crate::core::error::ValidationError;
use crate::core::graph::{Edge, Node, OnError, Pipeline, RetryPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Top-level pipeline definition loaded from YAML (or JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline identifier
    pub id: String,

    /// Definition version; versions are immutable once stored
    #[serde(default = "default_version")]
    pub version: u32,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Id of the node that starts every execution
    #[serde(alias = "triggerNodeId")]
    pub trigger_node_id: String,

    /// Settings applied to every node that does not set its own
    #[serde(default)]
    pub defaults: NodeDefaults,

    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn default_version() -> u32 {
    1
}

/// Pipeline-wide node settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDefaults {
    #[serde(default, alias = "retryPolicy")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,

    #[serde(default, alias = "onError")]
    pub on_error: Option<OnError>,
}

/// Node as written in a definition file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub inputs: Map<String, Value>,

    #[serde(default, alias = "retryPolicy")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,

    #[serde(default, alias = "onError")]
    pub on_error: Option<OnError>,
}

impl PipelineConfig {
    /// Load a pipeline definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a pipeline definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig =
            serde_yaml::from_str(yaml).context("Failed to parse pipeline definition")?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation of the graph this definition describes
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.to_pipeline().validate()
    }

    /// Convert the definition to the engine's graph model
    pub fn to_pipeline(&self) -> Pipeline {
        let nodes = self
            .nodes
            .iter()
            .map(|node| Node {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
                label: node.label.clone(),
                inputs: node.inputs.clone(),
                retry_policy: node
                    .retry_policy
                    .clone()
                    .or_else(|| self.defaults.retry_policy.clone()),
                timeout_ms: node.timeout_ms.or(self.defaults.timeout_ms),
                on_error: node
                    .on_error
                    .or(self.defaults.on_error)
                    .unwrap_or_default(),
            })
            .collect();

        let edges = self
            .edges
            .iter()
            .map(|edge| {
                let mut edge = edge.clone();
                if edge.id.is_empty() {
                    edge.id = match &edge.source_handle {
                        Some(handle) => format!(
                            "{}:{}->{}",
                            edge.source_node_id, handle, edge.target_node_id
                        ),
                        None => format!("{}->{}", edge.source_node_id, edge.target_node_id),
                    };
                }
                edge
            })
            .collect();

        Pipeline {
            id: self.id.clone(),
            version: self.version,
            name: if self.name.is_empty() {
                self.id.clone()
            } else {
                self.name.clone()
            },
            nodes,
            edges,
            trigger_node_id: self.trigger_node_id.clone(),
        }
    }
}

/// Rolling-window limit on how many step messages the pool starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_messages: u32,
    pub window_ms: u64,
}

/// Worker pool and engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum step messages processed at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// How long a received message stays invisible before redelivery
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Compare-and-set attempts per step commit before giving up
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,

    /// Priority for executions started without one
    #[serde(default)]
    pub default_priority: i32,

    /// Longest a worker waits on an empty queue before re-checking shutdown
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_commit_attempts() -> u32 {
    8
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            rate_limit: None,
            lease_ms: default_lease_ms(),
            commit_attempts: default_commit_attempts(),
            default_priority: 0,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).context("Failed to parse engine config")?;
        if config.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if config.commit_attempts == 0 {
            anyhow::bail!("commit_attempts must be at least 1");
        }
        if let Some(limit) = &config.rate_limit {
            if limit.max_messages == 0 || limit.window_ms == 0 {
                anyhow::bail!("rate_limit needs a positive max_messages and window_ms");
            }
        }
        Ok(config)
    }
}
