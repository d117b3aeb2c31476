//! Persistence layer for pipeline definitions and execution records

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

pub use crate::core::ExecutionStatus;
use crate::core::{Execution, Pipeline};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a pipeline execution, for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Unique execution ID
    pub execution_id: Uuid,

    pub pipeline_id: String,

    pub pipeline_version: u32,

    /// Execution status
    pub status: ExecutionStatus,

    pub created_at: DateTime<Utc>,

    /// When execution completed (if complete)
    pub completed_at: Option<DateTime<Utc>>,

    /// Distinct steps with a completed attempt
    pub completed_steps: usize,

    pub error: Option<String>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id,
            pipeline_id: execution.pipeline_id.clone(),
            pipeline_version: execution.pipeline_version,
            status: execution.status,
            created_at: execution.created_at,
            completed_at: execution.completed_at,
            completed_steps: execution.completed_steps(),
            error: execution.error.clone(),
        }
    }
}

/// Aggregate counter kept per pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStat {
    Executions,
    Successes,
    Failures,
}

impl PipelineStat {
    pub fn column(self) -> &'static str {
        match self {
            PipelineStat::Executions => "executions",
            PipelineStat::Successes => "successes",
            PipelineStat::Failures => "failures",
        }
    }
}

/// Counters for one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
}

impl PipelineStats {
    fn bump(&mut self, stat: PipelineStat) {
        match stat {
            PipelineStat::Executions => self.executions += 1,
            PipelineStat::Successes => self.successes += 1,
            PipelineStat::Failures => self.failures += 1,
        }
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Store a pipeline version; a stored version cannot be changed
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()>;

    /// Load a pipeline version, or the latest one when `version` is `None`
    async fn load_pipeline(&self, pipeline_id: &str, version: Option<u32>) -> Result<Option<Pipeline>>;

    /// Insert a new execution record
    async fn create_execution(&self, execution: &Execution) -> Result<()>;

    /// Load an execution by ID
    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<Execution>>;

    /// Replace the record if its stored revision is still `expected_revision`
    ///
    /// Returns `false` when another writer got there first.
    async fn save_execution(&self, execution: &Execution, expected_revision: u64) -> Result<bool>;

    /// Most recent executions first, optionally for one pipeline
    async fn list_executions(
        &self,
        pipeline_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>>;

    async fn increment_pipeline_stat(&self, pipeline_id: &str, stat: PipelineStat) -> Result<()>;

    async fn pipeline_stats(&self, pipeline_id: &str) -> Result<PipelineStats>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryStore {
    pipelines: RwLock<HashMap<(String, u32), Pipeline>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    stats: RwLock<HashMap<String, PipelineStats>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let mut pipelines = self.pipelines.write().await;
        let key = (pipeline.id.clone(), pipeline.version);
        if let Some(existing) = pipelines.get(&key) {
            if existing != pipeline {
                anyhow::bail!(
                    "Pipeline '{}' version {} already exists with a different definition",
                    pipeline.id,
                    pipeline.version
                );
            }
            return Ok(());
        }
        pipelines.insert(key, pipeline.clone());
        Ok(())
    }

    async fn load_pipeline(&self, pipeline_id: &str, version: Option<u32>) -> Result<Option<Pipeline>> {
        let pipelines = self.pipelines.read().await;
        let found = match version {
            Some(version) => pipelines.get(&(pipeline_id.to_string(), version)),
            None => pipelines
                .iter()
                .filter(|((id, _), _)| id == pipeline_id)
                .max_by_key(|((_, version), _)| *version)
                .map(|(_, pipeline)| pipeline),
        };
        Ok(found.cloned())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            anyhow::bail!("Execution {} already exists", execution.id);
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        let executions = self.executions.read().await;
        Ok(executions.get(&execution_id).cloned())
    }

    async fn save_execution(&self, execution: &Execution, expected_revision: u64) -> Result<bool> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.id) {
            Some(stored) if stored.revision == expected_revision => {
                *stored = execution.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("Execution {} does not exist", execution.id),
        }
    }

    async fn list_executions(
        &self,
        pipeline_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>> {
        let executions = self.executions.read().await;
        let mut matching: Vec<&Execution> = executions
            .values()
            .filter(|e| pipeline_id.map_or(true, |id| e.pipeline_id == id))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(ExecutionSummary::from)
            .collect())
    }

    async fn increment_pipeline_stat(&self, pipeline_id: &str, stat: PipelineStat) -> Result<()> {
        let mut stats = self.stats.write().await;
        stats.entry(pipeline_id.to_string()).or_default().bump(stat);
        Ok(())
    }

    async fn pipeline_stats(&self, pipeline_id: &str) -> Result<PipelineStats> {
        let stats = self.stats.read().await;
        Ok(stats.get(pipeline_id).copied().unwrap_or_default())
    }
}
