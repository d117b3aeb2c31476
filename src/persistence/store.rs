//! SQLite-based persistence store

use crate::core::{Execution, Pipeline};
use crate::persistence::{ExecutionSummary, PipelineStat, PipelineStats, Store};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// SQLite store keeping definitions and execution records as JSON bodies
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a store; `":memory:"` gives a private in-memory database
    pub async fn new(db_path: &str) -> Result<Self> {
        if db_path == ":memory:" {
            // Every connection to :memory: is its own database
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .context("Failed to open in-memory database")?;
            let store = Self { pool };
            store.init().await?;
            return Ok(store);
        }
        Self::open(Path::new(db_path)).await
    }

    /// Open (creating if needed) a database file
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database {}", path.display()))?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Location used when no path is given
    pub fn default_path() -> PathBuf {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        data_dir.join("pipeflow").join("pipeflow.db")
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let db_path = Self::default_path();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Self::open(&db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                pipeline_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                revision INTEGER NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_executions_pipeline ON executions(pipeline_id)",
            "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)",
            "CREATE INDEX IF NOT EXISTS idx_executions_created_at ON executions(created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_stats (
                pipeline_id TEXT PRIMARY KEY,
                executions INTEGER NOT NULL DEFAULT 0,
                successes INTEGER NOT NULL DEFAULT 0,
                failures INTEGER NOT NULL DEFAULT 0
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize database schema")?;
        }

        Ok(())
    }

    fn decode_execution(body: &str) -> Result<Execution> {
        serde_json::from_str(body).context("Failed to decode stored execution")
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        if let Some(existing) = self.load_pipeline(&pipeline.id, Some(pipeline.version)).await? {
            if &existing != pipeline {
                anyhow::bail!(
                    "Pipeline '{}' version {} already exists with a different definition",
                    pipeline.id,
                    pipeline.version
                );
            }
            return Ok(());
        }

        let body = serde_json::to_string(pipeline).context("Failed to encode pipeline")?;
        sqlx::query("INSERT INTO pipelines (id, version, name, body) VALUES (?1, ?2, ?3, ?4)")
            .bind(&pipeline.id)
            .bind(pipeline.version as i64)
            .bind(&pipeline.name)
            .bind(body)
            .execute(&self.pool)
            .await
            .context("Failed to save pipeline")?;

        Ok(())
    }

    async fn load_pipeline(&self, pipeline_id: &str, version: Option<u32>) -> Result<Option<Pipeline>> {
        let row = match version {
            Some(version) => {
                sqlx::query("SELECT body FROM pipelines WHERE id = ?1 AND version = ?2")
                    .bind(pipeline_id)
                    .bind(version as i64)
                    .fetch_optional(&self.pool)
                    .await
            }
            None => {
                sqlx::query(
                    "SELECT body FROM pipelines WHERE id = ?1 ORDER BY version DESC LIMIT 1",
                )
                .bind(pipeline_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .context("Failed to load pipeline")?;

        row.map(|row| {
            let body: String = row.get("body");
            serde_json::from_str(&body).context("Failed to decode stored pipeline")
        })
        .transpose()
    }

    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let body = serde_json::to_string(execution).context("Failed to encode execution")?;
        sqlx::query(
            r#"
            INSERT INTO executions
            (id, pipeline_id, pipeline_version, status, revision, body, created_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.pipeline_id)
        .bind(execution.pipeline_version as i64)
        .bind(execution.status.as_str())
        .bind(execution.revision as i64)
        .bind(body)
        .bind(execution.created_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .context("Failed to create execution")?;

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT body FROM executions WHERE id = ?1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;

        row.map(|row| Self::decode_execution(&row.get::<String, _>("body")))
            .transpose()
    }

    async fn save_execution(&self, execution: &Execution, expected_revision: u64) -> Result<bool> {
        let body = serde_json::to_string(execution).context("Failed to encode execution")?;
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?1, revision = ?2, body = ?3, completed_at = ?4
            WHERE id = ?5 AND revision = ?6
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.revision as i64)
        .bind(body)
        .bind(execution.completed_at)
        .bind(execution.id.to_string())
        .bind(expected_revision as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save execution")?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM executions WHERE id = ?1")
            .bind(execution.id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check execution")?
            .is_some();
        if !exists {
            anyhow::bail!("Execution {} does not exist", execution.id);
        }
        Ok(false)
    }

    async fn list_executions(
        &self,
        pipeline_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match pipeline_id {
            Some(pipeline_id) => {
                sqlx::query(
                    r#"
                    SELECT body FROM executions
                    WHERE pipeline_id = ?1
                    ORDER BY created_at DESC
                    LIMIT ?2
                    "#,
                )
                .bind(pipeline_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT body FROM executions ORDER BY created_at DESC LIMIT ?1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to list executions")?;

        rows.iter()
            .map(|row| {
                let execution = Self::decode_execution(&row.get::<String, _>("body"))?;
                Ok(ExecutionSummary::from(&execution))
            })
            .collect()
    }

    async fn increment_pipeline_stat(&self, pipeline_id: &str, stat: PipelineStat) -> Result<()> {
        let column = stat.column();
        let statement = format!(
            "INSERT INTO pipeline_stats (pipeline_id, {column}) VALUES (?1, 1) \
             ON CONFLICT(pipeline_id) DO UPDATE SET {column} = {column} + 1"
        );
        sqlx::query(&statement)
            .bind(pipeline_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to increment {} for {}", column, pipeline_id))?;

        Ok(())
    }

    async fn pipeline_stats(&self, pipeline_id: &str) -> Result<PipelineStats> {
        let row = sqlx::query(
            "SELECT executions, successes, failures FROM pipeline_stats WHERE pipeline_id = ?1",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load pipeline stats")?;

        Ok(row
            .map(|row| PipelineStats {
                executions: row.get::<i64, _>("executions") as u64,
                successes: row.get::<i64, _>("successes") as u64,
                failures: row.get::<i64, _>("failures") as u64,
            })
            .unwrap_or_default())
    }
}
