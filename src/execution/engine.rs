//! Main execution engine - drives executions one step message at a time
//!
//! The engine keeps no per-execution state in memory. Each step message is
//! handled by loading the execution record, committing the step start,
//! dispatching the node's handler, then committing the outcome with a
//! revision compare-and-set. Follow-up messages are enqueued only after
//! the commit that produced them succeeded.

use crate::actions::{ActionInput, ActionRegistry, StateUpdate, StepResult};
use crate::core::config::EngineConfig;
use crate::core::template::resolve_inputs;
use crate::core::{
    ActionError, EngineError, Execution, ExecutionStatus, Node, NodeState, OnError, Pipeline,
    StepLog, StepMessage, StepStatus, DEFAULT_HANDLE,
};
use crate::execution::queue::{EnqueueOptions, WorkQueue};
use crate::execution::retry::backoff_delay;
use crate::persistence::{PipelineStat, Store};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        pipeline_id: String,
    },
    StatusChanged {
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        node_type: String,
        retry_count: u32,
    },
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        handle: String,
        next_steps: Vec<String>,
    },
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        retry_count: u32,
        error: String,
    },
    StepRetryScheduled {
        execution_id: Uuid,
        step_id: String,
        retry_count: u32,
        delay: Duration,
    },
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        next_steps: Vec<String>,
    },
    /// Suspended by a delay, or waiting on other branches
    StepWaiting {
        execution_id: Uuid,
        step_id: String,
        resume_after: Option<Duration>,
    },
    ExecutionFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Options for [`ExecutionEngine::start_execution`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Validate only; no record is created and nothing is enqueued
    pub dry_run: bool,
    /// Queue priority for every step of the execution
    pub priority: Option<i32>,
}

/// Result of starting an execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedExecution {
    /// `None` for a dry run
    pub execution_id: Option<Uuid>,
    pub status: ExecutionStatus,
}

/// Progress snapshot for polling callers
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionProgress {
    pub status: ExecutionStatus,
    pub completed_steps: usize,
    pub total_nodes: usize,
    /// `completed_steps / total_nodes`, 0.0 to 1.0
    pub fraction: f64,
}

static KEEP: StateUpdate = StateUpdate::Keep;

/// What the engine does with a dispatch result
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decision {
    Advance {
        output: Value,
        handle: String,
        state: StateUpdate,
    },
    Suspend {
        delay: Duration,
        state: StateUpdate,
    },
    Wait {
        state: StateUpdate,
    },
    Retry {
        error: String,
        delay: Duration,
    },
    Skip {
        error: String,
    },
    Fail {
        error: String,
    },
}

impl Decision {
    fn state(&self) -> &StateUpdate {
        match self {
            Decision::Advance { state, .. }
            | Decision::Suspend { state, .. }
            | Decision::Wait { state } => state,
            _ => &KEEP,
        }
    }
}

/// Apply a node's failure policy to a dispatch result
///
/// Retry when a policy allows another attempt and the failure is
/// retryable; otherwise `onError: continue` skips the node; otherwise the
/// execution fails.
pub(crate) fn decide(node: &Node, retry_count: u32, result: Result<StepResult, ActionError>) -> Decision {
    let error = match result {
        Ok(StepResult::Success {
            output,
            handle,
            state,
        }) => {
            return Decision::Advance {
                output,
                handle,
                state,
            }
        }
        Ok(StepResult::Suspend { delay, state }) => return Decision::Suspend { delay, state },
        Ok(StepResult::Wait { state }) => return Decision::Wait { state },
        Err(error) => error,
    };

    if let Some(policy) = &node.retry_policy {
        if policy.allows_retry(retry_count) && error.is_retryable() {
            return Decision::Retry {
                error: error.to_string(),
                delay: backoff_delay(policy, retry_count),
            };
        }
    }

    match node.on_error {
        OnError::Continue => Decision::Skip {
            error: error.to_string(),
        },
        OnError::Fail | OnError::Retry => Decision::Fail {
            error: error.to_string(),
        },
    }
}

/// Result of one closure application inside [`ExecutionEngine::commit`]
enum Apply<T> {
    /// Write the modified record
    Save(T),
    /// Leave the record untouched
    Skip(T),
}

enum Begin {
    Drop(&'static str),
    Parked,
    NodeMissing,
    Dispatch {
        input: Box<ActionInput>,
        previous: ExecutionStatus,
    },
}

enum Applied {
    Dropped,
    Stale,
    Committed {
        next: Vec<StepMessage>,
        delay: Option<Duration>,
        priority: i32,
        finished: Option<ExecutionStatus>,
    },
}

enum Attempt {
    Done,
    Stale,
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
    registry: Arc<ActionRegistry>,
    config: EngineConfig,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkQueue>,
        registry: ActionRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry: Arc::new(registry),
            config,
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Validate a pipeline and store it so executions can reference it
    pub async fn register_pipeline(&self, pipeline: &Pipeline) -> Result<(), EngineError> {
        pipeline.validate()?;
        self.store
            .save_pipeline(pipeline)
            .await
            .map_err(EngineError::store)?;
        info!(
            "Registered pipeline {} version {} ({} nodes)",
            pipeline.id,
            pipeline.version,
            pipeline.nodes.len()
        );
        Ok(())
    }

    /// Start an execution of the latest version of `pipeline_id`
    ///
    /// Validation happens before any record exists; an invalid pipeline
    /// never produces an execution.
    pub async fn start_execution(
        &self,
        pipeline_id: &str,
        trigger: Value,
        options: StartOptions,
    ) -> Result<StartedExecution, EngineError> {
        let pipeline = self
            .store
            .load_pipeline(pipeline_id, None)
            .await
            .map_err(EngineError::store)?
            .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.to_string()))?;
        pipeline.validate()?;

        if options.dry_run {
            info!("Dry run: pipeline {} is valid", pipeline.id);
            return Ok(StartedExecution {
                execution_id: None,
                status: ExecutionStatus::Pending,
            });
        }

        let priority = options.priority.unwrap_or(self.config.default_priority);
        let execution = Execution::new(&pipeline.id, pipeline.version, trigger, priority);
        let execution_id = execution.id;
        self.store
            .create_execution(&execution)
            .await
            .map_err(EngineError::store)?;
        self.record_stat(&pipeline.id, PipelineStat::Executions).await;

        info!(
            %execution_id,
            pipeline_id = %pipeline.id,
            version = pipeline.version,
            "Starting execution"
        );
        self.emit_event(ExecutionEvent::ExecutionStarted {
            execution_id,
            pipeline_id: pipeline.id.clone(),
        })
        .await;

        // The trigger message counts as in flight from here on
        let (_, queued) = self
            .commit(execution_id, |exec| {
                if !exec.transition(ExecutionStatus::Queued) {
                    return Apply::Skip(false);
                }
                exec.track_message(&pipeline.trigger_node_id);
                Apply::Save(true)
            })
            .await?;
        if !queued {
            return Err(EngineError::Internal(format!(
                "execution {} could not be queued",
                execution_id
            )));
        }
        self.emit_event(ExecutionEvent::StatusChanged {
            execution_id,
            from: ExecutionStatus::Pending,
            to: ExecutionStatus::Queued,
        })
        .await;

        let message = StepMessage::new(execution_id, &pipeline.trigger_node_id, 0);
        if let Err(e) = self
            .queue
            .enqueue(message, EnqueueOptions::with_priority(priority))
            .await
        {
            error!(%execution_id, "Failed to enqueue trigger step: {:#}", e);
            let status = self
                .fail_execution(
                    execution_id,
                    format!("failed to enqueue trigger step: {:#}", e),
                    None,
                )
                .await?;
            return Ok(StartedExecution {
                execution_id: Some(execution_id),
                status,
            });
        }

        Ok(StartedExecution {
            execution_id: Some(execution_id),
            status: ExecutionStatus::Queued,
        })
    }

    /// Handle one step message
    ///
    /// Handler failures never surface here; they become step log entries
    /// and a policy decision. An engine fault fails the execution. Write
    /// contention, and a fault that also prevents recording the failure,
    /// are returned so the caller can hand the message back to the queue.
    pub async fn execute_step(&self, message: &StepMessage) -> Result<(), EngineError> {
        match self.process_step(message).await {
            Ok(()) => Ok(()),
            Err(EngineError::ExecutionNotFound(id)) => {
                warn!(execution_id = %id, step_id = %message.step_id, "Dropping step message for unknown execution");
                Ok(())
            }
            // Contention is transient; the message goes back to the queue
            Err(err @ EngineError::Conflict(_)) => Err(err),
            Err(err) => {
                error!(
                    execution_id = %message.execution_id,
                    step_id = %message.step_id,
                    "Internal fault while executing step: {}",
                    err
                );
                self.fail_after_fault(message, &err).await
            }
        }
    }

    async fn process_step(&self, message: &StepMessage) -> Result<(), EngineError> {
        let execution = self.load(message.execution_id).await?;
        if execution.is_terminal() {
            debug!(
                execution_id = %message.execution_id,
                step_id = %message.step_id,
                status = execution.status.as_str(),
                "Execution is terminal, dropping step message"
            );
            return Ok(());
        }

        let pipeline = self
            .store
            .load_pipeline(&execution.pipeline_id, Some(execution.pipeline_version))
            .await
            .map_err(EngineError::store)?
            .ok_or_else(|| {
                EngineError::PipelineNotFound(format!(
                    "{} version {}",
                    execution.pipeline_id, execution.pipeline_version
                ))
            })?;

        for _ in 0..self.config.commit_attempts.max(1) {
            match self.run_attempt(&pipeline, message).await? {
                Attempt::Done => return Ok(()),
                Attempt::Stale => {
                    debug!(
                        execution_id = %message.execution_id,
                        step_id = %message.step_id,
                        "Node state changed during dispatch, dispatching again"
                    );
                }
            }
        }

        Err(EngineError::Internal(format!(
            "state of node '{}' kept changing during dispatch",
            message.step_id
        )))
    }

    async fn run_attempt(&self, pipeline: &Pipeline, message: &StepMessage) -> Result<Attempt, EngineError> {
        let execution_id = message.execution_id;
        let node = pipeline.node(&message.step_id);

        let (_, begin) = self
            .commit(execution_id, |exec| begin_step(exec, pipeline, node, message))
            .await?;

        let (input, previous) = match begin {
            Begin::Drop(reason) => {
                debug!(%execution_id, step_id = %message.step_id, reason, "Dropping step message");
                return Ok(Attempt::Done);
            }
            Begin::Parked => {
                info!(%execution_id, step_id = %message.step_id, "Execution paused, parking step message");
                return Ok(Attempt::Done);
            }
            Begin::NodeMissing => {
                error!(%execution_id, step_id = %message.step_id, "Step references a node that does not exist");
                self.emit_event(ExecutionEvent::StepFailed {
                    execution_id,
                    step_id: message.step_id.clone(),
                    retry_count: message.retry_count,
                    error: "node not found".to_string(),
                })
                .await;
                self.finished(execution_id, &pipeline.id, ExecutionStatus::Failed, Some(node_not_found(&message.step_id)))
                    .await;
                return Ok(Attempt::Done);
            }
            Begin::Dispatch { input, previous } => (input, previous),
        };

        if previous != ExecutionStatus::Running {
            self.emit_event(ExecutionEvent::StatusChanged {
                execution_id,
                from: previous,
                to: ExecutionStatus::Running,
            })
            .await;
        }
        self.emit_event(ExecutionEvent::StepStarted {
            execution_id,
            step_id: message.step_id.clone(),
            node_type: input.node.node_type.clone(),
            retry_count: message.retry_count,
        })
        .await;
        debug!(
            %execution_id,
            step_id = %message.step_id,
            retry_count = message.retry_count,
            node_type = %input.node.node_type,
            "Dispatching step"
        );

        let node = input.node.clone();
        let snapshot_state = input.node_state.clone();
        let result = self.dispatch(*input).await;
        let decision = decide(&node, message.retry_count, result);

        let (execution, applied) = self
            .commit(execution_id, |exec| {
                apply_decision(exec, pipeline, message, &decision, snapshot_state.as_ref())
            })
            .await?;

        let (next, delay, priority, finished) = match applied {
            Applied::Dropped => {
                debug!(%execution_id, step_id = %message.step_id, "Outcome discarded, execution moved on");
                return Ok(Attempt::Done);
            }
            Applied::Stale => return Ok(Attempt::Stale),
            Applied::Committed {
                next,
                delay,
                priority,
                finished,
            } => (next, delay, priority, finished),
        };

        self.report_decision(message, &decision, &next).await;

        for next_message in next {
            let options = match delay {
                Some(delay) => EnqueueOptions::with_priority(priority).delayed(delay),
                None => EnqueueOptions::with_priority(priority),
            };
            self.queue
                .enqueue(next_message, options)
                .await
                .map_err(|e| EngineError::Queue(format!("{:#}", e)))?;
        }

        if let Some(status) = finished {
            self.finished(execution_id, &pipeline.id, status, execution.error.clone())
                .await;
        }

        Ok(Attempt::Done)
    }

    /// Run the node's handler in its own task, bounded by the node timeout
    async fn dispatch(&self, input: ActionInput) -> Result<StepResult, ActionError> {
        let node_type = input.node.node_type.clone();
        let Some(handler) = self.registry.get(&node_type) else {
            return Err(ActionError::fatal(format!(
                "no action handler registered for node type '{}'",
                node_type
            )));
        };

        let timeout_ms = input.node.timeout_ms;
        let task = tokio::spawn(async move { handler.execute(input).await });
        let abort = task.abort_handle();

        let joined = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), task).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Err(ActionError::Timeout(ms));
                }
            },
            None => task.await,
        };

        joined.unwrap_or_else(|e| {
            Err(ActionError::retryable(format!(
                "action handler for '{}' panicked: {}",
                node_type, e
            )))
        })
    }

    async fn report_decision(&self, message: &StepMessage, decision: &Decision, next: &[StepMessage]) {
        let execution_id = message.execution_id;
        let step_id = message.step_id.clone();
        let next_steps: Vec<String> = next.iter().map(|m| m.step_id.clone()).collect();

        match decision {
            Decision::Advance { handle, .. } => {
                info!(%execution_id, %step_id, %handle, next = ?next_steps, "Step completed");
                self.emit_event(ExecutionEvent::StepCompleted {
                    execution_id,
                    step_id,
                    handle: handle.clone(),
                    next_steps,
                })
                .await;
            }
            Decision::Suspend { delay, .. } => {
                info!(%execution_id, %step_id, delay_ms = delay.as_millis() as u64, "Step suspended");
                self.emit_event(ExecutionEvent::StepWaiting {
                    execution_id,
                    step_id,
                    resume_after: Some(*delay),
                })
                .await;
            }
            Decision::Wait { .. } => {
                debug!(%execution_id, %step_id, "Step waiting for upstream branches");
                self.emit_event(ExecutionEvent::StepWaiting {
                    execution_id,
                    step_id,
                    resume_after: None,
                })
                .await;
            }
            Decision::Retry { error, delay } => {
                warn!(
                    %execution_id,
                    %step_id,
                    retry_count = message.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Step failed, retry scheduled: {}",
                    error
                );
                self.emit_event(ExecutionEvent::StepFailed {
                    execution_id,
                    step_id: step_id.clone(),
                    retry_count: message.retry_count,
                    error: error.clone(),
                })
                .await;
                self.emit_event(ExecutionEvent::StepRetryScheduled {
                    execution_id,
                    step_id,
                    retry_count: message.retry_count + 1,
                    delay: *delay,
                })
                .await;
            }
            Decision::Skip { error } => {
                warn!(%execution_id, %step_id, "Step failed, continuing: {}", error);
                self.emit_event(ExecutionEvent::StepFailed {
                    execution_id,
                    step_id: step_id.clone(),
                    retry_count: message.retry_count,
                    error: error.clone(),
                })
                .await;
                self.emit_event(ExecutionEvent::StepSkipped {
                    execution_id,
                    step_id,
                    next_steps,
                })
                .await;
            }
            Decision::Fail { error } => {
                error!(%execution_id, %step_id, retry_count = message.retry_count, "Step failed: {}", error);
                self.emit_event(ExecutionEvent::StepFailed {
                    execution_id,
                    step_id,
                    retry_count: message.retry_count,
                    error: error.clone(),
                })
                .await;
            }
        }
    }

    /// Record an engine fault as an execution failure
    async fn fail_after_fault(&self, message: &StepMessage, fault: &EngineError) -> Result<(), EngineError> {
        let reason = fault.to_string();
        let committed = self
            .commit(message.execution_id, |exec| {
                if exec.is_terminal() {
                    return Apply::Skip(false);
                }
                if let Some(log) = exec.log_for_mut(message) {
                    if !log.status.is_final() {
                        log.status = StepStatus::Failed;
                        log.error = Some(reason.clone());
                        log.completed_at = Some(Utc::now());
                    }
                }
                exec.fail(reason.clone(), Some(&message.step_id));
                Apply::Save(true)
            })
            .await;

        match committed {
            Ok((execution, true)) => {
                self.finished(
                    execution.id,
                    &execution.pipeline_id,
                    ExecutionStatus::Failed,
                    execution.error.clone(),
                )
                .await;
                Ok(())
            }
            Ok((_, false)) => Ok(()),
            Err(EngineError::ExecutionNotFound(_)) => Ok(()),
            Err(err) => {
                error!(
                    execution_id = %message.execution_id,
                    "Could not record engine fault: {}",
                    err
                );
                Err(err)
            }
        }
    }

    async fn fail_execution(
        &self,
        execution_id: Uuid,
        reason: String,
        step_id: Option<&str>,
    ) -> Result<ExecutionStatus, EngineError> {
        let (execution, failed) = self
            .commit(execution_id, |exec| {
                if exec.fail(reason.clone(), step_id) {
                    Apply::Save(true)
                } else {
                    Apply::Skip(false)
                }
            })
            .await?;
        if failed {
            self.finished(
                execution_id,
                &execution.pipeline_id,
                ExecutionStatus::Failed,
                execution.error.clone(),
            )
            .await;
        }
        Ok(execution.status)
    }

    /// Request cancellation; a no-op on a terminal execution
    ///
    /// A handler already running is not interrupted; its outcome is
    /// discarded.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<ExecutionStatus, EngineError> {
        let (execution, previous) = self
            .commit(execution_id, |exec| {
                let previous = exec.status;
                if exec.transition(ExecutionStatus::Cancelled) {
                    Apply::Save(Some(previous))
                } else {
                    Apply::Skip(None)
                }
            })
            .await?;

        if let Some(previous) = previous {
            info!(%execution_id, "Execution cancelled");
            self.emit_event(ExecutionEvent::StatusChanged {
                execution_id,
                from: previous,
                to: ExecutionStatus::Cancelled,
            })
            .await;
            self.emit_event(ExecutionEvent::ExecutionFinished {
                execution_id,
                status: ExecutionStatus::Cancelled,
                error: None,
            })
            .await;
        }
        Ok(execution.status)
    }

    /// Park further step messages until [`ExecutionEngine::resume_execution`]
    pub async fn pause_execution(&self, execution_id: Uuid) -> Result<ExecutionStatus, EngineError> {
        let (execution, previous) = self
            .commit(execution_id, |exec| {
                let previous = exec.status;
                if previous != ExecutionStatus::Paused && exec.transition(ExecutionStatus::Paused) {
                    Apply::Save(Some(previous))
                } else {
                    Apply::Skip(None)
                }
            })
            .await?;

        if let Some(previous) = previous {
            info!(%execution_id, "Execution paused");
            self.emit_event(ExecutionEvent::StatusChanged {
                execution_id,
                from: previous,
                to: ExecutionStatus::Paused,
            })
            .await;
        }
        Ok(execution.status)
    }

    /// Leave the paused state and re-enqueue parked step messages
    pub async fn resume_execution(&self, execution_id: Uuid) -> Result<ExecutionStatus, EngineError> {
        let (execution, parked) = self
            .commit(execution_id, |exec| {
                if exec.status != ExecutionStatus::Paused {
                    return Apply::Skip(None);
                }
                let target = if exec.started_at.is_some() {
                    ExecutionStatus::Running
                } else {
                    ExecutionStatus::Queued
                };
                if !exec.transition(target) {
                    return Apply::Skip(None);
                }
                Apply::Save(Some(std::mem::take(&mut exec.parked)))
            })
            .await?;

        let Some(parked) = parked else {
            return Ok(execution.status);
        };

        info!(%execution_id, parked = parked.len(), "Execution resumed");
        self.emit_event(ExecutionEvent::StatusChanged {
            execution_id,
            from: ExecutionStatus::Paused,
            to: execution.status,
        })
        .await;

        for message in parked {
            self.queue
                .enqueue(message, EnqueueOptions::with_priority(execution.priority))
                .await
                .map_err(|e| EngineError::Queue(format!("{:#}", e)))?;
        }
        Ok(execution.status)
    }

    /// Current execution record
    pub async fn execution_status(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.load(execution_id).await
    }

    /// Completed distinct steps against the size of the graph
    pub async fn execution_progress(&self, execution_id: Uuid) -> Result<ExecutionProgress, EngineError> {
        let execution = self.load(execution_id).await?;
        let total_nodes = self
            .store
            .load_pipeline(&execution.pipeline_id, Some(execution.pipeline_version))
            .await
            .map_err(EngineError::store)?
            .map_or(0, |pipeline| pipeline.nodes.len());

        Ok(ExecutionProgress {
            status: execution.status,
            completed_steps: execution.completed_steps(),
            total_nodes,
            fraction: execution.progress(total_nodes),
        })
    }

    async fn load(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.store
            .load_execution(execution_id)
            .await
            .map_err(EngineError::store)?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// Load, apply, compare-and-set; reapplied on a revision conflict
    async fn commit<T, F>(&self, execution_id: Uuid, mut apply: F) -> Result<(Execution, T), EngineError>
    where
        F: FnMut(&mut Execution) -> Apply<T>,
    {
        let attempts = self.config.commit_attempts.max(1);
        for attempt in 1..=attempts {
            let mut execution = self.load(execution_id).await?;
            match apply(&mut execution) {
                Apply::Skip(value) => return Ok((execution, value)),
                Apply::Save(value) => {
                    let expected = execution.revision;
                    execution.revision += 1;
                    let saved = self
                        .store
                        .save_execution(&execution, expected)
                        .await
                        .map_err(EngineError::store)?;
                    if saved {
                        return Ok((execution, value));
                    }
                    debug!(%execution_id, attempt, "Revision conflict, reapplying");
                }
            }
        }

        warn!(%execution_id, attempts, "Gave up after repeated revision conflicts");
        Err(EngineError::Conflict(execution_id))
    }

    async fn finished(
        &self,
        execution_id: Uuid,
        pipeline_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) {
        match status {
            ExecutionStatus::Completed => {
                info!(%execution_id, "Execution completed");
                self.record_stat(pipeline_id, PipelineStat::Successes).await;
            }
            ExecutionStatus::Failed => {
                error!(%execution_id, error = error.as_deref().unwrap_or(""), "Execution failed");
                self.record_stat(pipeline_id, PipelineStat::Failures).await;
            }
            _ => {}
        }
        self.emit_event(ExecutionEvent::ExecutionFinished {
            execution_id,
            status,
            error,
        })
        .await;
    }

    /// Counters are best-effort
    async fn record_stat(&self, pipeline_id: &str, stat: PipelineStat) {
        if let Err(e) = self.store.increment_pipeline_stat(pipeline_id, stat).await {
            warn!("Failed to record {} for pipeline {}: {:#}", stat.column(), pipeline_id, e);
        }
    }
}

fn node_not_found(step_id: &str) -> String {
    format!("node not found: '{}'", step_id)
}

/// Steps whose latest attempts include a completion or a skip
fn settled_steps(execution: &Execution) -> HashSet<String> {
    execution
        .step_logs
        .iter()
        .filter(|log| matches!(log.status, StepStatus::Completed | StepStatus::Skipped))
        .map(|log| log.step_id.clone())
        .collect()
}

/// Upstream nodes that have not settled and that outstanding work, other
/// than `message` itself, can still reach
fn pending_upstream(
    exec: &Execution,
    pipeline: &Pipeline,
    message: &StepMessage,
    upstream: &[String],
    settled: &HashSet<String>,
) -> HashSet<String> {
    let unsettled: Vec<&String> = upstream.iter().filter(|id| !settled.contains(*id)).collect();
    if unsettled.is_empty() {
        return HashSet::new();
    }

    let sources = exec.outstanding.iter().filter_map(|(step_id, count)| {
        let others = if *step_id == message.step_id {
            count.saturating_sub(1)
        } else {
            *count
        };
        (others > 0).then_some(step_id.as_str())
    });
    let live = pipeline.reachable_from(sources);

    unsettled
        .into_iter()
        .filter(|id| live.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Steps left `Waiting` on branches that can no longer arrive
///
/// Only meaningful once nothing else is in flight. A merge that already
/// fired is done, and `current` has just been decided.
fn stalled_steps(exec: &Execution, current: &str) -> Vec<String> {
    let mut stalled: Vec<String> = Vec::new();
    for log in &exec.step_logs {
        let step_id = log.step_id.as_str();
        if step_id == current || stalled.iter().any(|id| id == step_id) {
            continue;
        }
        if matches!(exec.node_state.get(step_id), Some(NodeState::Merge { fired: true })) {
            continue;
        }
        if exec.latest_status(step_id) == Some(StepStatus::Waiting) {
            stalled.push(step_id.to_string());
        }
    }
    stalled
}

fn begin_step(
    exec: &mut Execution,
    pipeline: &Pipeline,
    node: Option<&Node>,
    message: &StepMessage,
) -> Apply<Begin> {
    if exec.is_terminal() {
        return Apply::Skip(Begin::Drop("execution is terminal"));
    }
    if exec.log_for(message).is_some_and(|log| log.status.is_final()) {
        return Apply::Skip(Begin::Drop("message already handled"));
    }
    if exec.status == ExecutionStatus::Paused {
        if exec.parked.contains(message) {
            return Apply::Skip(Begin::Parked);
        }
        exec.parked.push(message.clone());
        return Apply::Save(Begin::Parked);
    }

    let Some(node) = node else {
        exec.fail(node_not_found(&message.step_id), Some(&message.step_id));
        exec.finish_message(&message.step_id);
        return Apply::Save(Begin::NodeMissing);
    };

    let previous = exec.status;
    exec.transition(ExecutionStatus::Running);
    exec.current_step_id = Some(node.id.clone());

    let upstream = pipeline.upstream_of(&node.id);
    let settled = settled_steps(exec);
    let pending_upstream = pending_upstream(exec, pipeline, message, &upstream, &settled);

    let resolved = resolve_inputs(&node.inputs, &exec.context);
    exec.upsert_log(StepLog {
        step_id: node.id.clone(),
        node_type: node.node_type.clone(),
        status: StepStatus::Running,
        started_at: Utc::now(),
        completed_at: None,
        input: Some(Value::Object(resolved.values.clone())),
        output: None,
        error: None,
        retry_count: message.retry_count,
        message_id: message.message_id,
    });

    let input = ActionInput {
        node: node.clone(),
        inputs: resolved.values,
        context: exec.context.clone(),
        node_state: exec.node_state.get(&node.id).cloned(),
        upstream,
        settled,
        pending_upstream,
        execution_id: exec.id,
        retry_count: message.retry_count,
    };

    Apply::Save(Begin::Dispatch {
        input: Box::new(input),
        previous,
    })
}

fn apply_state(exec: &mut Execution, step_id: &str, update: &StateUpdate) {
    match update {
        StateUpdate::Keep => {}
        StateUpdate::Set(state) => {
            exec.node_state.insert(step_id.to_string(), state.clone());
        }
        StateUpdate::Clear => {
            exec.node_state.remove(step_id);
        }
    }
}

fn apply_decision(
    exec: &mut Execution,
    pipeline: &Pipeline,
    message: &StepMessage,
    decision: &Decision,
    snapshot_state: Option<&NodeState>,
) -> Apply<Applied> {
    if exec.is_terminal() {
        return Apply::Skip(Applied::Dropped);
    }
    if exec.log_for(message).is_some_and(|log| log.status.is_final()) {
        return Apply::Skip(Applied::Dropped);
    }
    if *decision.state() != StateUpdate::Keep
        && exec.node_state.get(&message.step_id) != snapshot_state
    {
        return Apply::Skip(Applied::Stale);
    }

    let step_id = message.step_id.as_str();
    let now = Utc::now();
    if exec.log_for(message).is_none() {
        let node_type = pipeline
            .node(step_id)
            .map(|node| node.node_type.clone())
            .unwrap_or_default();
        exec.upsert_log(StepLog {
            step_id: step_id.to_string(),
            node_type,
            status: StepStatus::Running,
            started_at: now,
            completed_at: None,
            input: None,
            output: None,
            error: None,
            retry_count: message.retry_count,
            message_id: message.message_id,
        });
    }

    let mut delay = None;
    let (status, output, error, mut next_messages) = match decision {
        Decision::Advance { output, handle, .. } => {
            exec.context.set_step_output(step_id, output.clone());
            let next = next_messages(exec.id, pipeline, step_id, handle);
            (StepStatus::Completed, Some(output.clone()), None, next)
        }
        Decision::Skip { error } => {
            let next = next_messages(exec.id, pipeline, step_id, DEFAULT_HANDLE);
            (StepStatus::Skipped, None, Some(error.clone()), next)
        }
        Decision::Retry { error, delay: backoff } => {
            delay = Some(*backoff);
            (StepStatus::Pending, None, Some(error.clone()), vec![message.retry()])
        }
        Decision::Suspend { delay: wait, .. } => {
            delay = Some(*wait);
            (StepStatus::Waiting, None, None, vec![message.redeliver()])
        }
        Decision::Wait { .. } => (StepStatus::Waiting, None, None, Vec::new()),
        Decision::Fail { error } => (StepStatus::Failed, None, Some(error.clone()), Vec::new()),
    };

    if let Some(log) = exec.log_for_mut(message) {
        log.status = status;
        log.output = output;
        log.error = error.clone();
        log.completed_at = Some(now);
    }
    apply_state(exec, step_id, decision.state());

    exec.finish_message(step_id);
    let mut finished = None;
    if let Decision::Fail { error } = decision {
        exec.fail(error.clone(), Some(step_id));
        finished = Some(ExecutionStatus::Failed);
    } else {
        if next_messages.is_empty() && exec.in_flight == 0 {
            // Nothing left can arrive at a waiting join; give it a last look
            next_messages = stalled_steps(exec, step_id)
                .into_iter()
                .map(|stalled| StepMessage::new(exec.id, stalled, 0))
                .collect();
        }
        for next in &next_messages {
            exec.track_message(&next.step_id);
        }
        if next_messages.is_empty() && exec.in_flight == 0 && exec.transition(ExecutionStatus::Completed) {
            finished = Some(ExecutionStatus::Completed);
        }
    }

    Apply::Save(Applied::Committed {
        next: if finished == Some(ExecutionStatus::Failed) {
            Vec::new()
        } else {
            next_messages
        },
        delay,
        priority: exec.priority,
        finished,
    })
}

fn next_messages(execution_id: Uuid, pipeline: &Pipeline, step_id: &str, handle: &str) -> Vec<StepMessage> {
    pipeline
        .next_nodes(step_id, handle)
        .into_iter()
        .map(|target| StepMessage::new(execution_id, target, 0))
        .collect()
}
