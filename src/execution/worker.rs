//! Worker pool - pulls step messages off the queue and runs them

use crate::core::config::{EngineConfig, RateLimitConfig};
use crate::execution::engine::ExecutionEngine;
use crate::execution::queue::{Delivery, WorkQueue};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Rolling-window limit on message starts
#[derive(Debug)]
pub struct RateLimiter {
    max_messages: usize,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_messages: config.max_messages.max(1) as usize,
            window: Duration::from_millis(config.window_ms),
            starts: VecDeque::new(),
        }
    }

    /// How long to wait before another start fits in the window, if at all
    pub fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        while self
            .starts
            .front()
            .is_some_and(|start| now.duration_since(*start) >= self.window)
        {
            self.starts.pop_front();
        }
        if self.starts.len() < self.max_messages {
            return None;
        }
        self.starts
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
    }

    pub fn record(&mut self, now: Instant) {
        self.starts.push_back(now);
    }
}

/// Fixed-size pool of step workers over one queue
pub struct WorkerPool {
    engine: Arc<ExecutionEngine>,
    queue: Arc<dyn WorkQueue>,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(engine: Arc<ExecutionEngine>, queue: Arc<dyn WorkQueue>, config: EngineConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            engine,
            queue,
            config,
            semaphore,
        }
    }

    /// Run until `cancel` fires, then wait for in-flight steps to finish
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut limiter = self.config.rate_limit.map(RateLimiter::new);

        info!(
            concurrency = self.config.concurrency,
            rate_limit = ?self.config.rate_limit,
            "Worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.context("Worker semaphore closed")?
                }
            };

            if let Some(limiter) = limiter.as_mut() {
                if let Some(wait) = limiter.wait_time(Instant::now()) {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    continue;
                }
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive(poll) => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to receive from queue: {:#}", e);
                    tokio::time::sleep(poll).await;
                    continue;
                }
            };

            if let Some(limiter) = limiter.as_mut() {
                limiter.record(Instant::now());
            }
            self.spawn_step_task(delivery, permit, poll);
        }

        info!("Worker pool stopping, waiting for in-flight steps");
        let permits = u32::try_from(self.config.concurrency.max(1)).unwrap_or(u32::MAX);
        let _drained = self
            .semaphore
            .acquire_many(permits)
            .await
            .context("Worker semaphore closed during shutdown")?;
        info!("Worker pool stopped");
        Ok(())
    }

    /// Runs one delivery in its own task; the permit is released when it finishes
    fn spawn_step_task(&self, delivery: Delivery, permit: OwnedSemaphorePermit, retry_after: Duration) {
        let engine = Arc::clone(&self.engine);
        let queue = Arc::clone(&self.queue);

        tokio::spawn(async move {
            let _permit = permit;
            let message = &delivery.message;
            debug!(
                execution_id = %message.execution_id,
                step_id = %message.step_id,
                attempts = delivery.attempts,
                "Processing step message"
            );

            match engine.execute_step(message).await {
                Ok(()) => {
                    if let Err(e) = queue.ack(&delivery).await {
                        warn!("Failed to ack delivery {}: {:#}", delivery.delivery_id, e);
                    }
                }
                Err(e) => {
                    error!(
                        execution_id = %message.execution_id,
                        step_id = %message.step_id,
                        "Step processing failed, returning message to queue: {}",
                        e
                    );
                    if let Err(e) = queue.nack(&delivery, Some(retry_after)).await {
                        warn!("Failed to nack delivery {}: {:#}", delivery.delivery_id, e);
                    }
                }
            }
        });
    }
}
