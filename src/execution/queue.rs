//! Work queue carrying step messages between the engine and its workers
//!
//! Delivery is at-least-once: a received message stays leased until it is
//! acknowledged, and a lease that runs out puts the message back.

use crate::core::StepMessage;
use anyhow::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a received message stays invisible by default
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Per-enqueue options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Keep the message invisible until this much time has passed
    pub delay: Option<Duration>,
    /// Higher priorities are delivered first
    pub priority: i32,
}

impl EnqueueOptions {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            delay: None,
            priority,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = (!delay.is_zero()).then_some(delay);
        self
    }
}

/// One received message, leased to the receiver until acked or nacked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: Uuid,
    pub message: StepMessage,
    /// 1 on first delivery, higher on redelivery
    pub attempts: u32,
}

/// Queue interface the engine and worker pool depend on
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, message: StepMessage, options: EnqueueOptions) -> Result<()>;

    /// Next deliverable message, waiting up to `wait` for one to become ready
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>>;

    /// Finish a delivery; the message is gone for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Give a delivery back for redelivery, optionally after `delay`
    async fn nack(&self, delivery: &Delivery, delay: Option<Duration>) -> Result<()>;

    /// Messages not yet acknowledged: ready, delayed or leased
    async fn len(&self) -> usize;
}

#[derive(Debug, Clone)]
struct Entry {
    message: StepMessage,
    priority: i32,
    seq: u64,
    attempts: u32,
}

/// Ready entry: highest priority first, then FIFO
#[derive(Debug)]
struct Ready(Entry);

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Delayed entry: earliest `ready_at` first
#[derive(Debug)]
struct Delayed {
    ready_at: Instant,
    entry: Entry,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.entry.seq.cmp(&self.entry.seq))
    }
}

#[derive(Debug)]
struct Lease {
    deadline: Instant,
    entry: Entry,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Delayed>,
    leased: HashMap<Uuid, Lease>,
}

impl QueueState {
    fn push(&mut self, mut entry: Entry, delay: Option<Duration>, now: Instant) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        match delay {
            Some(delay) if !delay.is_zero() => self.delayed.push(Delayed {
                ready_at: now + delay,
                entry,
            }),
            _ => self.ready.push(Ready(entry)),
        }
    }

    /// Move due delayed entries and expired leases to the ready heap
    fn promote(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(delayed) = self.delayed.pop() {
                self.ready.push(Ready(delayed.entry));
            }
        }

        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                warn!(
                    delivery_id = %id,
                    step_id = %lease.entry.message.step_id,
                    "Lease expired, redelivering"
                );
                self.ready.push(Ready(lease.entry));
            }
        }
    }

    /// Earliest moment something becomes deliverable without a new enqueue
    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.peek().map(|d| d.ready_at);
        let lease = self.leased.values().map(|l| l.deadline).min();
        match (delayed, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process queue with priorities, delayed delivery and lease redelivery
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    lease: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            lease,
        }
    }

    /// Messages waiting to be delivered, ready ones first
    pub async fn pending(&self) -> Vec<StepMessage> {
        let state = self.state.lock().await;
        let mut ready: Vec<&Ready> = state.ready.iter().collect();
        ready.sort_by(|a, b| b.cmp(a));
        let mut delayed: Vec<&Delayed> = state.delayed.iter().collect();
        delayed.sort_by(|a, b| b.cmp(a));

        ready
            .into_iter()
            .map(|r| r.0.message.clone())
            .chain(delayed.into_iter().map(|d| d.entry.message.clone()))
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn enqueue(&self, message: StepMessage, options: EnqueueOptions) -> Result<()> {
        debug!(
            execution_id = %message.execution_id,
            step_id = %message.step_id,
            retry_count = message.retry_count,
            delay_ms = options.delay.map(|d| d.as_millis() as u64),
            "Enqueue step message"
        );
        {
            let mut state = self.state.lock().await;
            let entry = Entry {
                message,
                priority: options.priority,
                seq: 0,
                attempts: 0,
            };
            state.push(entry, options.delay, Instant::now());
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote(now);

                if let Some(Ready(mut entry)) = state.ready.pop() {
                    entry.attempts += 1;
                    let delivery = Delivery {
                        delivery_id: Uuid::new_v4(),
                        message: entry.message.clone(),
                        attempts: entry.attempts,
                    };
                    state.leased.insert(
                        delivery.delivery_id,
                        Lease {
                            deadline: now + self.lease,
                            entry,
                        },
                    );
                    return Ok(Some(delivery));
                }
                state.next_wake()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let until = next_wake.map_or(deadline, |wake| wake.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.leased.remove(&delivery.delivery_id).is_none() {
            debug!(delivery_id = %delivery.delivery_id, "Ack for unknown or expired lease");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Option<Duration>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match state.leased.remove(&delivery.delivery_id) {
                Some(lease) => state.push(lease.entry, delay, Instant::now()),
                None => {
                    debug!(delivery_id = %delivery.delivery_id, "Nack for unknown or expired lease");
                    return Ok(());
                }
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len() + state.leased.len()
    }
}
