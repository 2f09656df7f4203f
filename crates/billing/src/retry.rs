//! Retry scheduler
//!
//! Failed webhooks wait in a min-heap keyed by their next retry time. One
//! background worker sleeps until the earliest item is due (or until an
//! enqueue wakes it), replays due items one at a time, and either drops them
//! on success, reschedules them with exponential backoff, or dead-letters
//! them. Nothing leaves the queue any other way.
//!
//! `attempts` counts failed processing attempts, including the original
//! delivery. With `max_retries = 3` an event is processed at most three
//! times in total.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::dead_letter::{DeadLetterHandler, DeadLetterRecord};
use crate::error::{BillingError, BillingResult};
use crate::health::HealthTracker;

/// A failed webhook waiting for its next attempt
#[derive(Debug, Clone)]
pub struct RetryQueueItem {
    pub webhook_id: String,
    pub event_type: Option<String>,
    pub payload: Vec<u8>,
    pub signature: String,
    pub attempts: u32,
    pub max_retries: u32,
    pub next_retry_at: Instant,
    pub first_failed_at: Instant,
    pub first_failed_at_utc: OffsetDateTime,
    pub last_error_code: String,
    pub last_error: String,
}

/// Operator view of a queued item
#[derive(Debug, Clone, Serialize)]
pub struct RetryQueueEntry {
    pub webhook_id: String,
    pub event_type: Option<String>,
    pub attempts: u32,
    pub max_retries: u32,
    pub next_retry_in_ms: u64,
    pub last_error: String,
}

/// Result of handing a failure to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Scheduled { attempts: u32, delay: Duration },
    AlreadyQueued,
    DeadLettered,
}

/// Re-runs the processing path for a queued item
#[async_trait]
pub trait RetryTarget: Send + Sync {
    async fn retry(&self, item: &RetryQueueItem) -> BillingResult<()>;
}

/// Delay before the retry that follows `attempt` failures, without jitter:
/// `min(max_delay, initial_delay * backoff_factor^(attempt - 1))`
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let raw = config.initial_delay.as_secs_f64() * config.backoff_factor.powi(exponent);
    let capped = raw.min(config.max_delay.as_secs_f64());
    if capped.is_finite() && capped >= 0.0 {
        Duration::from_secs_f64(capped)
    } else {
        config.max_delay
    }
}

/// Scale a delay by a random factor in `[0.5, 1.0]`
pub fn apply_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.5..=1.0);
    delay.mul_f64(factor)
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    items: HashMap<String, RetryQueueItem>,
    seq: u64,
}

impl Queue {
    fn push(&mut self, item: RetryQueueItem) {
        self.seq += 1;
        self.heap
            .push(Reverse((item.next_retry_at, self.seq, item.webhook_id.clone())));
        self.items.insert(item.webhook_id.clone(), item);
    }

    fn pop_due(&mut self, now: Instant) -> Vec<RetryQueueItem> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((at, _, id))) = self.heap.pop() {
                // Skip heap entries superseded by a later push of the same id
                if self.items.get(&id).is_some_and(|i| i.next_retry_at == at) {
                    if let Some(item) = self.items.remove(&id) {
                        due.push(item);
                    }
                }
            }
        }
        due
    }

    fn drain(&mut self) -> Vec<RetryQueueItem> {
        self.heap.clear();
        self.items.drain().map(|(_, item)| item).collect()
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }
}

pub struct RetryScheduler {
    queue: Mutex<Queue>,
    wake: Notify,
    config: RetryConfig,
    dead_letters: Arc<dyn DeadLetterHandler>,
    health: HealthTracker,
}

impl RetryScheduler {
    pub fn new(
        config: RetryConfig,
        dead_letters: Arc<dyn DeadLetterHandler>,
        health: HealthTracker,
    ) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            config,
            dead_letters,
            health,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Queue a webhook whose first processing attempt just failed
    pub async fn enqueue(
        &self,
        webhook_id: &str,
        payload: Vec<u8>,
        signature: &str,
        max_retries: u32,
        event_type: Option<String>,
        cause: &BillingError,
    ) -> EnqueueOutcome {
        let now = Instant::now();
        let mut item = RetryQueueItem {
            webhook_id: webhook_id.to_string(),
            event_type,
            payload,
            signature: signature.to_string(),
            attempts: 1,
            max_retries,
            next_retry_at: now,
            first_failed_at: now,
            first_failed_at_utc: OffsetDateTime::now_utc(),
            last_error_code: cause.code().to_string(),
            last_error: cause.to_string(),
        };

        if item.attempts >= item.max_retries {
            self.dead_letter(item, "retry budget exhausted").await;
            return EnqueueOutcome::DeadLettered;
        }

        let mut queue = self.queue.lock().await;
        if queue.items.contains_key(webhook_id) {
            return EnqueueOutcome::AlreadyQueued;
        }
        if queue.items.len() >= self.config.queue_capacity {
            drop(queue);
            tracing::error!(
                webhook_id = %webhook_id,
                capacity = self.config.queue_capacity,
                "Retry queue full"
            );
            self.dead_letter(item, "retry queue full").await;
            return EnqueueOutcome::DeadLettered;
        }

        let delay = apply_jitter(backoff_delay(&self.config, item.attempts));
        item.next_retry_at = now + delay;
        let attempts = item.attempts;

        tracing::info!(
            webhook_id = %webhook_id,
            attempts = attempts,
            max_retries = max_retries,
            delay_ms = delay.as_millis() as u64,
            "Webhook queued for retry"
        );

        queue.push(item);
        drop(queue);
        self.wake.notify_one();

        EnqueueOutcome::Scheduled { attempts, delay }
    }

    /// Put a dead-lettered event back with a fresh attempt budget, due now
    pub async fn requeue(&self, record: DeadLetterRecord) -> BillingResult<()> {
        let now = Instant::now();
        let mut queue = self.queue.lock().await;
        if queue.items.contains_key(&record.webhook_id) {
            return Err(BillingError::InvalidInput(format!(
                "{} is already queued",
                record.webhook_id
            )));
        }

        tracing::info!(
            webhook_id = %record.webhook_id,
            dead_letter_id = %record.id,
            "Replaying dead-lettered webhook"
        );

        queue.push(RetryQueueItem {
            webhook_id: record.webhook_id,
            event_type: record.event_type,
            payload: record.raw_payload,
            signature: record.signature,
            attempts: 0,
            max_retries: self.config.max_retries,
            next_retry_at: now,
            first_failed_at: now,
            first_failed_at_utc: OffsetDateTime::now_utc(),
            last_error_code: record.error_code,
            last_error: record.reason,
        });
        drop(queue);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, webhook_id: &str) -> bool {
        self.queue.lock().await.items.contains_key(webhook_id)
    }

    /// Queued items ordered by next retry time
    pub async fn snapshot(&self) -> Vec<RetryQueueEntry> {
        let now = Instant::now();
        let queue = self.queue.lock().await;
        let mut items: Vec<&RetryQueueItem> = queue.items.values().collect();
        items.sort_by_key(|i| i.next_retry_at);
        items
            .into_iter()
            .map(|i| RetryQueueEntry {
                webhook_id: i.webhook_id.clone(),
                event_type: i.event_type.clone(),
                attempts: i.attempts,
                max_retries: i.max_retries,
                next_retry_in_ms: i.next_retry_at.saturating_duration_since(now).as_millis() as u64,
                last_error: i.last_error.clone(),
            })
            .collect()
    }

    /// Worker loop. Runs until `shutdown` flips to true.
    pub async fn run(
        self: Arc<Self>,
        target: Arc<dyn RetryTarget>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(
            max_retries = self.config.max_retries,
            initial_delay_ms = self.config.initial_delay.as_millis() as u64,
            max_delay_ms = self.config.max_delay.as_millis() as u64,
            "Retry worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.process_due(target.as_ref()).await;

            let next = self.queue.lock().await.next_due();
            let floor = Instant::now() + self.config.min_wait;
            // Idle with nothing queued: park until an enqueue wakes us
            let deadline = next.map(|at| at.max(floor));

            tokio::select! {
                _ = sleep_until_opt(deadline) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let abandoned = self.dead_letter_remaining("shutdown before retry").await;
        tracing::info!(dead_lettered = abandoned, "Retry worker stopped");
    }

    /// Empty the queue into the dead-letter handler. Returns how many items moved.
    pub async fn dead_letter_remaining(&self, why: &str) -> usize {
        let remaining = self.queue.lock().await.drain();
        let count = remaining.len();
        for item in remaining {
            self.dead_letter(item, why).await;
        }
        count
    }

    /// Process every item that is due now. Returns how many were attempted.
    pub async fn process_due(&self, target: &dyn RetryTarget) -> usize {
        let due = self.queue.lock().await.pop_due(Instant::now());
        let count = due.len();
        for item in due {
            self.attempt(item, target).await;
        }
        count
    }

    async fn attempt(&self, mut item: RetryQueueItem, target: &dyn RetryTarget) {
        let started = Instant::now();
        let result = target.retry(&item).await;
        let elapsed = item.first_failed_at.elapsed();

        match result {
            Ok(()) => {
                self.health.record_success();
                tracing::info!(
                    webhook_id = %item.webhook_id,
                    attempts = item.attempts + 1,
                    elapsed_ms = elapsed.as_millis() as u64,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Webhook retry succeeded"
                );
            }
            Err(e) => {
                self.health.record_failure();
                item.attempts += 1;
                item.last_error_code = e.code().to_string();
                item.last_error = e.to_string();

                if !e.is_retryable() {
                    self.dead_letter(item, "permanent failure on retry").await;
                } else if item.attempts >= item.max_retries {
                    self.dead_letter(item, "retry budget exhausted").await;
                } else {
                    let delay = apply_jitter(backoff_delay(&self.config, item.attempts));
                    item.next_retry_at = Instant::now() + delay;
                    tracing::warn!(
                        webhook_id = %item.webhook_id,
                        attempts = item.attempts,
                        max_retries = item.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Webhook retry failed - rescheduled"
                    );
                    self.queue.lock().await.push(item);
                }
            }
        }
    }

    async fn dead_letter(&self, item: RetryQueueItem, why: &str) {
        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            payload: String::from_utf8_lossy(&item.payload).into_owned(),
            raw_payload: item.payload,
            webhook_id: item.webhook_id,
            event_type: item.event_type,
            signature: item.signature,
            attempts: item.attempts,
            error_code: item.last_error_code,
            reason: format!("{}: {}", why, item.last_error),
            first_failed_at: item.first_failed_at_utc,
            dead_lettered_at: OffsetDateTime::now_utc(),
            elapsed_ms: item.first_failed_at.elapsed().as_millis() as u64,
        };
        self.dead_letters.dead_letter(record).await;
    }

    /// Dead-letter a webhook that failed permanently on its first attempt
    pub async fn dead_letter_now(
        &self,
        webhook_id: &str,
        payload: Vec<u8>,
        signature: &str,
        event_type: Option<String>,
        cause: &BillingError,
    ) {
        let now = Instant::now();
        let item = RetryQueueItem {
            webhook_id: webhook_id.to_string(),
            event_type,
            payload,
            signature: signature.to_string(),
            attempts: 1,
            max_retries: self.config.max_retries,
            next_retry_at: now,
            first_failed_at: now,
            first_failed_at_utc: OffsetDateTime::now_utc(),
            last_error_code: cause.code().to_string(),
            last_error: cause.to_string(),
        };
        self.dead_letter(item, "permanent failure").await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
