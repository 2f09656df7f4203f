//! Idempotency store for webhook event ids
//!
//! `record` is an atomic insert-if-absent: of two concurrent deliveries of the
//! same event, exactly one gets `true` and may apply side effects.
//!
//! Retention: entries live for the configured window (24 h by default). The
//! in-memory store also caps the number of entries; when the cap is hit the
//! oldest entry goes first, and evicting one that is still inside the window
//! is logged because a redelivery of it would be processed again (the
//! processor's per-reference upsert still prevents a double charge).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::IdempotencyConfig;
use crate::error::BillingResult;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether the id was recorded within the retention window
    async fn has(&self, event_id: &str) -> BillingResult<bool>;

    /// Record the id if absent. Returns `true` if this call recorded it.
    async fn record(&self, event_id: &str) -> BillingResult<bool>;
}

struct Entries {
    seen: HashMap<String, Instant>,
    /// Insertion order
    order: VecDeque<(String, Instant)>,
}

impl Entries {
    fn remove_if_current(&mut self, id: &str, recorded_at: Instant) -> bool {
        if self.seen.get(id) == Some(&recorded_at) {
            self.seen.remove(id);
            true
        } else {
            false
        }
    }

    fn purge_expired(&mut self, now: Instant, retention: Duration) {
        while let Some((_, recorded_at)) = self.order.front() {
            if now.duration_since(*recorded_at) < retention {
                break;
            }
            if let Some((id, recorded_at)) = self.order.pop_front() {
                self.remove_if_current(&id, recorded_at);
            }
        }
    }
}

/// Bounded in-process store with TTL and capacity eviction
pub struct InMemoryIdempotencyStore {
    entries: Mutex<Entries>,
    retention: Duration,
    max_entries: usize,
}

impl InMemoryIdempotencyStore {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Entries {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            retention,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self::new(config.retention, config.max_entries)
    }

    pub async fn len(&self) -> usize {
        let mut entries = self.entries.lock().await;
        entries.purge_expired(Instant::now(), self.retention);
        entries.seen.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn has(&self, event_id: &str) -> BillingResult<bool> {
        let entries = self.entries.lock().await;
        Ok(entries
            .seen
            .get(event_id)
            .is_some_and(|at| at.elapsed() < self.retention))
    }

    async fn record(&self, event_id: &str) -> BillingResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.purge_expired(now, self.retention);

        if entries.seen.contains_key(event_id) {
            return Ok(false);
        }

        while entries.seen.len() >= self.max_entries {
            let Some((oldest, recorded_at)) = entries.order.pop_front() else {
                break;
            };
            if entries.remove_if_current(&oldest, recorded_at) {
                tracing::warn!(
                    evicted_event_id = %oldest,
                    age_secs = now.duration_since(recorded_at).as_secs(),
                    max_entries = self.max_entries,
                    "Idempotency store full - evicted key inside retention window"
                );
            }
        }

        entries.seen.insert(event_id.to_string(), now);
        entries.order.push_back((event_id.to_string(), now));
        Ok(true)
    }
}

/// Shared store for multi-instance deployments, built on `SET NX EX`
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    retention: Duration,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str, config: &IdempotencyConfig) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            retention: config.retention,
            prefix: "webhook:processed:".to_string(),
        })
    }

    fn key(&self, event_id: &str) -> String {
        format!("{}{}", self.prefix, event_id)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn has(&self, event_id: &str) -> BillingResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key(event_id))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn record(&self, event_id: &str) -> BillingResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(event_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.retention.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}
