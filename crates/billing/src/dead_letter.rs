//! Dead-letter handling
//!
//! Events land here when retries are exhausted or the failure is permanent.
//! The queue keeps the most recent records for operator review and replay,
//! and pages through an optional alert hook.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A webhook that will not be processed again without operator action
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub webhook_id: String,
    pub event_type: Option<String>,
    /// Raw body as received, lossily decoded for display
    pub payload: String,
    #[serde(skip_serializing)]
    pub raw_payload: Vec<u8>,
    #[serde(skip_serializing)]
    pub signature: String,
    pub attempts: u32,
    pub error_code: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub first_failed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub dead_lettered_at: OffsetDateTime,
    pub elapsed_ms: u64,
}

#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    async fn dead_letter(&self, record: DeadLetterRecord);
}

/// Destination for operator alerts
#[async_trait]
pub trait AlertHook: Send + Sync {
    async fn alert(&self, record: &DeadLetterRecord);
}

/// Posts a Slack-compatible `{"text": ...}` message
pub struct SlackAlertHook {
    client: reqwest::Client,
    url: String,
}

impl SlackAlertHook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertHook for SlackAlertHook {
    async fn alert(&self, record: &DeadLetterRecord) {
        let body = serde_json::json!({
            "text": format!(
                ":rotating_light: Webhook dead-lettered\n*Event:* {} ({})\n*Attempts:* {}\n*Reason:* {}",
                record.webhook_id,
                record.event_type.as_deref().unwrap_or("unknown"),
                record.attempts,
                record.reason,
            )
        });

        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => tracing::warn!(
                status = %resp.status(),
                webhook_id = %record.webhook_id,
                "Dead-letter alert rejected by alert endpoint"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                webhook_id = %record.webhook_id,
                "Failed to send dead-letter alert"
            ),
        }
    }
}

/// Bounded in-memory dead-letter queue
pub struct DeadLetterQueue {
    records: Mutex<VecDeque<DeadLetterRecord>>,
    capacity: usize,
    alert: Option<Arc<dyn AlertHook>>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            alert: None,
        }
    }

    pub fn with_alert(mut self, hook: Arc<dyn AlertHook>) -> Self {
        self.alert = Some(hook);
        self
    }

    /// Most recent first
    pub async fn list(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.iter().rev().cloned().collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<DeadLetterRecord> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Remove a record, e.g. to replay it
    pub async fn take(&self, id: Uuid) -> Option<DeadLetterRecord> {
        let mut records = self.records.lock().await;
        let pos = records.iter().position(|r| r.id == id)?;
        records.remove(pos)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeadLetterHandler for DeadLetterQueue {
    async fn dead_letter(&self, record: DeadLetterRecord) {
        tracing::error!(
            alert = true,
            webhook_id = %record.webhook_id,
            event_type = ?record.event_type,
            attempts = record.attempts,
            elapsed_ms = record.elapsed_ms,
            error_code = %record.error_code,
            reason = %record.reason,
            "Webhook dead-lettered"
        );

        if let Some(hook) = &self.alert {
            let hook = Arc::clone(hook);
            let record = record.clone();
            tokio::spawn(async move {
                hook.alert(&record).await;
            });
        }

        let mut records = self.records.lock().await;
        if records.len() >= self.capacity {
            if let Some(dropped) = records.pop_front() {
                tracing::warn!(
                    dropped_webhook_id = %dropped.webhook_id,
                    capacity = self.capacity,
                    "Dead-letter queue full - dropped oldest record"
                );
            }
        }
        records.push_back(record);
    }
}

#[cfg(test)]
pub(crate) fn sample_record(webhook_id: &str) -> DeadLetterRecord {
    let now = OffsetDateTime::now_utc();
    DeadLetterRecord {
        id: Uuid::new_v4(),
        webhook_id: webhook_id.to_string(),
        event_type: Some("charge.completed".to_string()),
        payload: "{}".to_string(),
        raw_payload: b"{}".to_vec(),
        signature: "sig".to_string(),
        attempts: 3,
        error_code: "transient_processing_error".to_string(),
        reason: "database unavailable".to_string(),
        first_failed_at: now,
        dead_lettered_at: now,
        elapsed_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl AlertHook for CountingHook {
        async fn alert(&self, _record: &DeadLetterRecord) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_records_listed_newest_first() {
        let queue = DeadLetterQueue::new(10);
        queue.dead_letter(sample_record("evt_a:1")).await;
        queue.dead_letter(sample_record("evt_b:1")).await;

        let listed = queue.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].webhook_id, "evt_b:1");
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let queue = DeadLetterQueue::new(2);
        for id in ["a", "b", "c"] {
            queue.dead_letter(sample_record(id)).await;
        }
        let ids: Vec<String> = queue.list().await.into_iter().map(|r| r.webhook_id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_take_removes_record() {
        let queue = DeadLetterQueue::new(10);
        let record = sample_record("evt_t:1");
        let id = record.id;
        queue.dead_letter(record).await;

        assert!(queue.get(id).await.is_some());
        assert_eq!(queue.take(id).await.map(|r| r.webhook_id), Some("evt_t:1".into()));
        assert!(queue.is_empty().await);
        assert!(queue.take(id).await.is_none());
    }

    #[tokio::test]
    async fn test_alert_hook_fires_once_per_record() {
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let queue = DeadLetterQueue::new(10).with_alert(hook.clone());
        queue.dead_letter(sample_record("evt_alert:1")).await;

        // Alert is spawned; yield until it runs
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_serialized_record_omits_signature() {
        let json = serde_json::to_value(sample_record("evt_s:1")).unwrap();
        assert!(json.get("signature").is_none());
        assert!(json.get("raw_payload").is_none());
        assert_eq!(json["attempts"], 3);
    }
}
