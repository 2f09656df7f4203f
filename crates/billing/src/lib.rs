// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::InvalidTransition carries full context
#![allow(clippy::too_many_arguments)] // Retry and dead-letter entry points take the raw delivery
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Paywire Billing
//!
//! Webhook reliability pipeline and the subscription state machine it drives.
//!
//! ## Features
//!
//! - **Webhook Receiver**: Validation, idempotency, signature checks, acknowledgement
//! - **Retry Scheduler**: Exponential backoff with jitter, bounded attempts
//! - **Dead Letters**: Operator-visible record of events that will not be retried
//! - **Health Tracking**: Healthy / degraded / critical from consecutive failures
//! - **Subscriptions**: Validated state transitions with versioned writes
//! - **Storage**: In-memory, Postgres and Redis backends behind traits

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod health;
pub mod idempotency;
pub mod notifications;
pub mod postgres;
pub mod processor;
pub mod receiver;
pub mod retry;
pub mod service;
pub mod signature;
pub mod store;
pub mod subscriptions;


// Config
pub use config::{GatewayConfig, HealthConfig, IdempotencyConfig, RetryConfig, WebhookConfig};

// Dead letters
pub use dead_letter::{
    AlertHook, DeadLetterHandler, DeadLetterQueue, DeadLetterRecord, SlackAlertHook,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use event::{derive_event_id, CancellationData, ChargeData, EventKind, WebhookEvent};

// Health
pub use health::{HealthLevel, HealthStatus, HealthTracker};

// Idempotency
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore};

// Notifications
pub use notifications::{NotificationKind, Notifier, SubscriptionNotification, TracingNotifier};

// Processing
pub use processor::{PaymentProcessor, ProcessOutcome, SubscriptionLocks};
pub use receiver::{WebhookOutcome, WebhookReceiver, WebhookRequest, MISSING_SIGNATURE};

// Retry
pub use retry::{
    apply_jitter, backoff_delay, EnqueueOutcome, RetryQueueEntry, RetryQueueItem,
    RetryScheduler, RetryTarget,
};

// Signature
pub use signature::{sign_payload, verify_signature, SignatureVerifier, SIGNATURE_HEADER};

// Storage
pub use postgres::PgBillingStore;
pub use store::{BillingStore, InMemoryBillingStore, Transaction, TransactionStatus, VersionedWrite};

// Subscriptions
pub use service::{SubscriptionService, SweepReport};
pub use subscriptions::{
    BillingPeriod, Subscription, SubscriptionEvent, SubscriptionStatus, Transition,
};

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The webhook pipeline with every component wired together
pub struct WebhookPipeline {
    pub config: WebhookConfig,
    pub receiver: Arc<WebhookReceiver>,
    pub scheduler: Arc<RetryScheduler>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub health: HealthTracker,
    pub subscriptions: SubscriptionService,
}

impl WebhookPipeline {
    /// Build the pipeline on the given storage backends
    pub fn new(
        config: WebhookConfig,
        store: Arc<dyn BillingStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let health = HealthTracker::new(config.health);
        let locks = SubscriptionLocks::new();

        let mut dead_letters = DeadLetterQueue::new(config.dead_letter_capacity);
        if let Some(url) = &config.alert_webhook_url {
            dead_letters = dead_letters.with_alert(Arc::new(SlackAlertHook::new(url.clone())));
        }
        let dead_letters = Arc::new(dead_letters);

        let scheduler = Arc::new(RetryScheduler::new(
            config.retry.clone(),
            dead_letters.clone(),
            health.clone(),
        ));
        let processor = Arc::new(PaymentProcessor::new(
            store.clone(),
            notifier.clone(),
            locks.clone(),
            config.processing_timeout,
        ));
        let receiver = Arc::new(WebhookReceiver::new(
            config.provider.clone(),
            SignatureVerifier::new(&config.gateway.webhook_secret),
            idempotency,
            processor,
            scheduler.clone(),
            health.clone(),
        ));

        Self {
            receiver,
            scheduler,
            dead_letters,
            health,
            subscriptions: SubscriptionService::new(store, notifier, locks),
            config,
        }
    }

    /// Build the pipeline on in-memory backends
    pub fn in_memory(config: WebhookConfig) -> Self {
        let idempotency = Arc::new(InMemoryIdempotencyStore::from_config(&config.idempotency));
        Self::new(
            config,
            Arc::new(InMemoryBillingStore::new()),
            idempotency,
            Arc::new(TracingNotifier),
        )
    }

    /// Start the background retry worker
    pub fn spawn_retry_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let target: Arc<dyn RetryTarget> = self.receiver.clone();
        tokio::spawn(scheduler.run(target, shutdown))
    }

    /// Send a dead-lettered event back through the retry queue
    pub async fn replay_dead_letter(&self, id: uuid::Uuid) -> BillingResult<DeadLetterRecord> {
        let not_found = || BillingError::NotFound(format!("dead letter {}", id));

        let record = self.dead_letters.get(id).await.ok_or_else(not_found)?;
        if self.scheduler.contains(&record.webhook_id).await {
            return Err(BillingError::InvalidInput(format!(
                "{} is already queued for retry",
                record.webhook_id
            )));
        }

        let record = self.dead_letters.take(id).await.ok_or_else(not_found)?;
        self.scheduler.requeue(record.clone()).await?;
        Ok(record)
    }
}
