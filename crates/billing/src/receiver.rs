//! Webhook receiver
//!
//! Entry point for gateway deliveries. Each gate below runs in order and the
//! first one to fail decides the response:
//!
//! 1. content type is JSON
//! 2. signature header present
//! 3. body parses into an event
//! 4. event id not already processed
//! 5. signature verifies
//! 6. event id claimed atomically, then processed
//!
//! Processing failures never reach the gateway. Transient ones go to the
//! retry scheduler and permanent ones to the dead-letter queue; both respond
//! 200. The event id stays claimed in either case so a redelivery is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{BillingError, BillingResult};
use crate::event::WebhookEvent;
use crate::health::HealthTracker;
use crate::idempotency::IdempotencyStore;
use crate::processor::{PaymentProcessor, ProcessOutcome};
use crate::retry::{EnqueueOutcome, RetryQueueItem, RetryScheduler, RetryTarget};
use crate::signature::SignatureVerifier;

pub const MISSING_SIGNATURE: &str = "Missing webhook signature";

/// An inbound delivery, stripped of transport details
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub content_type: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed(ProcessOutcome),
    Duplicate,
    QueuedForRetry { attempts: u32 },
    DeadLettered { error_code: &'static str },
    Rejected {
        status: u16,
        error_code: &'static str,
        message: String,
    },
}

impl WebhookOutcome {
    /// HTTP status returned to the gateway
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookOutcome::Rejected { status, .. } => *status,
            _ => 200,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed(ProcessOutcome::Ignored) => "ignored",
            WebhookOutcome::Processed(_) => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::QueuedForRetry { .. } => "queued_for_retry",
            WebhookOutcome::DeadLettered { .. } => "dead_lettered",
            WebhookOutcome::Rejected { .. } => "rejected",
        }
    }

    fn rejected(status: u16, error: &BillingError) -> Self {
        WebhookOutcome::Rejected {
            status,
            error_code: error.code(),
            message: error.to_string(),
        }
    }
}

pub struct WebhookReceiver {
    provider: String,
    verifier: SignatureVerifier,
    idempotency: Arc<dyn IdempotencyStore>,
    processor: Arc<PaymentProcessor>,
    scheduler: Arc<RetryScheduler>,
    health: HealthTracker,
}

impl WebhookReceiver {
    pub fn new(
        provider: impl Into<String>,
        verifier: SignatureVerifier,
        idempotency: Arc<dyn IdempotencyStore>,
        processor: Arc<PaymentProcessor>,
        scheduler: Arc<RetryScheduler>,
        health: HealthTracker,
    ) -> Self {
        Self {
            provider: provider.into(),
            verifier,
            idempotency,
            processor,
            scheduler,
            health,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Run a delivery through every gate and report what happened
    pub async fn receive(&self, request: WebhookRequest<'_>) -> (Option<String>, WebhookOutcome) {
        let started = Instant::now();

        let (event, outcome) = match self.validate(&request) {
            Ok((event, signature)) => {
                let outcome = self.handle(&event, signature, request.body).await;
                (Some(event), outcome)
            }
            Err(e) => (None, WebhookOutcome::rejected(400, &e)),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let event_id = event.as_ref().map(|e| e.event_id.clone());
        let event_type = event.as_ref().map_or("unknown", |e| e.event_type.as_str());

        match &outcome {
            WebhookOutcome::Rejected {
                status, message, ..
            } => tracing::warn!(
                event_id = ?event_id,
                event_type = %event_type,
                status = *status,
                outcome = outcome.label(),
                error = %message,
                duration_ms = duration_ms,
                "Webhook rejected"
            ),
            _ => tracing::info!(
                event_id = ?event_id,
                event_type = %event_type,
                status = outcome.status_code(),
                outcome = outcome.label(),
                duration_ms = duration_ms,
                "Webhook handled"
            ),
        }

        (event_id, outcome)
    }

    /// Gates 1-3
    fn validate<'a>(
        &self,
        request: &WebhookRequest<'a>,
    ) -> BillingResult<(WebhookEvent, &'a str)> {
        if !request.content_type.is_some_and(is_json) {
            return Err(BillingError::Validation(
                "Content-Type must be application/json".to_string(),
            ));
        }

        let signature = request
            .signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BillingError::Validation(MISSING_SIGNATURE.to_string()))?;

        let event = WebhookEvent::parse(request.body)?;
        Ok((event, signature))
    }

    /// Gates 4-6
    async fn handle(&self, event: &WebhookEvent, signature: &str, body: &[u8]) -> WebhookOutcome {
        match self.idempotency.has(&event.event_id).await {
            Ok(true) => return WebhookOutcome::Duplicate,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(event_id = %event.event_id, error = %e, "Idempotency lookup failed");
                return WebhookOutcome::rejected(500, &e);
            }
        }

        if !self.verifier.verify(body, signature) {
            tracing::warn!(
                security_event = "webhook_signature_invalid",
                provider = %self.provider,
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Webhook signature verification failed"
            );
            return WebhookOutcome::rejected(400, &BillingError::SignatureInvalid);
        }

        match self.claim(&event.event_id).await {
            Ok(()) => {}
            Err(BillingError::DuplicateEvent(_)) => return WebhookOutcome::Duplicate,
            Err(e) => {
                tracing::error!(event_id = %event.event_id, error = %e, "Idempotency claim failed");
                return WebhookOutcome::rejected(500, &e);
            }
        }

        match self.processor.process(event).await {
            Ok(outcome) => {
                self.health.record_success();
                WebhookOutcome::Processed(outcome)
            }
            Err(e) if e.is_retryable() => {
                self.health.record_failure();
                let enqueued = self
                    .scheduler
                    .enqueue(
                        &event.event_id,
                        body.to_vec(),
                        signature,
                        self.scheduler.config().max_retries,
                        Some(event.event_type.clone()),
                        &e,
                    )
                    .await;
                match enqueued {
                    EnqueueOutcome::Scheduled { attempts, .. } => {
                        WebhookOutcome::QueuedForRetry { attempts }
                    }
                    EnqueueOutcome::AlreadyQueued => WebhookOutcome::QueuedForRetry { attempts: 1 },
                    EnqueueOutcome::DeadLettered => WebhookOutcome::DeadLettered {
                        error_code: e.code(),
                    },
                }
            }
            Err(e) => {
                self.health.record_failure();
                self.scheduler
                    .dead_letter_now(
                        &event.event_id,
                        body.to_vec(),
                        signature,
                        Some(event.event_type.clone()),
                        &e,
                    )
                    .await;
                WebhookOutcome::DeadLettered {
                    error_code: e.code(),
                }
            }
        }
    }

    /// Atomically take ownership of an event id. A lost race is `DuplicateEvent`.
    async fn claim(&self, event_id: &str) -> BillingResult<()> {
        if self.idempotency.record(event_id).await? {
            Ok(())
        } else {
            Err(BillingError::DuplicateEvent(event_id.to_string()))
        }
    }
}

/// Retries re-enter at processing; the signature was verified on receipt.
#[async_trait]
impl RetryTarget for WebhookReceiver {
    async fn retry(&self, item: &RetryQueueItem) -> BillingResult<()> {
        let event = WebhookEvent::parse(&item.payload)?;
        self.processor.process(&event).await.map(|_| ())
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}
