//! Payment processor
//!
//! Turns a verified gateway event into a transaction write and a subscription
//! transition. Events touching the same subscription are serialized through a
//! per-subscription lock, and the store's version check catches writers in
//! other processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::event::{EventKind, WebhookEvent};
use crate::notifications::{Notifier, SubscriptionNotification};
use crate::store::{BillingStore, Transaction, TransactionStatus, VersionedWrite};
use crate::subscriptions::{Subscription, SubscriptionEvent, SubscriptionStatus, Transition};

/// Lock map is pruned once it grows past this many entries
const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Per-subscription async locks
#[derive(Clone, Default)]
pub struct SubscriptionLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl SubscriptionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one subscription
    pub async fn acquire(&self, subscription_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > LOCK_PRUNE_THRESHOLD {
                // Only the map holds an idle lock
                locks.retain(|id, l| *id == subscription_id || Arc::strong_count(l) > 1);
            }
            Arc::clone(locks.entry(subscription_id).or_default())
        };
        lock.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// What processing did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Subscription moved through the state machine
    Applied {
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    /// Transaction written, subscription left as is
    Recorded { subscription_id: Uuid },
    /// Same change was applied by an earlier delivery
    AlreadyApplied { subscription_id: Uuid },
    /// Event type with nothing to do
    Ignored,
}

pub struct PaymentProcessor {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn Notifier>,
    locks: SubscriptionLocks,
    timeout: Duration,
}

impl PaymentProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        notifier: Arc<dyn Notifier>,
        locks: SubscriptionLocks,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            locks,
            timeout,
        }
    }

    /// Process a verified event within the processing timeout
    pub async fn process(&self, event: &WebhookEvent) -> BillingResult<ProcessOutcome> {
        match tokio::time::timeout(self.timeout, self.dispatch(event)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Webhook processing timed out"
                );
                Err(BillingError::Timeout(self.timeout.as_millis() as u64))
            }
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<ProcessOutcome> {
        match event.kind {
            EventKind::ChargeCompleted => {
                self.handle_charge(event, TransactionStatus::Completed).await
            }
            EventKind::ChargeFailed => self.handle_charge(event, TransactionStatus::Failed).await,
            EventKind::SubscriptionCancelled => self.handle_cancellation(event).await,
            EventKind::TransferCompleted => {
                tracing::info!(
                    event_id = %event.event_id,
                    "Transfer completed - no subscription impact"
                );
                Ok(ProcessOutcome::Ignored)
            }
            EventKind::Unknown => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "Received unhandled webhook event type"
                );
                Ok(ProcessOutcome::Ignored)
            }
        }
    }

    async fn handle_charge(
        &self,
        event: &WebhookEvent,
        status: TransactionStatus,
    ) -> BillingResult<ProcessOutcome> {
        let charge = event.charge()?;
        if charge.amount < 0 {
            return Err(BillingError::Permanent(format!(
                "charge {} has negative amount {}",
                charge.reference, charge.amount
            )));
        }

        let _guard = self.locks.acquire(charge.subscription_id).await;

        let subscription = self.load(charge.subscription_id).await?;
        let existing = self.store.find_transaction(&charge.reference).await?;

        if let Some(tx) = existing.as_ref().filter(|t| t.subscription_id != subscription.id) {
            return Err(BillingError::Permanent(format!(
                "charge {} belongs to subscription {}, not {}",
                charge.reference, tx.subscription_id, subscription.id
            )));
        }

        match existing.as_ref().map(|t| t.status) {
            Some(current) if current == status => {
                tracing::info!(
                    event_id = %event.event_id,
                    reference = %charge.reference,
                    status = status.as_str(),
                    "Charge already recorded"
                );
                return Ok(ProcessOutcome::AlreadyApplied {
                    subscription_id: subscription.id,
                });
            }
            Some(TransactionStatus::Completed) => {
                // A failure notice arriving after the success for the same charge
                tracing::warn!(
                    event_id = %event.event_id,
                    reference = %charge.reference,
                    "Ignoring stale charge failure for completed charge"
                );
                return Ok(ProcessOutcome::AlreadyApplied {
                    subscription_id: subscription.id,
                });
            }
            _ => {}
        }

        let now = OffsetDateTime::now_utc();
        let transaction = Transaction {
            id: existing.as_ref().map_or_else(Uuid::new_v4, |t| t.id),
            subscription_id: subscription.id,
            amount_cents: charge.amount,
            currency: charge.currency.clone(),
            gateway_reference: charge.reference.clone(),
            status,
            failure_reason: charge.failure_reason.clone(),
            created_at: existing.as_ref().map_or(now, |t| t.created_at),
        };

        let sub_event = match status {
            TransactionStatus::Failed => SubscriptionEvent::PaymentFailed {
                reason: charge.failure_reason.clone(),
            },
            _ => SubscriptionEvent::PaymentCompleted {
                amount_cents: charge.amount,
            },
        };

        // A failure that predates the last successful payment is out of order
        let superseded = subscription.status == SubscriptionStatus::Active
            && subscription
                .last_payment_date
                .is_some_and(|paid| event.occurred_at() < paid);

        // Failures on past_due, or superseded ones, are recorded without a transition
        if status == TransactionStatus::Failed
            && (subscription.status == SubscriptionStatus::PastDue || superseded)
        {
            self.store.commit_payment(&transaction, None).await?;
            tracing::info!(
                event_id = %event.event_id,
                subscription_id = %subscription.id,
                reference = %charge.reference,
                current_status = %subscription.status,
                superseded = superseded,
                "Recorded failed charge without transition"
            );
            return Ok(ProcessOutcome::Recorded {
                subscription_id: subscription.id,
            });
        }

        let mut transition = self.transition(&subscription, &sub_event, now, event)?;
        if status == TransactionStatus::Completed {
            // Payment date follows the gateway clock so late failures compare against it
            transition.subscription.last_payment_date = Some(event.occurred_at());
        }
        self.store
            .commit_payment(
                &transaction,
                Some(VersionedWrite {
                    subscription: &transition.subscription,
                    expected_version: subscription.version,
                }),
            )
            .await?;

        Ok(self.finish(event, transition))
    }

    async fn handle_cancellation(&self, event: &WebhookEvent) -> BillingResult<ProcessOutcome> {
        let data = event.cancellation()?;
        let _guard = self.locks.acquire(data.subscription_id).await;
        let subscription = self.load(data.subscription_id).await?;

        let already = if data.at_period_end {
            subscription.cancel_at_period_end
                && matches!(
                    subscription.status,
                    SubscriptionStatus::Active | SubscriptionStatus::PastDue
                )
        } else {
            subscription.status == SubscriptionStatus::Cancelled
        };
        if already {
            return Ok(ProcessOutcome::AlreadyApplied {
                subscription_id: subscription.id,
            });
        }

        let now = OffsetDateTime::now_utc();
        let sub_event = SubscriptionEvent::Cancel {
            at_period_end: data.at_period_end,
        };
        let transition = self.transition(&subscription, &sub_event, now, event)?;
        self.store
            .update_subscription(VersionedWrite {
                subscription: &transition.subscription,
                expected_version: subscription.version,
            })
            .await?;

        Ok(self.finish(event, transition))
    }

    async fn load(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::Permanent(format!("subscription {} does not exist", subscription_id))
            })
    }

    fn transition(
        &self,
        subscription: &Subscription,
        sub_event: &SubscriptionEvent,
        now: OffsetDateTime,
        event: &WebhookEvent,
    ) -> BillingResult<Transition> {
        subscription.apply(sub_event, now).inspect_err(|e| {
            tracing::error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                subscription_id = %subscription.id,
                current_status = %subscription.status,
                attempted = sub_event.name(),
                error = %e,
                "Rejected subscription transition"
            );
        })
    }

    fn finish(&self, event: &WebhookEvent, transition: Transition) -> ProcessOutcome {
        let sub = &transition.subscription;
        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            subscription_id = %sub.id,
            from = %transition.from,
            to = %transition.to,
            version = sub.version,
            "Subscription transition applied"
        );

        if let Some(kind) = transition.notification {
            self.notifier
                .notify(SubscriptionNotification::for_subscription(kind, sub));
        }

        ProcessOutcome::Applied {
            subscription_id: sub.id,
            from: transition.from,
            to: transition.to,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::json;
    use uuid::Uuid;

    use crate::event::WebhookEvent;

    pub fn event_body(id: &str, event_type: &str, data: serde_json::Value) -> Vec<u8> {
        json!({
            "id": id,
            "type": event_type,
            "created_at": 1_700_000_000,
            "data": data,
        })
        .to_string()
        .into_bytes()
    }

    pub fn charge_body(
        id: &str,
        event_type: &str,
        reference: &str,
        sub: Uuid,
        amount: i64,
    ) -> Vec<u8> {
        event_body(
            id,
            event_type,
            json!({ "reference": reference, "subscription_id": sub, "amount": amount }),
        )
    }

    /// Charge event stamped with its own gateway time
    pub fn charge_event_at(
        id: &str,
        event_type: &str,
        reference: &str,
        sub: Uuid,
        created_at: i64,
    ) -> WebhookEvent {
        let body = json!({
            "id": id,
            "type": event_type,
            "created_at": created_at,
            "data": { "reference": reference, "subscription_id": sub, "amount": 1999 },
        })
        .to_string();
        WebhookEvent::parse(body.as_bytes()).unwrap()
    }

    pub fn charge_event(
        id: &str,
        event_type: &str,
        reference: &str,
        sub: Uuid,
        amount: i64,
    ) -> WebhookEvent {
        WebhookEvent::parse(&charge_body(id, event_type, reference, sub, amount)).unwrap()
    }
}
