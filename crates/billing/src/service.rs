//! Subscription service
//!
//! Operator and user facing subscription operations, plus the period-end
//! sweep run by the renewal worker. Every status change goes through
//! `Subscription::apply` under the same per-subscription lock the payment
//! processor uses.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::notifications::{Notifier, SubscriptionNotification};
use crate::processor::SubscriptionLocks;
use crate::store::{BillingStore, Transaction, VersionedWrite};
use crate::subscriptions::{BillingPeriod, Subscription, SubscriptionEvent, SubscriptionStatus};

/// Result of one period-end sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub cancelled: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn Notifier>,
    locks: SubscriptionLocks,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        notifier: Arc<dyn Notifier>,
        locks: SubscriptionLocks,
    ) -> Self {
        Self {
            store,
            notifier,
            locks,
        }
    }

    /// Start a subscription awaiting its first payment
    pub async fn create(
        &self,
        user_id: Uuid,
        plan_id: &str,
        billing_period: BillingPeriod,
    ) -> BillingResult<Subscription> {
        if plan_id.trim().is_empty() {
            return Err(BillingError::InvalidInput("plan_id is required".to_string()));
        }

        let subscription = Subscription::create(user_id, plan_id.trim(), billing_period)?;
        self.store.insert_subscription(&subscription).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %user_id,
            plan_id = %subscription.plan_id,
            billing_period = billing_period.as_str(),
            "Subscription created"
        );
        Ok(subscription)
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }

    pub async fn transactions(&self, id: Uuid) -> BillingResult<Vec<Transaction>> {
        self.get(id).await?;
        self.store.list_transactions(id).await
    }

    /// Cancel now, or flag the subscription to end with its current period
    pub async fn cancel(&self, id: Uuid, at_period_end: bool) -> BillingResult<Subscription> {
        let _guard = self.locks.acquire(id).await;
        let subscription = self.get(id).await?;
        let event = SubscriptionEvent::Cancel { at_period_end };
        self.apply(&subscription, event, OffsetDateTime::now_utc())
            .await
    }

    /// Close out active subscriptions whose period ended without renewal
    pub async fn sweep_period_end(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<SweepReport> {
        let due = self.store.list_period_ended(now, limit).await?;
        let mut report = SweepReport {
            examined: due.len(),
            ..SweepReport::default()
        };

        for candidate in due {
            let _guard = self.locks.acquire(candidate.id).await;

            // A renewal may have landed since the listing
            let current = match self.store.get_subscription(candidate.id).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %candidate.id,
                        error = %e,
                        "Failed to reload subscription"
                    );
                    report.failed += 1;
                    continue;
                }
            };
            if !current.closes_at_period_end() || !current.period_has_ended(now) {
                continue;
            }

            match self.apply(&current, SubscriptionEvent::PeriodElapsed, now).await {
                Ok(updated) if updated.status == SubscriptionStatus::Cancelled => {
                    report.cancelled += 1
                }
                Ok(_) => report.expired += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %current.id,
                        error = %e,
                        "Failed to close out subscription period"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                expired = report.expired,
                cancelled = report.cancelled,
                failed = report.failed,
                "Period-end sweep complete"
            );
        }
        Ok(report)
    }

    async fn apply(
        &self,
        subscription: &Subscription,
        event: SubscriptionEvent,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let transition = subscription.apply(&event, now).inspect_err(|e| {
            tracing::error!(
                subscription_id = %subscription.id,
                current_status = %subscription.status,
                attempted = event.name(),
                error = %e,
                "Rejected subscription transition"
            );
        })?;

        self.store
            .update_subscription(VersionedWrite {
                subscription: &transition.subscription,
                expected_version: subscription.version,
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            from = %transition.from,
            to = %transition.to,
            event = event.name(),
            "Subscription transition applied"
        );

        if let Some(kind) = transition.notification {
            self.notifier.notify(SubscriptionNotification::for_subscription(
                kind,
                &transition.subscription,
            ));
        }
        Ok(transition.subscription)
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::notifications::testing::RecordingNotifier;
    use crate::notifications::NotificationKind;
    use crate::store::InMemoryBillingStore;

    fn service() -> (SubscriptionService, Arc<InMemoryBillingStore>, Arc<RecordingNotifier>) {
        let store = Arc::new(InMemoryBillingStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let service =
            SubscriptionService::new(store.clone(), notifier.clone(), SubscriptionLocks::new());
        (service, store, notifier)
    }

    /// Store an active subscription whose period ends at `period_end`
    async fn active(
        store: &InMemoryBillingStore,
        service: &SubscriptionService,
        period_end: OffsetDateTime,
        cancel_at_period_end: bool,
    ) -> Subscription {
        seeded(
            store,
            service,
            SubscriptionStatus::Active,
            period_end,
            cancel_at_period_end,
        )
        .await
    }

    async fn seeded(
        store: &InMemoryBillingStore,
        service: &SubscriptionService,
        status: SubscriptionStatus,
        period_end: OffsetDateTime,
        cancel_at_period_end: bool,
    ) -> Subscription {
        let mut sub = service
            .create(Uuid::new_v4(), "pro", BillingPeriod::Monthly)
            .await
            .unwrap();
        let expected_version = sub.version;
        sub.status = status;
        sub.current_period_start = Some(period_end - Duration::days(30));
        sub.current_period_end = Some(period_end);
        sub.cancel_at_period_end = cancel_at_period_end;
        sub.version += 1;
        store
            .update_subscription(VersionedWrite {
                subscription: &sub,
                expected_version,
            })
            .await
            .unwrap();
        sub
    }

    #[tokio::test]
    async fn test_create_starts_pending() {
        let (service, _, _) = service();
        let sub = service
            .create(Uuid::new_v4(), "pro", BillingPeriod::Yearly)
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert_eq!(service.get(sub.id).await.unwrap(), sub);
    }

    #[tokio::test]
    async fn test_create_requires_plan() {
        let (service, _, _) = service();
        let err = service
            .create(Uuid::new_v4(), "  ", BillingPeriod::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (service, _, _) = service();
        assert!(matches!(
            service.get(Uuid::new_v4()).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_then_sweep_cancels() {
        let (service, store, notifier) = service();
        let now = OffsetDateTime::now_utc();
        let sub = active(&store, &service, now + Duration::days(3), false).await;

        let flagged = service.cancel(sub.id, true).await.unwrap();
        assert_eq!(flagged.status, SubscriptionStatus::Active);
        assert!(flagged.cancel_at_period_end);
        assert!(flagged.cancelled_at.is_some());

        // Nothing happens before the period ends
        let early = service.sweep_period_end(now, 100).await.unwrap();
        assert_eq!(early.examined, 0);

        let report = service
            .sweep_period_end(now + Duration::days(4), 100)
            .await
            .unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(
            service.get(sub.id).await.unwrap().status,
            SubscriptionStatus::Cancelled
        );
        assert_eq!(
            notifier.kinds(),
            vec![NotificationKind::CancellationScheduled, NotificationKind::Cancelled]
        );
    }

    #[tokio::test]
    async fn test_past_due_cancelled_at_period_end_is_swept() {
        let (service, store, _) = service();
        let now = OffsetDateTime::now_utc();
        let period_end = now + Duration::days(5);
        let flagged = seeded(&store, &service, SubscriptionStatus::PastDue, period_end, false).await;
        let untouched = seeded(&store, &service, SubscriptionStatus::PastDue, period_end, false).await;

        let scheduled = service.cancel(flagged.id, true).await.unwrap();
        assert_eq!(scheduled.status, SubscriptionStatus::PastDue);
        assert!(scheduled.cancel_at_period_end);

        let report = service
            .sweep_period_end(now + Duration::days(60), 100)
            .await
            .unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.cancelled, 1);
        assert_eq!(
            service.get(flagged.id).await.unwrap().status,
            SubscriptionStatus::Cancelled
        );
        // Dunning without a scheduled cancel is left to the gateway
        assert_eq!(
            service.get(untouched.id).await.unwrap().status,
            SubscriptionStatus::PastDue
        );
    }

    #[tokio::test]
    async fn test_sweep_expires_unrenewed() {
        let (service, store, _) = service();
        let now = OffsetDateTime::now_utc();
        let sub = active(&store, &service, now - Duration::hours(1), false).await;
        let renewed = active(&store, &service, now + Duration::days(20), false).await;

        let report = service.sweep_period_end(now, 100).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            service.get(sub.id).await.unwrap().status,
            SubscriptionStatus::Expired
        );
        assert_eq!(
            service.get(renewed.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_is_invalid_and_unchanged() {
        let (service, _, _) = service();
        let sub = service
            .create(Uuid::new_v4(), "pro", BillingPeriod::Monthly)
            .await
            .unwrap();

        let err = service.cancel(sub.id, false).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
        assert_eq!(service.get(sub.id).await.unwrap(), sub);
    }

    #[tokio::test]
    async fn test_immediate_cancel_is_terminal() {
        let (service, store, _) = service();
        let period_end = OffsetDateTime::now_utc() + Duration::days(10);
        let sub = active(&store, &service, period_end, false).await;

        let cancelled = service.cancel(sub.id, false).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert!(service.cancel(sub.id, false).await.is_err());
    }
}
