//! Subscription notifications
//!
//! Email rendering and delivery live outside this crate. The state machine
//! only says which notification a transition warrants; a `Notifier` hands it
//! off without waiting, so a slow mail provider never holds up a webhook.

use serde::Serialize;
use uuid::Uuid;

use crate::subscriptions::{Subscription, SubscriptionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Confirmation,
    Renewal,
    PaymentFailed,
    CancellationScheduled,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionNotification {
    pub kind: NotificationKind,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
}

impl SubscriptionNotification {
    pub fn for_subscription(kind: NotificationKind, subscription: &Subscription) -> Self {
        Self {
            kind,
            subscription_id: subscription.id,
            user_id: subscription.user_id,
            plan_id: subscription.plan_id.clone(),
            status: subscription.status,
        }
    }
}

/// Fire-and-forget sink for subscription notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: SubscriptionNotification);
}

/// Logs notifications; used when no delivery service is wired in
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: SubscriptionNotification) {
        tracing::info!(
            kind = ?notification.kind,
            subscription_id = %notification.subscription_id,
            user_id = %notification.user_id,
            plan_id = %notification.plan_id,
            status = %notification.status,
            "Subscription notification queued"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Collects notifications for assertions
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<SubscriptionNotification>>,
    }

    impl RecordingNotifier {
        pub fn kinds(&self) -> Vec<NotificationKind> {
            self.sent.lock().unwrap().iter().map(|n| n.kind).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notification: SubscriptionNotification) {
            self.sent.lock().unwrap().push(notification);
        }
    }
}
