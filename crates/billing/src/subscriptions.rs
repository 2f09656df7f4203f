//! Subscription state machine
//!
//! `Subscription::apply` is the only way a subscription's status changes.
//! It is pure: it returns the next value and leaves `self` untouched, so a
//! rejected transition can never leave a half-written record behind.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::notifications::NotificationKind;

/// Billing status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Pending,
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionStatus::None),
            "pending" => Ok(SubscriptionStatus::Pending),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(BillingError::InvalidInput(format!(
                "unknown subscription status: {}",
                other
            ))),
        }
    }
}

/// Length of one billing period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl BillingPeriod {
    /// Fixed-length period; calendar alignment is the gateway's concern
    pub fn duration(&self) -> Duration {
        match self {
            BillingPeriod::Monthly => Duration::days(30),
            BillingPeriod::Yearly => Duration::days(365),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
        }
    }
}

impl std::str::FromStr for BillingPeriod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" | "month" => Ok(BillingPeriod::Monthly),
            "yearly" | "annual" | "year" => Ok(BillingPeriod::Yearly),
            other => Err(BillingError::InvalidInput(format!(
                "unknown billing period: {}",
                other
            ))),
        }
    }
}

/// Something that happened to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Create,
    PaymentCompleted { amount_cents: i64 },
    PaymentFailed { reason: Option<String> },
    Cancel { at_period_end: bool },
    /// Fired by the renewal job once `current_period_end` has passed
    PeriodElapsed,
}

impl SubscriptionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionEvent::Create => "create",
            SubscriptionEvent::PaymentCompleted { .. } => "payment_completed",
            SubscriptionEvent::PaymentFailed { .. } => "payment_failed",
            SubscriptionEvent::Cancel {
                at_period_end: false,
            } => "cancel_immediately",
            SubscriptionEvent::Cancel {
                at_period_end: true,
            } => "cancel_at_period_end",
            SubscriptionEvent::PeriodElapsed => "period_elapsed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub billing_period: BillingPeriod,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_date: Option<OffsetDateTime>,
    pub last_payment_amount: Option<i64>,
    /// Incremented on every applied transition, used for compare-and-swap writes
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Outcome of an applied transition
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
    pub subscription: Subscription,
    pub notification: Option<NotificationKind>,
}

impl Subscription {
    /// Blank subscription in state `none`, before the create event
    pub fn blank(user_id: Uuid, plan_id: impl Into<String>, billing_period: BillingPeriod) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            user_id,
            plan_id: plan_id.into(),
            status: SubscriptionStatus::None,
            billing_period,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
            last_payment_date: None,
            last_payment_amount: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a subscription awaiting its first payment
    pub fn create(
        user_id: Uuid,
        plan_id: impl Into<String>,
        billing_period: BillingPeriod,
    ) -> BillingResult<Self> {
        let blank = Self::blank(user_id, plan_id, billing_period);
        let created_at = blank.created_at;
        Ok(blank
            .apply(&SubscriptionEvent::Create, created_at)?
            .subscription)
    }

    /// Compute the state after `event`. Returns `InvalidTransition` for any
    /// (state, event) pair outside the transition table.
    pub fn apply(&self, event: &SubscriptionEvent, now: OffsetDateTime) -> BillingResult<Transition> {
        use SubscriptionEvent as E;
        use SubscriptionStatus as S;

        let mut next = self.clone();

        let notification = match (self.status, event) {
            (S::None, E::Create) => {
                next.status = S::Pending;
                None
            }

            (S::Pending, E::PaymentCompleted { amount_cents }) => {
                next.status = S::Active;
                next.record_payment(*amount_cents, now);
                next.current_period_start = Some(now);
                next.current_period_end = Some(now + self.billing_period.duration());
                Some(NotificationKind::Confirmation)
            }

            (S::Active, E::PaymentCompleted { amount_cents }) => {
                // Renewal extends from the end of the paid period, not from now
                let start = self
                    .current_period_end
                    .filter(|end| *end > now)
                    .unwrap_or(now);
                next.record_payment(*amount_cents, now);
                next.current_period_start = Some(start);
                next.current_period_end = Some(start + self.billing_period.duration());
                Some(NotificationKind::Renewal)
            }

            (S::PastDue, E::PaymentCompleted { amount_cents }) => {
                next.status = S::Active;
                next.record_payment(*amount_cents, now);
                if self.current_period_end.map_or(true, |end| end <= now) {
                    next.current_period_start = Some(now);
                    next.current_period_end = Some(now + self.billing_period.duration());
                }
                Some(NotificationKind::Confirmation)
            }

            (S::Pending | S::Active, E::PaymentFailed { .. }) => {
                next.status = S::PastDue;
                Some(NotificationKind::PaymentFailed)
            }

            (S::Active | S::PastDue, E::Cancel { at_period_end: false }) => {
                next.status = S::Cancelled;
                next.cancelled_at = Some(now);
                next.cancel_at_period_end = false;
                Some(NotificationKind::Cancelled)
            }

            (S::Active | S::PastDue, E::Cancel { at_period_end: true }) => {
                next.cancel_at_period_end = true;
                next.cancelled_at = Some(now);
                Some(NotificationKind::CancellationScheduled)
            }

            (S::Active, E::PeriodElapsed) if self.period_has_ended(now) => {
                if self.cancel_at_period_end {
                    next.status = S::Cancelled;
                    Some(NotificationKind::Cancelled)
                } else {
                    next.status = S::Expired;
                    Some(NotificationKind::Expired)
                }
            }

            // A past_due period only closes out when cancellation was scheduled
            (S::PastDue, E::PeriodElapsed)
                if self.cancel_at_period_end && self.period_has_ended(now) =>
            {
                next.status = S::Cancelled;
                Some(NotificationKind::Cancelled)
            }

            _ => {
                return Err(BillingError::InvalidTransition {
                    subscription_id: self.id,
                    from: self.status,
                    event: event.name().to_string(),
                });
            }
        };

        next.version = self.version + 1;
        next.updated_at = now;

        Ok(Transition {
            from: self.status,
            to: next.status,
            subscription: next,
            notification,
        })
    }

    /// Whether the period-end sweep acts on this subscription
    pub fn closes_at_period_end(&self) -> bool {
        match self.status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::PastDue => self.cancel_at_period_end,
            _ => false,
        }
    }

    /// Whether the paid period is over
    pub fn period_has_ended(&self, now: OffsetDateTime) -> bool {
        self.current_period_end.is_some_and(|end| end <= now)
    }

    fn record_payment(&mut self, amount_cents: i64, now: OffsetDateTime) {
        self.last_payment_date = Some(now);
        self.last_payment_amount = Some(amount_cents);
    }
}
