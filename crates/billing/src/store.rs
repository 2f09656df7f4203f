//! Billing persistence
//!
//! `BillingStore` is the seam between the processor and storage. Writes that
//! touch a subscription carry the version the caller read, and fail with a
//! retryable conflict if someone else got there first.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::Subscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(BillingError::InvalidInput(format!(
                "unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// One payment attempt, keyed by its gateway reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub gateway_reference: String,
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A subscription write guarded by the version it was read at
#[derive(Debug, Clone, Copy)]
pub struct VersionedWrite<'a> {
    pub subscription: &'a Subscription,
    pub expected_version: i64,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Compare-and-swap update of a subscription
    async fn update_subscription(&self, write: VersionedWrite<'_>) -> BillingResult<()>;

    async fn find_transaction(&self, gateway_reference: &str) -> BillingResult<Option<Transaction>>;

    async fn list_transactions(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>>;

    /// Upsert the transaction (by gateway reference) and, if given, update the
    /// subscription. Both are written or neither is.
    async fn commit_payment(
        &self,
        transaction: &Transaction,
        subscription: Option<VersionedWrite<'_>>,
    ) -> BillingResult<()>;

    /// Active subscriptions whose current period ended at or before `now`
    async fn list_period_ended(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;
}

pub(crate) fn version_conflict(subscription_id: Uuid) -> BillingError {
    BillingError::Transient(format!(
        "subscription {} was modified concurrently",
        subscription_id
    ))
}

#[derive(Default)]
struct Tables {
    subscriptions: HashMap<Uuid, Subscription>,
    transactions: HashMap<String, Transaction>,
}

impl Tables {
    fn check_version(&self, write: &VersionedWrite<'_>) -> BillingResult<()> {
        let id = write.subscription.id;
        match self.subscriptions.get(&id) {
            Some(current) if current.version == write.expected_version => Ok(()),
            Some(_) => Err(version_conflict(id)),
            None => Err(BillingError::NotFound(format!("subscription {}", id))),
        }
    }
}

/// Process-local store. Both tables sit behind one lock so `commit_payment`
/// is atomic.
#[derive(Default)]
pub struct InMemoryBillingStore {
    tables: Mutex<Tables>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::InvalidInput(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }
        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.tables.lock().await.subscriptions.get(&id).cloned())
    }

    async fn update_subscription(&self, write: VersionedWrite<'_>) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        tables.check_version(&write)?;
        tables
            .subscriptions
            .insert(write.subscription.id, write.subscription.clone());
        Ok(())
    }

    async fn find_transaction(&self, gateway_reference: &str) -> BillingResult<Option<Transaction>> {
        Ok(self
            .tables
            .lock()
            .await
            .transactions
            .get(gateway_reference)
            .cloned())
    }

    async fn list_transactions(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let tables = self.tables.lock().await;
        let mut txs: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.subscription_id == subscription_id)
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.created_at);
        Ok(txs)
    }

    async fn commit_payment(
        &self,
        transaction: &Transaction,
        subscription: Option<VersionedWrite<'_>>,
    ) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;

        if let Some(write) = &subscription {
            tables.check_version(write)?;
        }

        // Upsert keeps the original id and created_at; only status moves
        let entry = tables
            .transactions
            .entry(transaction.gateway_reference.clone())
            .or_insert_with(|| transaction.clone());
        entry.status = transaction.status;
        entry.failure_reason = transaction.failure_reason.clone();

        if let Some(write) = subscription {
            tables
                .subscriptions
                .insert(write.subscription.id, write.subscription.clone());
        }
        Ok(())
    }

    async fn list_period_ended(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.closes_at_period_end() && s.period_has_ended(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.current_period_end);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }
}
