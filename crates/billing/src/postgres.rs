//! Postgres-backed billing store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{version_conflict, BillingStore, Transaction, VersionedWrite};
use crate::subscriptions::Subscription;

/// Row type for the subscriptions table
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: String,
    status: String,
    billing_period: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    cancelled_at: Option<OffsetDateTime>,
    last_payment_date: Option<OffsetDateTime>,
    last_payment_amount: Option<i64>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            billing_period: row.billing_period.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            cancelled_at: row.cancelled_at,
            last_payment_date: row.last_payment_date,
            last_payment_amount: row.last_payment_amount,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row type for the transactions table
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    subscription_id: Uuid,
    amount_cents: i64,
    currency: String,
    gateway_reference: String,
    status: String,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            subscription_id: row.subscription_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            gateway_reference: row.gateway_reference,
            status: row.status.parse()?,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, plan_id, status, billing_period, current_period_start,
    current_period_end, cancel_at_period_end, cancelled_at, last_payment_date,
    last_payment_amount, version, created_at, updated_at
"#;

const UPDATE_SUBSCRIPTION: &str = r#"
    UPDATE subscriptions
    SET status = $2,
        current_period_start = $3,
        current_period_end = $4,
        cancel_at_period_end = $5,
        cancelled_at = $6,
        last_payment_date = $7,
        last_payment_amount = $8,
        version = $9,
        updated_at = $10
    WHERE id = $1 AND version = $11
"#;

fn update_query<'q>(
    write: &VersionedWrite<'q>,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let s = write.subscription;
    sqlx::query(UPDATE_SUBSCRIPTION)
        .bind(s.id)
        .bind(s.status.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.cancel_at_period_end)
        .bind(s.cancelled_at)
        .bind(s.last_payment_date)
        .bind(s.last_payment_amount)
        .bind(s.version)
        .bind(s.updated_at)
        .bind(write.expected_version)
}

pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Database(format!("migration failed: {}", e)))
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn insert_subscription(&self, s: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, user_id, plan_id, status, billing_period, current_period_start,
                 current_period_end, cancel_at_period_end, cancelled_at, last_payment_date,
                 last_payment_amount, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(s.id)
        .bind(s.user_id)
        .bind(&s.plan_id)
        .bind(s.status.as_str())
        .bind(s.billing_period.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.cancel_at_period_end)
        .bind(s.cancelled_at)
        .bind(s.last_payment_date)
        .bind(s.last_payment_amount)
        .bind(s.version)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn update_subscription(&self, write: VersionedWrite<'_>) -> BillingResult<()> {
        let result = update_query(&write).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(version_conflict(write.subscription.id));
        }
        Ok(())
    }

    async fn find_transaction(&self, gateway_reference: &str) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, amount_cents, currency, gateway_reference,
                   status, failure_reason, created_at
            FROM transactions
            WHERE gateway_reference = $1
            "#,
        )
        .bind(gateway_reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn list_transactions(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, amount_cents, currency, gateway_reference,
                   status, failure_reason, created_at
            FROM transactions
            WHERE subscription_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn commit_payment(
        &self,
        transaction: &Transaction,
        subscription: Option<VersionedWrite<'_>>,
    ) -> BillingResult<()> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, subscription_id, amount_cents, currency, gateway_reference,
                 status, failure_reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (gateway_reference) DO UPDATE SET
                status = EXCLUDED.status,
                failure_reason = EXCLUDED.failure_reason
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.subscription_id)
        .bind(transaction.amount_cents)
        .bind(&transaction.currency)
        .bind(&transaction.gateway_reference)
        .bind(transaction.status.as_str())
        .bind(&transaction.failure_reason)
        .bind(transaction.created_at)
        .execute(&mut *db_tx)
        .await?;

        if let Some(write) = subscription {
            let result = update_query(&write).execute(&mut *db_tx).await?;
            if result.rows_affected() == 0 {
                db_tx.rollback().await?;
                return Err(version_conflict(write.subscription.id));
            }
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn list_period_ended(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE (status = 'active' OR (status = 'past_due' AND cancel_at_period_end))
              AND current_period_end IS NOT NULL
              AND current_period_end <= $1
            ORDER BY current_period_end ASC
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }
}
