//! Billing error types
//!
//! Every failure in the webhook pipeline is classified here. The split between
//! retryable and non-retryable variants decides whether an event goes back
//! into the retry queue or straight to the dead-letter queue.

use thiserror::Error;
use uuid::Uuid;

use crate::subscriptions::SubscriptionStatus;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed request (wrong content type, missing header). Never retried.
    #[error("{0}")]
    Validation(String),

    /// Body could not be parsed into a gateway event. Never retried.
    #[error("Invalid webhook payload: {0}")]
    Parse(String),

    /// Signature did not match the configured secret. Never retried.
    #[error("Invalid webhook signature")]
    SignatureInvalid,

    /// Event was already processed. Not a failure.
    #[error("Webhook event {0} already processed")]
    DuplicateEvent(String),

    /// Network, storage or lock contention failure that may succeed later.
    #[error("Transient processing error: {0}")]
    Transient(String),

    /// Data integrity violation that a retry cannot fix.
    #[error("Permanent processing error: {0}")]
    Permanent(String),

    #[error("Invalid transition for subscription {subscription_id}: cannot apply '{event}' in state '{from}'")]
    InvalidTransition {
        subscription_id: Uuid,
        from: SubscriptionStatus,
        event: String,
    },

    #[error("Processing timed out after {0}ms")]
    Timeout(u64),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the failure may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Transient(_)
                | BillingError::Timeout(_)
                | BillingError::Database(_)
                | BillingError::Redis(_)
        )
    }

    /// Short machine-readable code used in logs and dead-letter records
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation_error",
            BillingError::Parse(_) => "parse_error",
            BillingError::SignatureInvalid => "signature_invalid",
            BillingError::DuplicateEvent(_) => "duplicate_event",
            BillingError::Transient(_) => "transient_processing_error",
            BillingError::Permanent(_) => "permanent_processing_error",
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::Timeout(_) => "processing_timeout",
            BillingError::Database(_) => "database_error",
            BillingError::Redis(_) => "redis_error",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::Config(_) => "config_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(e: redis::RedisError) -> Self {
        BillingError::Redis(e.to_string())
    }
}
