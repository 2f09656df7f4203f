//! Webhook pipeline configuration
//!
//! All values come from environment variables with defaults tuned for a
//! single-instance deployment. Only `WEBHOOK_SECRET` is required.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Gateway credentials
#[derive(Clone, Default)]
pub struct GatewayConfig {
    pub public_key: String,
    pub secret_key: String,
    /// Shared secret used to sign webhook bodies
    pub webhook_secret: String,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("public_key", &self.public_key)
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .finish()
    }
}

/// Retry scheduler tuning
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Upper bound on queued items; enqueue beyond it dead-letters the event
    pub queue_capacity: usize,
    /// Floor on the worker's sleep so a burst of due items cannot spin it
    pub min_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            queue_capacity: 10_000,
            min_wait: Duration::from_millis(50),
        }
    }
}

/// Idempotency store retention
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub retention: Duration,
    pub max_entries: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            max_entries: 100_000,
        }
    }
}

/// Consecutive-failure thresholds for health classification
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub degraded_threshold: u64,
    pub critical_threshold: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 5,
            critical_threshold: 10,
        }
    }
}

/// Top-level configuration for the webhook pipeline
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Accepted `{provider}` path segment
    pub provider: String,
    pub gateway: GatewayConfig,
    pub retry: RetryConfig,
    pub idempotency: IdempotencyConfig,
    pub health: HealthConfig,
    pub processing_timeout: Duration,
    pub dead_letter_capacity: usize,
    pub alert_webhook_url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            provider: "gateway".to_string(),
            gateway: GatewayConfig::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            health: HealthConfig::default(),
            processing_timeout: Duration::from_secs(10),
            dead_letter_capacity: 1_000,
            alert_webhook_url: None,
        }
    }
}

impl WebhookConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("WEBHOOK_SECRET not set".to_string()))?;
        if webhook_secret.is_empty() {
            return Err(BillingError::Config("WEBHOOK_SECRET is empty".to_string()));
        }

        let defaults = Self::default();

        let config = Self {
            provider: std::env::var("WEBHOOK_PROVIDER").unwrap_or(defaults.provider),
            gateway: GatewayConfig {
                public_key: std::env::var("GATEWAY_PUBLIC_KEY").unwrap_or_default(),
                secret_key: std::env::var("GATEWAY_SECRET_KEY").unwrap_or_default(),
                webhook_secret,
            },
            retry: RetryConfig {
                max_retries: env_or("RETRY_MAX_RETRIES", defaults.retry.max_retries)?,
                initial_delay: Duration::from_millis(env_or("RETRY_INITIAL_DELAY_MS", 1_000)?),
                max_delay: Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 10_000)?),
                backoff_factor: env_or("RETRY_BACKOFF_FACTOR", defaults.retry.backoff_factor)?,
                queue_capacity: env_or("RETRY_QUEUE_CAPACITY", defaults.retry.queue_capacity)?,
                min_wait: defaults.retry.min_wait,
            },
            idempotency: IdempotencyConfig {
                retention: Duration::from_secs(env_or("IDEMPOTENCY_RETENTION_SECS", 86_400)?),
                max_entries: env_or("IDEMPOTENCY_MAX_ENTRIES", defaults.idempotency.max_entries)?,
            },
            health: HealthConfig {
                degraded_threshold: env_or(
                    "HEALTH_DEGRADED_THRESHOLD",
                    defaults.health.degraded_threshold,
                )?,
                critical_threshold: env_or(
                    "HEALTH_CRITICAL_THRESHOLD",
                    defaults.health.critical_threshold,
                )?,
            },
            processing_timeout: Duration::from_millis(env_or("PROCESSING_TIMEOUT_MS", 10_000)?),
            dead_letter_capacity: env_or("DEAD_LETTER_CAPACITY", defaults.dead_letter_capacity)?,
            alert_webhook_url: std::env::var("ALERT_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would break the retry or health contracts
    pub fn validate(&self) -> BillingResult<()> {
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(BillingError::Config(
                "RETRY_BACKOFF_FACTOR must be >= 1.0".to_string(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(BillingError::Config(
                "RETRY_INITIAL_DELAY_MS must not exceed RETRY_MAX_DELAY_MS".to_string(),
            ));
        }
        if self.health.degraded_threshold >= self.health.critical_threshold {
            return Err(BillingError::Config(
                "HEALTH_DEGRADED_THRESHOLD must be below HEALTH_CRITICAL_THRESHOLD".to_string(),
            ));
        }
        if self.idempotency.max_entries == 0 {
            return Err(BillingError::Config(
                "IDEMPOTENCY_MAX_ENTRIES must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(default),
    }
}
