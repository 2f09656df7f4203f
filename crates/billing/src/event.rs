//! Gateway event envelope
//!
//! The gateway sends a JSON envelope:
//!
//! ```json
//! {
//!   "id": "evt_1",
//!   "type": "charge.completed",
//!   "created_at": 1700000000,
//!   "data": { "reference": "ch_1", "subscription_id": "...", "amount": 1999, "currency": "usd" }
//! }
//! ```
//!
//! The idempotency key is derived from `id` and `created_at` together, since
//! some gateways reuse ids across environments.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Event types the processor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChargeCompleted,
    ChargeFailed,
    TransferCompleted,
    SubscriptionCancelled,
    Unknown,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "charge.completed" | "charge.succeeded" => EventKind::ChargeCompleted,
            "charge.failed" => EventKind::ChargeFailed,
            "transfer.completed" => EventKind::TransferCompleted,
            "subscription.cancelled" | "subscription.canceled" => {
                EventKind::SubscriptionCancelled
            }
            _ => EventKind::Unknown,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(alias = "created")]
    created_at: i64,
    #[serde(default)]
    data: serde_json::Value,
}

/// A parsed, not yet verified, webhook delivery
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// Idempotency key: `{gateway id}:{created_at}`
    pub event_id: String,
    pub gateway_event_id: String,
    pub event_type: String,
    pub kind: EventKind,
    pub created_at: i64,
    pub data: serde_json::Value,
    pub received_at: OffsetDateTime,
}

impl WebhookEvent {
    /// Parse a raw request body
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        let envelope: Envelope =
            serde_json::from_slice(body).map_err(|e| BillingError::Parse(e.to_string()))?;

        if envelope.id.trim().is_empty() {
            return Err(BillingError::Parse("event id is empty".to_string()));
        }
        if envelope.event_type.trim().is_empty() {
            return Err(BillingError::Parse("event type is empty".to_string()));
        }

        Ok(Self {
            event_id: derive_event_id(&envelope.id, envelope.created_at),
            kind: EventKind::from_type(&envelope.event_type),
            gateway_event_id: envelope.id,
            event_type: envelope.event_type,
            created_at: envelope.created_at,
            data: envelope.data,
            received_at: OffsetDateTime::now_utc(),
        })
    }

    /// When the gateway says the event happened, never later than receipt
    pub fn occurred_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created_at)
            .map_or(self.received_at, |at| at.min(self.received_at))
    }

    /// Decode the `data` object of a charge event
    pub fn charge(&self) -> BillingResult<ChargeData> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| BillingError::Permanent(format!("malformed charge data: {}", e)))
    }

    /// Decode the `data` object of a cancellation event
    pub fn cancellation(&self) -> BillingResult<CancellationData> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| BillingError::Permanent(format!("malformed cancellation data: {}", e)))
    }
}

/// Derive the idempotency key for a gateway event
pub fn derive_event_id(gateway_event_id: &str, created_at: i64) -> String {
    format!("{}:{}", gateway_event_id, created_at)
}

/// Payload of `charge.*` events
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeData {
    /// Gateway reference of the charge, unique per payment attempt
    #[serde(alias = "charge_id")]
    pub reference: String,
    pub subscription_id: Uuid,
    /// Amount in minor units
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Payload of `subscription.cancelled` events
#[derive(Debug, Clone, Deserialize)]
pub struct CancellationData {
    pub subscription_id: Uuid,
    #[serde(default)]
    pub at_period_end: bool,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_derives_event_id_from_id_and_timestamp() {
        let body = br#"{"id":"evt_1","type":"charge.completed","created_at":1700000000,"data":{}}"#;
        let event = WebhookEvent::parse(body).unwrap();
        assert_eq!(event.event_id, "evt_1:1700000000");
        assert_eq!(event.kind, EventKind::ChargeCompleted);
    }

    #[test]
    fn test_same_id_different_timestamp_is_a_different_event() {
        assert_ne!(derive_event_id("evt_1", 1), derive_event_id("evt_1", 2));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = WebhookEvent::parse(b"{not json").unwrap_err();
        assert!(matches!(err, BillingError::Parse(_)));
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let err = WebhookEvent::parse(br#"{"id":"evt_1"}"#).unwrap_err();
        assert!(matches!(err, BillingError::Parse(_)));

        let err =
            WebhookEvent::parse(br#"{"id":"","type":"charge.completed","created_at":1}"#).unwrap_err();
        assert!(matches!(err, BillingError::Parse(_)));
    }

    #[test]
    fn test_unknown_event_type_parses() {
        let body = br#"{"id":"evt_9","type":"payout.created","created":1700000000}"#;
        let event = WebhookEvent::parse(body).unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
    }

    #[test]
    fn test_charge_data_decoding() {
        let sub_id = Uuid::new_v4();
        let body = format!(
            r#"{{"id":"evt_2","type":"charge.failed","created_at":1,"data":{{"reference":"ch_1","subscription_id":"{}","amount":1999,"failure_reason":"card_declined"}}}}"#,
            sub_id
        );
        let event = WebhookEvent::parse(body.as_bytes()).unwrap();
        let charge = event.charge().unwrap();
        assert_eq!(charge.reference, "ch_1");
        assert_eq!(charge.subscription_id, sub_id);
        assert_eq!(charge.amount, 1999);
        assert_eq!(charge.currency, "usd");
        assert_eq!(charge.failure_reason.as_deref(), Some("card_declined"));
    }

    #[test]
    fn test_malformed_charge_data_is_permanent() {
        let body = br#"{"id":"evt_3","type":"charge.completed","created_at":1,"data":{"amount":"ten"}}"#;
        let event = WebhookEvent::parse(body).unwrap();
        assert!(matches!(event.charge(), Err(BillingError::Permanent(_))));
    }
}
