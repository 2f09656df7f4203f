//! Gateway webhook ingress
//!
//! The gateway only ever sees 200, 400 or 500 here. Retries, dead letters and
//! invalid transitions are handled behind a 200.

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use paywire_billing::{WebhookOutcome, WebhookRequest, SIGNATURE_HEADER};
use serde_json::json;
use time::OffsetDateTime;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /webhooks/{provider}
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<Response> {
    let receiver = &state.pipeline.receiver;
    if provider != receiver.provider() {
        return Err(ApiError::NotFound(format!("webhook provider '{}'", provider)));
    }

    // Oversized or unreadable bodies are a 400 to the gateway, never a 413
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!(
                provider = %provider,
                error = %rejection.body_text(),
                "Webhook body rejected"
            );
            let body = json!({ "error": "invalid_body", "message": rejection.body_text() });
            return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
        }
    };

    let request = WebhookRequest {
        content_type: headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        signature: headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()),
        body: &body,
    };
    let (event_id, outcome) = receiver.receive(request).await;

    let status =
        StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match &outcome {
        WebhookOutcome::Rejected {
            error_code,
            message,
            ..
        } => json!({ "error": error_code, "message": message }),
        WebhookOutcome::Duplicate => json!({
            "received": true,
            "status": outcome.label(),
            "event_id": event_id,
            "message": "Event already processed",
        }),
        _ => json!({
            "received": true,
            "status": outcome.label(),
            "event_id": event_id,
        }),
    };

    Ok((status, Json(body)).into_response())
}

/// GET /webhooks/{provider}
pub async fn webhook_liveness(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if provider != state.pipeline.receiver.provider() {
        return Err(ApiError::NotFound(format!("webhook provider '{}'", provider)));
    }

    let timestamp = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "provider": provider,
        "status": "ok",
        "timestamp": timestamp,
    })))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use paywire_billing::{sign_payload, BillingPeriod};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::routes::test_support::*;

    fn charge(id: &str, reference: &str, subscription_id: Uuid) -> Vec<u8> {
        json!({
            "id": id,
            "type": "charge.completed",
            "created_at": 1_700_000_000,
            "data": { "reference": reference, "subscription_id": subscription_id, "amount": 1999 },
        })
        .to_string()
        .into_bytes()
    }

    fn webhook(body: Vec<u8>, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/gateway")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header("x-signature", sig);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_missing_signature_is_400() {
        let state = state();
        let (status, body) = send(&state, webhook(charge("evt_1", "ch_1", Uuid::new_v4()), None)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("Missing webhook signature"));
    }

    #[tokio::test]
    async fn test_processed_then_duplicate() {
        let state = state();
        let sub = state
            .pipeline
            .subscriptions
            .create(Uuid::new_v4(), "pro", BillingPeriod::Monthly)
            .await
            .unwrap();
        let body = charge("evt_1", "ch_1", sub.id);
        let sig = sign_payload(SECRET.as_bytes(), &body);

        let (status, first) = send(&state, webhook(body.clone(), Some(sig.clone()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "processed");
        assert_eq!(first["event_id"], "evt_1:1700000000");

        let (status, second) = send(&state, webhook(body, Some(sig))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["status"], "duplicate");
    }

    #[tokio::test]
    async fn test_bad_signature_is_400() {
        let state = state();
        let body = charge("evt_2", "ch_2", Uuid::new_v4());
        let (status, body) = send(&state, webhook(body, Some("00ff".to_string()))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "signature_invalid");
        assert!(state.pipeline.scheduler.is_empty().await);
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_400() {
        let state = state();
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/gateway")
            .header("content-type", "text/plain")
            .header("x-signature", "abc")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body_is_400() {
        let state = state();
        let body = vec![b' '; 2 * 1024 * 1024 + 1];
        let (status, body) = send(&state, webhook(body, Some("abc".to_string()))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_body");
    }

    #[tokio::test]
    async fn test_unknown_provider_is_404() {
        let state = state();
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/other")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_liveness_and_method_not_allowed() {
        let state = state();

        let request = Request::builder()
            .uri("/webhooks/gateway")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider"], "gateway");
        assert!(body["timestamp"].is_string());

        let request = Request::builder()
            .method("PUT")
            .uri("/webhooks/gateway")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
