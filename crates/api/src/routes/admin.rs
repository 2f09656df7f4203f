//! Operator routes
//!
//! Dead-letter review and replay, retry queue inspection and health reset.
//! Mounted behind `require_admin`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use paywire_billing::{DeadLetterRecord, HealthStatus, RetryQueueEntry};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub dead_letters: Vec<DeadLetterRecord>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RetryQueueResponse {
    pub items: Vec<RetryQueueEntry>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub id: Uuid,
    pub webhook_id: String,
    pub queued: bool,
}

/// GET /admin/dead-letters
pub async fn list_dead_letters(State(state): State<AppState>) -> Json<DeadLetterListResponse> {
    let dead_letters = state.pipeline.dead_letters.list().await;
    Json(DeadLetterListResponse {
        total: dead_letters.len(),
        dead_letters,
    })
}

/// GET /admin/dead-letters/{id}
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeadLetterRecord>> {
    state
        .pipeline
        .dead_letters
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("dead letter {}", id)))
}

/// POST /admin/dead-letters/{id}/replay
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<ReplayResponse>)> {
    let record = state.pipeline.replay_dead_letter(id).await?;

    tracing::info!(
        dead_letter_id = %id,
        webhook_id = %record.webhook_id,
        "Dead letter replayed by operator"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ReplayResponse {
            id,
            webhook_id: record.webhook_id,
            queued: true,
        }),
    ))
}

/// GET /admin/retry-queue
pub async fn retry_queue(State(state): State<AppState>) -> Json<RetryQueueResponse> {
    let items = state.pipeline.scheduler.snapshot().await;
    Json(RetryQueueResponse {
        total: items.len(),
        items,
    })
}

/// POST /admin/health/reset
pub async fn reset_health(State(state): State<AppState>) -> Json<HealthStatus> {
    state.pipeline.health.reset();
    Json(state.pipeline.health.status())
}

#[cfg(test)]
mod tests {
    use paywire_billing::{sign_payload, WebhookRequest};
    use serde_json::json;

    use super::*;
    use crate::routes::test_support::*;

    /// Deliver a charge for a subscription that does not exist
    async fn dead_letter_one(state: &AppState) -> Uuid {
        let body = json!({
            "id": "evt_dl",
            "type": "charge.completed",
            "created_at": 1_700_000_000,
            "data": { "reference": "ch_dl", "subscription_id": Uuid::new_v4(), "amount": 100 },
        })
        .to_string()
        .into_bytes();
        let signature = sign_payload(SECRET.as_bytes(), &body);
        state
            .pipeline
            .receiver
            .receive(WebhookRequest {
                content_type: Some("application/json"),
                signature: Some(&signature),
                body: &body,
            })
            .await;
        state.pipeline.dead_letters.list().await[0].id
    }

    #[tokio::test]
    async fn test_list_and_get_dead_letters() {
        let state = state();
        let id = dead_letter_one(&state).await;

        let (status, body) = send(&state, admin_request("GET", "/admin/dead-letters", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["dead_letters"][0]["webhook_id"], "evt_dl:1700000000");
        assert!(body["dead_letters"][0].get("signature").is_none());

        let uri = format!("/admin/dead-letters/{}", id);
        let (status, body) = send(&state, admin_request("GET", &uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error_code"], "permanent_processing_error");
    }

    #[tokio::test]
    async fn test_replay_moves_record_to_retry_queue() {
        let state = state();
        let id = dead_letter_one(&state).await;

        let uri = format!("/admin/dead-letters/{}/replay", id);
        let (status, body) = send(&state, admin_request("POST", &uri, None)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["queued"], true);
        assert!(state.pipeline.dead_letters.is_empty().await);

        let (_, queue) = send(&state, admin_request("GET", "/admin/retry-queue", None)).await;
        assert_eq!(queue["total"], 1);
        assert_eq!(queue["items"][0]["attempts"], 0);

        let (status, _) = send(&state, admin_request("POST", &uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_health() {
        let state = state();
        for _ in 0..12 {
            state.pipeline.health.record_failure();
        }
        let (status, body) = send(&state, admin_request("POST", "/admin/health/reset", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], "healthy");
        assert_eq!(body["total_failed"], 0);
    }
}
