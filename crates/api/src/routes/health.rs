//! Health and readiness

use axum::{extract::State, http::StatusCode, Json};
use paywire_billing::HealthStatus;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub status: HealthStatus,
    pub retry_queue_depth: usize,
    pub dead_letters: usize,
    pub version: &'static str,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let pipeline = &state.pipeline;
    Json(HealthResponse {
        status: pipeline.health.status(),
        retry_queue_depth: pipeline.scheduler.len().await,
        dead_letters: pipeline.dead_letters.len().await,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /ready - 503 once processing health is critical
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let health = &state.pipeline.health;
    let status = if health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "ready": health.is_ready(),
            "level": health.level(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;

    use super::*;
    use crate::routes::test_support::*;

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_counters() {
        let state = state();
        state.pipeline.health.record_failure();

        let (status, body) = send(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], "healthy");
        assert_eq!(body["consecutive_failures"], 1);
        assert_eq!(body["retry_queue_depth"], 0);
    }

    #[tokio::test]
    async fn test_ready_turns_unavailable_when_critical() {
        let state = state();
        let (status, _) = send(&state, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);

        for _ in 0..10 {
            state.pipeline.health.record_failure();
        }
        let (status, body) = send(&state, get("/ready")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["level"], "critical");
    }
}
