//! HTTP routes

pub mod admin;
pub mod health;
pub mod subscriptions;
pub mod webhooks;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(
            "/webhooks/{provider}",
            post(webhooks::receive_webhook).get(webhooks::webhook_liveness),
        )
        .route("/health", get(health::health))
        .route("/ready", get(health::ready));

    if state.admin_token.is_some() {
        let operator = Router::new()
            .route("/admin/dead-letters", get(admin::list_dead_letters))
            .route("/admin/dead-letters/{id}", get(admin::get_dead_letter))
            .route(
                "/admin/dead-letters/{id}/replay",
                post(admin::replay_dead_letter),
            )
            .route("/admin/retry-queue", get(admin::retry_queue))
            .route("/admin/health/reset", post(admin::reset_health))
            .route("/subscriptions", post(subscriptions::create_subscription))
            .route("/subscriptions/{id}", get(subscriptions::get_subscription))
            .route(
                "/subscriptions/{id}/transactions",
                get(subscriptions::list_transactions),
            )
            .route(
                "/subscriptions/{id}/cancel",
                post(subscriptions::cancel_subscription),
            )
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        router = router.merge(operator);
    }

    router.with_state(state)
}

/// Middleware that requires the operator bearer token
pub async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let authorized = match (state.admin_token.as_deref(), provided) {
        (Some(expected), Some(token)) => bool::from(expected.as_bytes().ct_eq(token.as_bytes())),
        _ => false,
    };

    if !authorized {
        tracing::warn!(
            path = %request.uri().path(),
            has_token = provided.is_some(),
            "Operator route: authentication failed"
        );
        return ApiError::Unauthorized.into_response();
    }

    next.run(request).await
}
