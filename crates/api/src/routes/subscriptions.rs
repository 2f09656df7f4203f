//! Subscription routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use paywire_billing::{BillingPeriod, Subscription, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub user_id: Uuid,
    pub plan_id: String,
    pub billing_period: BillingPeriod,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelSubscriptionRequest {
    #[serde(default)]
    pub at_period_end: bool,
}

#[derive(Debug, Serialize)]
pub struct TransactionListResponse {
    pub subscription_id: Uuid,
    pub transactions: Vec<Transaction>,
}

/// POST /subscriptions
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let subscription = state
        .pipeline
        .subscriptions
        .create(req.user_id, &req.plan_id, req.billing_period)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

/// GET /subscriptions/{id}
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.pipeline.subscriptions.get(id).await?))
}

/// GET /subscriptions/{id}/transactions
pub async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TransactionListResponse>> {
    let transactions = state.pipeline.subscriptions.transactions(id).await?;
    Ok(Json(TransactionListResponse {
        subscription_id: id,
        transactions,
    }))
}

/// POST /subscriptions/{id}/cancel
///
/// The body is optional; an empty body cancels immediately.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelSubscriptionRequest>>,
) -> ApiResult<Json<Subscription>> {
    let Json(req) = body.unwrap_or_default();
    let subscription = state
        .pipeline
        .subscriptions
        .cancel(id, req.at_period_end)
        .await?;
    Ok(Json(subscription))
}
