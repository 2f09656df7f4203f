//! Process startup helpers shared by the API server and the worker

use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Connect to Postgres, retrying while the database comes up
pub async fn connect_database(database_url: &str) -> anyhow::Result<PgPool> {
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(6);

    let pool = Retry::spawn(strategy, || async {
        PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Database not reachable, retrying"))
    })
    .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// CORS for the operator routes; gateways do not send preflights
pub fn cors_layer() -> CorsLayer {
    let allowed_origins: Vec<HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    tracing::info!(allowed_origins = ?allowed_origins, "CORS configured");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
}
