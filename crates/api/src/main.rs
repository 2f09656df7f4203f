// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Paywire API Server
//!
//! Receives gateway webhooks, runs the retry worker in-process and serves the
//! operator routes. Falls back to in-memory storage when `DATABASE_URL` or
//! `REDIS_URL` are unset.

use std::net::SocketAddr;
use std::sync::Arc;

use paywire_api::{startup, AppState, Config};
use paywire_billing::{
    BillingStore, IdempotencyStore, InMemoryBillingStore, InMemoryIdempotencyStore,
    PgBillingStore, RedisIdempotencyStore, TracingNotifier, WebhookPipeline,
};
use tokio::sync::watch;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    startup::init_tracing("info,paywire_api=debug,paywire_billing=debug", config.log_json);

    tracing::info!("Starting Paywire API Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(config = ?config, "Configuration loaded");

    let store: Arc<dyn BillingStore> = match &config.database_url {
        Some(url) => {
            let pool = startup::connect_database(url).await?;
            let store = PgBillingStore::new(pool);
            store.migrate().await?;
            tracing::info!("Database migrations applied");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set - subscriptions are kept in memory");
            Arc::new(InMemoryBillingStore::new())
        }
    };

    let idempotency: Arc<dyn IdempotencyStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisIdempotencyStore::connect(url, &config.webhook.idempotency).await?),
        None => {
            tracing::warn!("REDIS_URL not set - idempotency keys are kept in memory");
            Arc::new(InMemoryIdempotencyStore::from_config(&config.webhook.idempotency))
        }
    };

    let pipeline = Arc::new(WebhookPipeline::new(
        config.webhook.clone(),
        store,
        idempotency,
        Arc::new(TracingNotifier),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let retry_worker = pipeline.spawn_retry_worker(shutdown_rx);
    tracing::info!("Retry worker started");

    let state = AppState::new(pipeline, config.admin_token.clone());
    let app = paywire_api::create_router(state)
        .layer(startup::cors_layer())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped, draining retry worker");
    let _ = shutdown_tx.send(true);
    if let Err(e) = retry_worker.await {
        tracing::error!(error = %e, "Retry worker exited abnormally");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
