//! Paywire Background Worker
//!
//! Handles scheduled jobs:
//! - Period-end sweep: expires or cancels active subscriptions whose paid
//!   period ended without a renewal (every 5 minutes by default)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use anyhow::Context;
use paywire_api::startup;
use paywire_billing::{PgBillingStore, SubscriptionLocks, SubscriptionService, TracingNotifier};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_SWEEP_CRON: &str = "0 */5 * * * *";
const DEFAULT_SWEEP_BATCH: i64 = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let log_json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    startup::init_tracing("info,paywire_worker=debug", log_json);

    info!("Starting Paywire Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = startup::connect_database(&database_url).await?;

    // Locks only serialize within this process; writes racing the API are
    // caught by the store's version check.
    let service = SubscriptionService::new(
        Arc::new(PgBillingStore::new(pool)),
        Arc::new(TracingNotifier),
        SubscriptionLocks::new(),
    );

    let sweep_cron =
        std::env::var("RENEWAL_SWEEP_CRON").unwrap_or_else(|_| DEFAULT_SWEEP_CRON.to_string());
    let batch_size = match std::env::var("SWEEP_BATCH_SIZE") {
        Ok(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("SWEEP_BATCH_SIZE is not a number: {}", raw))?,
        Err(_) => DEFAULT_SWEEP_BATCH,
    };

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: period-end sweep
    scheduler
        .add(Job::new_async(sweep_cron.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                info!("Running period-end sweep");
                match service
                    .sweep_period_end(OffsetDateTime::now_utc(), batch_size)
                    .await
                {
                    Ok(report) => {
                        info!(
                            examined = report.examined,
                            expired = report.expired,
                            cancelled = report.cancelled,
                            failed = report.failed,
                            "Period-end sweep complete"
                        );
                        if report.examined as i64 >= batch_size {
                            warn!(batch_size, "Sweep hit its batch limit");
                        }
                    }
                    Err(e) => error!(error = %e, "Period-end sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %sweep_cron, "Scheduled: Period-end sweep");

    // Job 2: heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
