//! Matchday Background Worker
//!
//! Handles scheduled jobs including:
//! - Grace-period reconciliation: day-7 reminders and day-14 hides
//!   (every 15 minutes)
//! - Stripe event ledger pruning (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)
//!
//! The reconciler also runs behind an authenticated API trigger; the two
//! paths converge because every per-venue action is guarded in SQL.

use std::sync::Arc;
use std::time::Duration;

use matchday_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// How long processed ledger entries are kept before pruning.
const LEDGER_RETENTION_DAYS: i32 = 30;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Matchday Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If Stripe isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without Stripe integration");

            // Keep running with minimal functionality
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Grace-period reconciliation (every 15 minutes)
    // A venue that never receives a second webhook must still get its day-7
    // reminder and day-14 hide on schedule.
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                info!("Running grace period reconciliation job");
                let now = OffsetDateTime::now_utc();
                match billing.reconciler.reconcile(now).await {
                    Ok(summary) => {
                        info!(
                            scanned = summary.scanned,
                            reminded = summary.reminded,
                            hidden = summary.hidden,
                            errors = summary.errors,
                            "Grace period reconciliation job complete"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Grace period reconciliation job failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Grace period reconciliation (every 15 minutes)");

    // Job 2: Prune processed ledger entries (daily at 3:00 AM UTC)
    // Entries in 'error' or 'processing' are kept for diagnostics.
    let prune_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                info!("Running ledger pruning job");
                match billing.ledger.prune_processed(LEDGER_RETENTION_DAYS).await {
                    Ok(deleted) => info!(deleted = deleted, "Ledger pruning complete"),
                    Err(e) => error!(error = %e, "Ledger pruning failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger pruning (daily at 3:00 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Matchday Worker started successfully with 3 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
