//! LedgerPay Background Worker
//!
//! Handles scheduled ledger maintenance:
//! - Grace-deadline sweep: expire past_due and stale pending subscriptions (hourly)
//! - Webhook dedupe ledger cleanup (daily at 3:00 AM UTC)
//! - Ledger invariant checks (daily at 4:00 AM UTC)
//! - Stuck refund detection (every 6 hours)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use ledgerpay_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// How long fully-processed webhook events are retained before cleanup.
const WEBHOOK_RETENTION_DAYS: i64 = 30;

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
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting LedgerPay Worker");

    let pool = create_db_pool().await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Stripe config none of the jobs can do useful work.
            error!(error = %e, "Failed to create billing service");
            return Err(e.into());
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Grace-deadline sweep (hourly)
    // Moves past_due subscriptions whose grace elapsed (and never-paid
    // pending ones) to expired.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running grace-deadline sweep");
                match billing.subscriptions.expire_overdue().await {
                    Ok(expired) => {
                        info!(expired = expired.len(), "Grace-deadline sweep complete");
                    }
                    Err(e) => error!(error = %e, "Grace-deadline sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Grace-deadline sweep (hourly)");

    // Job 2: Webhook dedupe ledger cleanup (daily at 3:00 AM UTC)
    // Only fully-processed events are pruned; error rows stay for replay.
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                info!("Running webhook ledger cleanup");
                match billing
                    .store
                    .delete_processed_webhook_events_older_than(WEBHOOK_RETENTION_DAYS)
                    .await
                {
                    Ok(deleted) => info!(deleted = deleted, "Webhook ledger cleanup complete"),
                    Err(e) => error!(error = %e, "Webhook ledger cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook ledger cleanup (daily at 3:00 AM UTC)");

    // Job 3: Ledger invariant checks (daily at 4:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running ledger invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Ledger invariants healthy");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Ledger invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Ledger invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Ledger invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (daily at 4:00 AM UTC)");

    // Job 4: Stuck refund detection (every 6 hours)
    // Refunds pending over an hour died between the audit insert and the
    // provider outcome; flag them for manual reconciliation.
    let refund_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 */6 * * *", move |_uuid, _l| {
            let billing = refund_billing.clone();
            Box::pin(async move {
                match billing.refund.list_stuck_refunds().await {
                    Ok(stuck) if stuck.is_empty() => {
                        info!("No stuck refunds");
                    }
                    Ok(stuck) => {
                        for record in &stuck {
                            warn!(
                                refund_record_id = %record.id,
                                transaction_id = %record.transaction_id,
                                amount_cents = record.amount_cents,
                                created_at = %record.created_at,
                                "Refund stuck in pending; reconcile against the provider"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Stuck refund check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stuck refund detection (every 6 hours)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("LedgerPay Worker started successfully with 5 scheduled jobs");

    // The scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
