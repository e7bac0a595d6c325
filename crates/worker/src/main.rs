//! subsync Background Worker
//!
//! Handles scheduled jobs including:
//! - Payment recovery sweep for failed subscriptions (every 15 minutes)
//! - Trial expiration sweep (hourly)
//! - Idempotency ledger cleanup (daily at 3:00 AM UTC)
//! - Billing invariant checks (daily at 5:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use subsync_billing::{BillingService, RecoveryOutcome};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Ledger rows older than this are safe to drop; providers stop
/// redelivering events long before.
const LEDGER_RETENTION_DAYS: i64 = 90;

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

/// Log results of a payment recovery sweep
fn log_recovery_results(results: &[RecoveryOutcome]) {
    let recovered = results
        .iter()
        .filter(|r| matches!(r, RecoveryOutcome::Recovered { .. }))
        .count();
    let still_failing = results
        .iter()
        .filter(|r| matches!(r, RecoveryOutcome::StillFailing { .. }))
        .count();
    let cancelled = results
        .iter()
        .filter(|r| matches!(r, RecoveryOutcome::CancelledAfterGrace { .. }))
        .count();
    let skipped = results
        .iter()
        .filter(|r| matches!(r, RecoveryOutcome::Skipped { .. }))
        .count();

    info!(
        recovered = recovered,
        still_failing = still_failing,
        cancelled = cancelled,
        skipped = skipped,
        "Payment recovery sweep complete"
    );

    // Log individual failures
    for result in results {
        if let RecoveryOutcome::StillFailing {
            subscription_id,
            error,
        } = result
        {
            warn!(
                subscription_id = %subscription_id,
                error = %error,
                "Subscription still failing after recovery attempt"
            );
        }
    }
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

    info!("Starting subsync Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If the provider isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without payment provider integration");

            // Keep running with minimal functionality
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Payment recovery sweep (every 15 minutes)
    // Re-charges payment_failed subscriptions past their backoff window and
    // cancels those past the grace period
    let recovery_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = recovery_billing.clone();
            Box::pin(async move {
                info!("Running payment recovery sweep");
                match billing.payments.run_recovery_sweep().await {
                    Ok(results) => log_recovery_results(&results),
                    Err(e) => error!(error = %e, "Payment recovery sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Payment recovery sweep (every 15 minutes)");

    // Job 2: Trial expiration sweep (hourly)
    let trial_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = trial_billing.clone();
            Box::pin(async move {
                info!("Running trial expiration sweep");
                match billing.trials.run_expiration_sweep().await {
                    Ok(expired) => {
                        info!(expired = expired.len(), "Trial expiration sweep complete")
                    }
                    Err(e) => error!(error = %e, "Trial expiration sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiration sweep (hourly)");

    // Job 3: Idempotency ledger cleanup (daily at 3:00 AM UTC)
    let ledger_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = ledger_billing.clone();
            Box::pin(async move {
                info!("Running idempotency ledger cleanup");
                match billing
                    .ledger
                    .cleanup_older_than(LEDGER_RETENTION_DAYS)
                    .await
                {
                    Ok(deleted) => info!(deleted = deleted, "Ledger cleanup complete"),
                    Err(e) => error!(error = %e, "Ledger cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Idempotency ledger cleanup (daily at 3:00 AM UTC)");

    // Job 4: Billing invariant checks (daily at 5:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "All billing invariants hold"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Billing invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 5:00 AM UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
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

    info!("subsync Worker started successfully with {} scheduled jobs", 5);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
