#![cfg_attr(test, allow(clippy::unwrap_used))]

//! HRCore Background Worker
//!
//! Handles scheduled jobs:
//! - Billing sweep: stale invoices, deferred plan/seat changes, expiry (every 5 minutes)
//! - Billing invariant checks (hourly)

use std::sync::Arc;

use anyhow::Context;
use hrcore_billing::{BillingService, InvariantCheckSummary, SweepReport};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_SWEEP_CRON: &str = "0 */5 * * * *";
const INVARIANT_CRON: &str = "0 0 * * * *";

/// Log results of one sweep run
fn log_sweep_report(report: &SweepReport) {
    info!(
        invoices_expired = report.invoices_expired,
        changes_committed = report.changes_committed,
        cancelled_expired = report.expiry.cancelled_expired,
        grace_expired = report.expiry.grace_expired,
        moved_to_past_due = report.expiry.moved_to_past_due,
        stuck = report.stuck_pending.len(),
        failures = report.failures.len(),
        "Billing sweep complete"
    );

    for stuck in &report.stuck_pending {
        warn!(
            company_id = %stuck.company_id,
            subscription_id = %stuck.subscription_id,
            active_employees = stuck.active_employees,
            new_max_seats = stuck.new_max_seats,
            "Deferred change blocked by active employee count"
        );
    }

    for failure in &report.failures {
        error!(
            step = ?failure.step,
            record_id = ?failure.record_id,
            error = %failure.error,
            "Billing sweep step failed"
        );
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants healthy");
        return;
    }

    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            companies = ?violation.company_ids,
            description = %violation.description,
            "Billing invariant violated"
        );
    }
}

fn sweep_cron() -> String {
    std::env::var("SWEEP_CRON").unwrap_or_else(|_| DEFAULT_SWEEP_CRON.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting HRCore Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = hrcore_shared::create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool)?);

    // Catch up on anything that lapsed while the worker was down
    log_sweep_report(&billing.sweeper.run_sweep().await);

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Billing sweep
    let cron = sweep_cron();
    let sweeper = billing.sweeper.clone();
    scheduler
        .add(Job::new_async(cron.as_str(), move |_uuid, _l| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                info!("Running scheduled billing sweep");
                let report = sweeper.run_sweep().await;
                log_sweep_report(&report);
            })
        })?)
        .await?;
    info!(cron = %cron, "Scheduled: Billing sweep");

    // Job 2: Invariant checks
    let checker = billing.invariants.clone();
    scheduler
        .add(Job::new_async(INVARIANT_CRON, move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Failed to run billing invariant checks"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("HRCore Worker started successfully with 2 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
