//! Periodic sweep over time-boundary transitions
//!
//! One sweep runs three independent steps in order:
//!
//! 1. expire pending invoices older than the invoice TTL
//! 2. commit pending plan and seat changes whose period has ended
//! 3. move lapsed subscriptions to past_due or expired
//!
//! A failing record is logged and reported; it never stops the rest of the
//! sweep. Each record gets a bounded amount of time.

use serde::Serialize;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::invoices::InvoiceService;
use crate::subscriptions::{CommitOutcome, ExpiryCounts, SubscriptionService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStep {
    StaleInvoices,
    PendingChanges,
    Expiry,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub step: SweepStep,
    pub record_id: Option<Uuid>,
    pub error: String,
}

/// A pending change that could not be committed because the company has more
/// active employees than the new seat cap allows
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckPendingChange {
    pub subscription_id: Uuid,
    pub company_id: Uuid,
    pub pending_plan_id: Option<String>,
    pub pending_max_seats: Option<i32>,
    pub active_employees: i64,
    pub new_max_seats: i32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub invoices_expired: usize,
    pub changes_committed: usize,
    pub stuck_pending: Vec<StuckPendingChange>,
    pub expiry: ExpiryCounts,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.stuck_pending.is_empty()
    }

    fn fail(&mut self, step: SweepStep, record_id: Option<Uuid>, error: String) {
        self.failures.push(SweepFailure {
            step,
            record_id,
            error,
        });
    }
}

#[derive(Clone)]
pub struct Sweeper {
    subscriptions: SubscriptionService,
    invoices: InvoiceService,
    record_timeout: std::time::Duration,
}

impl Sweeper {
    pub fn new(
        subscriptions: SubscriptionService,
        invoices: InvoiceService,
        config: &BillingConfig,
    ) -> Self {
        Self {
            subscriptions,
            invoices,
            record_timeout: config.record_timeout,
        }
    }

    pub async fn run_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        self.expire_stale_invoices(&mut report).await;
        self.commit_pending_changes(&mut report).await;
        self.expire_lapsed(&mut report).await;

        if report.is_clean() {
            tracing::info!(
                invoices_expired = report.invoices_expired,
                changes_committed = report.changes_committed,
                subscriptions_transitioned = report.expiry.total(),
                "Billing sweep complete"
            );
        } else {
            tracing::warn!(
                invoices_expired = report.invoices_expired,
                changes_committed = report.changes_committed,
                subscriptions_transitioned = report.expiry.total(),
                stuck_pending = report.stuck_pending.len(),
                failures = report.failures.len(),
                "Billing sweep complete with problems"
            );
        }
        report
    }

    async fn expire_stale_invoices(&self, report: &mut SweepReport) {
        match self.invoices.expire_stale_invoices().await {
            Ok(sweep) => {
                report.invoices_expired = sweep.expired.len();
                for (invoice_id, error) in sweep.failed {
                    report.fail(SweepStep::StaleInvoices, Some(invoice_id), error);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list stale invoices");
                report.fail(SweepStep::StaleInvoices, None, e.to_string());
            }
        }
    }

    async fn commit_pending_changes(&self, report: &mut SweepReport) {
        let due = match self.subscriptions.list_due_pending_changes().await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list pending subscription changes");
                report.fail(SweepStep::PendingChanges, None, e.to_string());
                return;
            }
        };

        for sub in due {
            let outcome = tokio::time::timeout(
                self.record_timeout,
                self.subscriptions.commit_pending_change(sub.id),
            )
            .await;

            match outcome {
                Ok(Ok(CommitOutcome::Committed(_))) => report.changes_committed += 1,
                Ok(Ok(CommitOutcome::Refused { active, max_seats })) => {
                    report.stuck_pending.push(StuckPendingChange {
                        subscription_id: sub.id,
                        company_id: sub.company_id,
                        pending_plan_id: sub.pending_plan_id.clone(),
                        pending_max_seats: sub.pending_max_seats,
                        active_employees: active,
                        new_max_seats: max_seats,
                    });
                }
                Ok(Ok(CommitOutcome::NotEligible(status))) => {
                    tracing::debug!(
                        subscription_id = %sub.id,
                        company_id = %sub.company_id,
                        status = %status,
                        "Skipping pending change on terminal subscription"
                    );
                }
                Ok(Ok(CommitOutcome::NotDue | CommitOutcome::NothingPending)) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        company_id = %sub.company_id,
                        error = %e,
                        transient = e.is_transient(),
                        "Failed to commit pending subscription change"
                    );
                    report.fail(SweepStep::PendingChanges, Some(sub.id), e.to_string());
                }
                Err(_) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        company_id = %sub.company_id,
                        "Timed out committing pending subscription change"
                    );
                    report.fail(
                        SweepStep::PendingChanges,
                        Some(sub.id),
                        "timed out".to_string(),
                    );
                }
            }
        }
    }

    async fn expire_lapsed(&self, report: &mut SweepReport) {
        let outcome = tokio::time::timeout(
            self.record_timeout,
            self.subscriptions.expire_lapsed_subscriptions(),
        )
        .await;

        match outcome {
            Ok(Ok(counts)) => report.expiry = counts,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to apply subscription expiry");
                report.fail(SweepStep::Expiry, None, e.to_string());
            }
            Err(_) => {
                tracing::error!("Timed out applying subscription expiry");
                report.fail(SweepStep::Expiry, None, "timed out".to_string());
            }
        }
    }
}
