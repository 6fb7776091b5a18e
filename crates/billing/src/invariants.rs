//! Billing invariants
//!
//! Runnable consistency checks over the ledger and invoices. They only read,
//! and each violation carries enough context to find the affected company.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Companies affected
    pub company_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customers may be billed twice or incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: [&str; 4] = [
    "single_pending_invoice",
    "pending_plan_not_upgrade",
    "paid_invoice_has_paid_at",
    "pending_seats_positive",
];

#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
    catalog: Catalog,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>, catalog: Catalog, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: self.clock.now(),
            checks_run: CHECKS.len(),
            checks_passed: CHECKS.len() - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one pending invoice per company
    async fn check_single_pending_invoice(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self.store.companies_with_multiple_pending_invoices().await?;
        Ok(rows
            .into_iter()
            .map(|(company_id, count)| InvariantViolation {
                invariant: "single_pending_invoice".to_string(),
                company_ids: vec![company_id],
                description: format!("Company has {} pending invoices (expected at most 1)", count),
                context: serde_json::json!({ "pending_invoices": count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A pending plan change is never an upgrade
    async fn check_pending_plan_not_upgrade(&self) -> BillingResult<Vec<InvariantViolation>> {
        let pending = self.store.list_with_pending_changes(None).await?;
        let mut violations = Vec::new();

        for sub in pending {
            let Some(pending_id) = sub.pending_plan_id.as_deref() else {
                continue;
            };
            let current = self.catalog.get_plan(&sub.plan_id).await;
            let target = self.catalog.get_plan(pending_id).await;

            let problem = match (current, target) {
                (Ok(current), Ok(target)) if target.is_higher_tier_than(&current) => {
                    Some(format!(
                        "Pending plan '{}' is a higher tier than current plan '{}'",
                        target.id, current.id
                    ))
                }
                (Ok(_), Ok(_)) => None,
                (Err(BillingError::NotFound(msg)), _) | (_, Err(BillingError::NotFound(msg))) => {
                    Some(msg)
                }
                (Err(e), _) | (_, Err(e)) => return Err(e),
            };

            if let Some(description) = problem {
                violations.push(InvariantViolation {
                    invariant: "pending_plan_not_upgrade".to_string(),
                    company_ids: vec![sub.company_id],
                    description,
                    context: serde_json::json!({
                        "subscription_id": sub.id,
                        "plan_id": sub.plan_id,
                        "pending_plan_id": pending_id,
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    async fn check_paid_invoice_has_paid_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let invoices = self.store.paid_invoices_missing_paid_at().await?;
        Ok(invoices
            .into_iter()
            .map(|invoice| InvariantViolation {
                invariant: "paid_invoice_has_paid_at".to_string(),
                company_ids: vec![invoice.company_id],
                description: "Paid invoice has no paid_at timestamp".to_string(),
                context: serde_json::json!({
                    "invoice_id": invoice.id,
                    "provider_invoice_id": invoice.provider_invoice_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_pending_seats_positive(&self) -> BillingResult<Vec<InvariantViolation>> {
        let pending = self.store.list_with_pending_changes(None).await?;
        Ok(pending
            .into_iter()
            .filter(|s| s.pending_max_seats.is_some_and(|n| n < 1))
            .map(|sub| InvariantViolation {
                invariant: "pending_seats_positive".to_string(),
                company_ids: vec![sub.company_id],
                description: format!(
                    "Pending seat count {:?} is not positive",
                    sub.pending_max_seats
                ),
                context: serde_json::json!({
                    "subscription_id": sub.id,
                    "max_seats": sub.max_seats,
                    "pending_max_seats": sub.pending_max_seats,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_pending_invoice" => self.check_single_pending_invoice().await,
            "pending_plan_not_upgrade" => self.check_pending_plan_not_upgrade().await,
            "paid_invoice_has_paid_at" => self.check_paid_invoice_has_paid_at().await,
            "pending_seats_positive" => self.check_pending_seats_positive().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}
