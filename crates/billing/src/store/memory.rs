//! In-process store backed by a mutex-guarded map set

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use hrcore_shared::{InvoiceStatus, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, SubscriptionWrite};
use crate::catalog::{Feature, Plan};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::invoices::{Invoice, PaymentDetails};
use crate::subscriptions::Subscription;

#[derive(Default)]
struct State {
    features: HashMap<String, Feature>,
    plans: HashMap<String, Plan>,
    subscriptions: HashMap<Uuid, Subscription>,
    invoices: HashMap<Uuid, Invoice>,
    events: Vec<BillingEvent>,
}

impl State {
    fn subscription_for_company(&self, company_id: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.company_id == company_id)
    }

    fn pending_for_company(&self, company_id: Uuid) -> impl Iterator<Item = &Invoice> {
        self.invoices
            .values()
            .filter(move |i| i.company_id == company_id && i.is_pending())
    }
}

/// Store used by tests and local runs. Every call takes the same lock, so each
/// trait method is atomic.
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn seed_feature(&self, feature: Feature) {
        self.state().features.insert(feature.code.clone(), feature);
    }

    /// Add a plan; its features are registered too
    pub fn seed_plan(&self, plan: Plan) {
        let mut state = self.state();
        for feature in &plan.features {
            state
                .features
                .entry(feature.code.clone())
                .or_insert_with(|| feature.clone());
        }
        state.plans.insert(plan.id.clone(), plan);
    }

    /// Store a subscription as-is, skipping all checks
    pub fn seed_subscription(&self, subscription: Subscription) {
        self.state()
            .subscriptions
            .insert(subscription.id, subscription);
    }

    /// Store an invoice as-is, skipping the single-pending check
    pub fn seed_invoice(&self, invoice: Invoice) {
        self.state().invoices.insert(invoice.id, invoice);
    }
}

fn apply_payment(invoice: &mut Invoice, payment: &PaymentDetails) {
    invoice.status = InvoiceStatus::Paid;
    invoice.paid_at = Some(payment.paid_at);
    invoice.payment_method = payment.method.clone();
    invoice.payment_channel = payment.channel.clone();
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn list_plans(&self, active_only: bool) -> BillingResult<Vec<Plan>> {
        let mut plans: Vec<Plan> = self
            .state()
            .plans
            .values()
            .filter(|p| !active_only || p.active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.tier_cmp(b));
        Ok(plans)
    }

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        Ok(self.state().plans.get(plan_id).cloned())
    }

    async fn get_feature(&self, code: &str) -> BillingResult<Option<Feature>> {
        Ok(self.state().features.get(code).cloned())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state().subscriptions.get(&id).cloned())
    }

    async fn get_subscription_by_company(
        &self,
        company_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.state().subscription_for_company(company_id).cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut state = self.state();
        if state
            .subscription_for_company(subscription.company_id)
            .is_some()
        {
            return Err(BillingError::Conflict(format!(
                "Company {} already has a subscription",
                subscription.company_id
            )));
        }
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let mut state = self.state();
        let Some(stored) = state.subscriptions.get_mut(&subscription.id) else {
            return Ok(false);
        };
        if stored.version != expected_version {
            return Ok(false);
        }
        *stored = subscription.clone();
        stored.version = expected_version + 1;
        Ok(true)
    }

    async fn list_expiring(
        &self,
        statuses: &[SubscriptionStatus],
        before: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .state()
            .subscriptions
            .values()
            .filter(|s| statuses.contains(&s.status) && s.period_end < before)
            .cloned()
            .collect())
    }

    async fn list_with_pending_changes(
        &self,
        due_by: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<Subscription>> {
        let mut due: Vec<Subscription> = self
            .state()
            .subscriptions
            .values()
            .filter(|s| s.has_pending_change())
            .filter(|s| due_by.map_or(true, |d| s.period_end <= d))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.period_end);
        Ok(due)
    }

    async fn update_expired_to_status(
        &self,
        from: &[SubscriptionStatus],
        cutoff: OffsetDateTime,
        to: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<u64> {
        let mut state = self.state();
        let mut moved = 0;
        for sub in state.subscriptions.values_mut() {
            if from.contains(&sub.status) && sub.period_end < cutoff {
                sub.status = to;
                sub.updated_at = now;
                sub.version += 1;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        let mut state = self.state();
        if invoice.is_pending() && state.pending_for_company(invoice.company_id).next().is_some() {
            return Err(BillingError::DuplicatePendingInvoice {
                company_id: invoice.company_id,
            });
        }
        state.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.state().invoices.get(&id).cloned())
    }

    async fn get_invoice_by_provider_id(
        &self,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        Ok(self
            .state()
            .invoices
            .values()
            .find(|i| i.provider_invoice_id.as_deref() == Some(provider_invoice_id))
            .cloned())
    }

    async fn find_pending_invoice(&self, company_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.state().pending_for_company(company_id).next().cloned())
    }

    async fn count_pending_invoices(&self, company_id: Uuid) -> BillingResult<i64> {
        Ok(self.state().pending_for_company(company_id).count() as i64)
    }

    async fn list_invoices(&self, company_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .state()
            .invoices
            .values()
            .filter(|i| i.company_id == company_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn attach_provider_invoice(
        &self,
        id: Uuid,
        provider_invoice_id: &str,
        invoice_url: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let mut state = self.state();
        let taken = state
            .invoices
            .values()
            .any(|i| i.id != id && i.provider_invoice_id.as_deref() == Some(provider_invoice_id));
        if taken {
            return Err(BillingError::Conflict(format!(
                "Provider invoice {} is already linked",
                provider_invoice_id
            )));
        }
        let invoice = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", id)))?;
        invoice.provider_invoice_id = Some(provider_invoice_id.to_string());
        invoice.invoice_url = Some(invoice_url.to_string());
        invoice.expires_at = expires_at;
        Ok(())
    }

    async fn transition_invoice(
        &self,
        id: Uuid,
        to: InvoiceStatus,
        payment: Option<&PaymentDetails>,
    ) -> BillingResult<bool> {
        let mut state = self.state();
        let Some(invoice) = state.invoices.get_mut(&id) else {
            return Ok(false);
        };
        if !invoice.is_pending() {
            return Ok(false);
        }
        match (to, payment) {
            (InvoiceStatus::Paid, Some(payment)) => apply_payment(invoice, payment),
            (InvoiceStatus::Paid, None) => {
                return Err(BillingError::InvalidInput(
                    "Paid transition needs payment details".to_string(),
                ))
            }
            _ => invoice.status = to,
        }
        Ok(true)
    }

    async fn settle_invoice(
        &self,
        id: Uuid,
        payment: &PaymentDetails,
        write: &SubscriptionWrite,
    ) -> BillingResult<bool> {
        let mut state = self.state();
        match state.invoices.get(&id) {
            Some(invoice) if invoice.is_pending() => {}
            _ => return Ok(false),
        }

        let mut subscription = write.subscription().clone();
        match write {
            SubscriptionWrite::Insert(sub) => {
                if state.subscription_for_company(sub.company_id).is_some() {
                    return Err(BillingError::ConcurrentModification(format!(
                        "company {} gained a subscription",
                        sub.company_id
                    )));
                }
                subscription.version = 0;
            }
            SubscriptionWrite::Update {
                subscription: sub,
                expected_version,
            } => {
                let current = state.subscriptions.get(&sub.id).map(|s| s.version);
                if current != Some(*expected_version) {
                    return Err(BillingError::ConcurrentModification(format!(
                        "subscription {} changed",
                        sub.id
                    )));
                }
                subscription.version = expected_version + 1;
            }
        }

        if let Some(invoice) = state.invoices.get_mut(&id) {
            apply_payment(invoice, payment);
            invoice.subscription_id = Some(subscription.id);
        }
        state.subscriptions.insert(subscription.id, subscription);
        Ok(true)
    }

    async fn list_stale_pending_invoices(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<Invoice>> {
        Ok(self
            .state()
            .invoices
            .values()
            .filter(|i| i.is_pending() && i.created_at < created_before)
            .cloned()
            .collect())
    }

    async fn companies_with_multiple_pending_invoices(&self) -> BillingResult<Vec<(Uuid, i64)>> {
        let state = self.state();
        let mut counts: HashMap<Uuid, i64> = HashMap::new();
        for invoice in state.invoices.values().filter(|i| i.is_pending()) {
            *counts.entry(invoice.company_id).or_default() += 1;
        }
        Ok(counts.into_iter().filter(|(_, n)| *n > 1).collect())
    }

    async fn paid_invoices_missing_paid_at(&self) -> BillingResult<Vec<Invoice>> {
        Ok(self
            .state()
            .invoices
            .values()
            .filter(|i| i.status == InvoiceStatus::Paid && i.paid_at.is_none())
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: &BillingEvent) -> BillingResult<()> {
        self.state().events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, company_id: Uuid) -> BillingResult<Vec<BillingEvent>> {
        let mut events: Vec<BillingEvent> = self
            .state()
            .events
            .iter()
            .filter(|e| e.company_id == company_id)
            .cloned()
            .collect();
        events.reverse();
        Ok(events)
    }
}
