//! Persistence for billing state
//!
//! `BillingStore` is the only way the billing services touch storage. Two
//! implementations ship with the crate: [`PgBillingStore`] for production and
//! [`InMemoryBillingStore`] for tests and local runs.
//!
//! Every subscription write is a compare-and-set on `version`, and settling a
//! paid invoice writes the invoice and the subscription as one unit.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use hrcore_shared::{InvoiceStatus, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{Feature, Plan};
use crate::error::BillingResult;
use crate::events::BillingEvent;
use crate::invoices::{Invoice, PaymentDetails};
use crate::subscriptions::Subscription;

/// Subscription mutation carried alongside a paid invoice
#[derive(Debug, Clone)]
pub enum SubscriptionWrite {
    /// First subscription for the company
    Insert(Subscription),
    /// Replace an existing row if its version is still `expected_version`
    Update {
        subscription: Subscription,
        expected_version: i64,
    },
}

impl SubscriptionWrite {
    pub fn subscription(&self) -> &Subscription {
        match self {
            SubscriptionWrite::Insert(subscription) => subscription,
            SubscriptionWrite::Update { subscription, .. } => subscription,
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Catalog

    /// Plans ordered by tier: price, then included seats, then name
    async fn list_plans(&self, active_only: bool) -> BillingResult<Vec<Plan>>;

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>>;

    async fn get_feature(&self, code: &str) -> BillingResult<Option<Feature>>;

    // Subscriptions

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn get_subscription_by_company(
        &self,
        company_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    /// Insert a new subscription. Fails with `Conflict` if the company already has one.
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Store `subscription` with `version = expected_version + 1` if the stored
    /// version still equals `expected_version`. Returns `false` on a version mismatch.
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool>;

    /// Subscriptions in one of `statuses` whose period ended before `before`
    async fn list_expiring(
        &self,
        statuses: &[SubscriptionStatus],
        before: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Subscriptions carrying a pending plan or seat change whose period ended
    /// at or before `due_by` (all of them when `due_by` is `None`)
    async fn list_with_pending_changes(
        &self,
        due_by: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<Subscription>>;

    /// Set-based transition of every subscription in `from` whose period ended
    /// before `cutoff`. Returns the number of rows moved.
    async fn update_expired_to_status(
        &self,
        from: &[SubscriptionStatus],
        cutoff: OffsetDateTime,
        to: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<u64>;

    // Invoices

    /// Insert a pending invoice. Fails with `DuplicatePendingInvoice` if the
    /// company already has one pending.
    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()>;

    async fn get_invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn get_invoice_by_provider_id(
        &self,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>>;

    async fn find_pending_invoice(&self, company_id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn count_pending_invoices(&self, company_id: Uuid) -> BillingResult<i64>;

    /// Newest first
    async fn list_invoices(&self, company_id: Uuid) -> BillingResult<Vec<Invoice>>;

    async fn attach_provider_invoice(
        &self,
        id: Uuid,
        provider_invoice_id: &str,
        invoice_url: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<()>;

    /// Move a pending invoice to a terminal status. Returns `false` without
    /// touching the row if it is no longer pending.
    async fn transition_invoice(
        &self,
        id: Uuid,
        to: InvoiceStatus,
        payment: Option<&PaymentDetails>,
    ) -> BillingResult<bool>;

    /// Mark a pending invoice paid and apply `write` as one atomic unit.
    ///
    /// Returns `Ok(false)` and writes nothing if the invoice is no longer pending.
    /// Returns `ConcurrentModification` and writes nothing if the subscription
    /// changed underneath the caller.
    async fn settle_invoice(
        &self,
        id: Uuid,
        payment: &PaymentDetails,
        write: &SubscriptionWrite,
    ) -> BillingResult<bool>;

    async fn list_stale_pending_invoices(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<Invoice>>;

    // Consistency checks

    /// Companies with more than one pending invoice, with the count
    async fn companies_with_multiple_pending_invoices(&self) -> BillingResult<Vec<(Uuid, i64)>>;

    async fn paid_invoices_missing_paid_at(&self) -> BillingResult<Vec<Invoice>>;

    // Billing events

    async fn append_event(&self, event: &BillingEvent) -> BillingResult<()>;

    /// Newest first
    async fn list_events(&self, company_id: Uuid) -> BillingResult<Vec<BillingEvent>>;
}
