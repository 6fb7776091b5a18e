//! Invoice workflow
//!
//! One invoice per billing action (checkout, upgrade, seat increase). A company
//! may have at most one pending invoice; every status change goes through
//! `mark_paid`, `mark_expired` or `mark_cancelled`, and each of them is a no-op
//! on an invoice that already left `pending`.

use std::sync::Arc;

use hrcore_shared::{InvoicePurpose, InvoiceStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::provider::{InvoiceRequest, PaymentProvider};
use crate::store::{BillingStore, SubscriptionWrite};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub company_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub provider_invoice_id: Option<String>,
    pub invoice_url: Option<String>,
    pub status: InvoiceStatus,
    pub purpose: InvoicePurpose,
    /// Plan the invoice buys
    pub plan_id: String,
    /// Seat cap the invoice buys
    pub seats: i32,
    pub amount: i64,
    pub payment_method: Option<String>,
    pub payment_channel: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

impl Invoice {
    pub fn is_pending(&self) -> bool {
        self.status == InvoiceStatus::Pending
    }
}

/// Payment facts reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentDetails {
    pub paid_at: OffsetDateTime,
    pub method: Option<String>,
    pub channel: Option<String>,
}

/// A billing action that needs to be paid for
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub company_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub purpose: InvoicePurpose,
    pub plan_id: String,
    pub seats: i32,
    pub amount: i64,
    pub description: String,
}

/// Result of one stale-invoice pass
#[derive(Debug, Default, Clone)]
pub struct StaleInvoiceSweep {
    pub expired: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

#[derive(Clone)]
pub struct InvoiceService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    clock: Arc<dyn Clock>,
    events: BillingEventLogger,
    config: BillingConfig,
}

impl InvoiceService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
        config: BillingConfig,
    ) -> Self {
        Self {
            events: BillingEventLogger::new(store.clone()),
            store,
            provider,
            clock,
            config,
        }
    }

    /// Create a pending invoice and the matching hosted invoice at the provider.
    ///
    /// Fails with `DuplicatePendingInvoice` if the company already has one pending.
    /// If the provider call fails the local invoice is cancelled so it does not
    /// block the next attempt.
    pub async fn create_invoice_for_action(&self, action: NewInvoice) -> BillingResult<Invoice> {
        if self
            .store
            .find_pending_invoice(action.company_id)
            .await?
            .is_some()
        {
            return Err(BillingError::DuplicatePendingInvoice {
                company_id: action.company_id,
            });
        }

        let now = self.clock.now();
        let mut invoice = Invoice {
            id: Uuid::new_v4(),
            company_id: action.company_id,
            subscription_id: action.subscription_id,
            provider_invoice_id: None,
            invoice_url: None,
            status: InvoiceStatus::Pending,
            purpose: action.purpose,
            plan_id: action.plan_id,
            seats: action.seats,
            amount: action.amount,
            payment_method: None,
            payment_channel: None,
            created_at: now,
            expires_at: Some(now + self.config.invoice_ttl),
            paid_at: None,
        };
        // The store enforces the single-pending rule too, for racing callers
        self.store.insert_invoice(&invoice).await?;

        let request = InvoiceRequest {
            invoice_id: invoice.id,
            company_id: invoice.company_id,
            amount: invoice.amount,
            description: action.description,
            ttl_seconds: self.config.invoice_ttl.whole_seconds(),
        };
        let created = match self.provider.create_invoice(&request).await {
            Ok(created) => created,
            Err(e) => {
                if let Err(cancel_err) = self
                    .store
                    .transition_invoice(invoice.id, InvoiceStatus::Cancelled, None)
                    .await
                {
                    tracing::error!(
                        invoice_id = %invoice.id,
                        error = %cancel_err,
                        "Failed to cancel invoice after provider failure"
                    );
                }
                return Err(e);
            }
        };

        let expires_at = created.expires_at.or(invoice.expires_at);
        self.store
            .attach_provider_invoice(
                invoice.id,
                &created.provider_invoice_id,
                &created.invoice_url,
                expires_at,
            )
            .await?;
        invoice.provider_invoice_id = Some(created.provider_invoice_id);
        invoice.invoice_url = Some(created.invoice_url);
        invoice.expires_at = expires_at;

        let pending = self.store.count_pending_invoices(invoice.company_id).await?;
        if pending > 1 {
            tracing::error!(
                company_id = %invoice.company_id,
                pending = pending,
                "More than one pending invoice after invoice creation"
            );
        }

        self.events
            .record(
                BillingEventBuilder::new(invoice.company_id, BillingEventType::InvoiceCreated)
                    .invoice(invoice.id)
                    .actor(ActorType::Owner)
                    .data(serde_json::json!({
                        "purpose": invoice.purpose.as_str(),
                        "plan_id": invoice.plan_id,
                        "seats": invoice.seats,
                        "amount": invoice.amount,
                    })),
                now,
            )
            .await;

        tracing::info!(
            company_id = %invoice.company_id,
            invoice_id = %invoice.id,
            purpose = invoice.purpose.as_str(),
            amount = invoice.amount,
            "Created invoice"
        );

        Ok(invoice)
    }

    /// Mark a pending invoice paid together with its subscription effect.
    ///
    /// Returns `false` if the invoice had already left `pending`; nothing is
    /// written in that case.
    pub async fn mark_paid(
        &self,
        invoice_id: Uuid,
        payment: &PaymentDetails,
        write: &SubscriptionWrite,
    ) -> BillingResult<bool> {
        let applied = self.store.settle_invoice(invoice_id, payment, write).await?;
        if !applied {
            self.require_invoice(invoice_id).await?;
            tracing::debug!(invoice_id = %invoice_id, "Invoice already settled, skipping");
            return Ok(false);
        }

        let subscription = write.subscription();
        self.events
            .record(
                BillingEventBuilder::new(subscription.company_id, BillingEventType::InvoicePaid)
                    .invoice(invoice_id)
                    .subscription(subscription.id)
                    .actor(ActorType::Provider)
                    .data(serde_json::json!({
                        "payment_method": payment.method,
                        "payment_channel": payment.channel,
                    })),
                payment.paid_at,
            )
            .await;

        tracing::info!(
            invoice_id = %invoice_id,
            company_id = %subscription.company_id,
            "Invoice paid"
        );
        Ok(true)
    }

    pub async fn mark_expired(&self, invoice_id: Uuid) -> BillingResult<bool> {
        self.close(invoice_id, InvoiceStatus::Expired, ActorType::Provider)
            .await
    }

    pub async fn mark_cancelled(&self, invoice_id: Uuid) -> BillingResult<bool> {
        self.close(invoice_id, InvoiceStatus::Cancelled, ActorType::Owner)
            .await
    }

    async fn close(
        &self,
        invoice_id: Uuid,
        to: InvoiceStatus,
        actor: ActorType,
    ) -> BillingResult<bool> {
        let changed = self.store.transition_invoice(invoice_id, to, None).await?;
        let invoice = self.require_invoice(invoice_id).await?;
        if !changed {
            return Ok(false);
        }

        let event_type = match to {
            InvoiceStatus::Expired => BillingEventType::InvoiceExpired,
            _ => BillingEventType::InvoiceCancelled,
        };
        self.events
            .record(
                BillingEventBuilder::new(invoice.company_id, event_type)
                    .invoice(invoice_id)
                    .actor(actor),
                self.clock.now(),
            )
            .await;

        tracing::info!(
            invoice_id = %invoice_id,
            company_id = %invoice.company_id,
            status = to.as_str(),
            "Invoice closed"
        );
        Ok(true)
    }

    /// Owner-initiated cancel of the company's own pending invoice
    pub async fn cancel_pending_invoice(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
    ) -> BillingResult<Invoice> {
        let invoice = self.get_invoice_by_id(company_id, invoice_id).await?;
        match invoice.status {
            InvoiceStatus::Pending => {
                self.mark_cancelled(invoice_id).await?;
            }
            InvoiceStatus::Cancelled => {}
            InvoiceStatus::Paid => {
                return Err(BillingError::Conflict(
                    "Invoice has already been paid".to_string(),
                ))
            }
            InvoiceStatus::Expired => {
                return Err(BillingError::Conflict("Invoice has expired".to_string()))
            }
        }
        self.require_invoice(invoice_id).await
    }

    pub async fn get_invoices(&self, company_id: Uuid) -> BillingResult<Vec<Invoice>> {
        self.store.list_invoices(company_id).await
    }

    /// Invoice owned by `company_id`; other tenants' invoices read as not found
    pub async fn get_invoice_by_id(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
    ) -> BillingResult<Invoice> {
        match self.store.get_invoice(invoice_id).await? {
            Some(invoice) if invoice.company_id == company_id => Ok(invoice),
            _ => Err(BillingError::NotFound(format!(
                "Invoice {} not found",
                invoice_id
            ))),
        }
    }

    pub async fn find(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        self.store.get_invoice(invoice_id).await
    }

    pub async fn find_by_provider_id(
        &self,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        self.store
            .get_invoice_by_provider_id(provider_invoice_id)
            .await
    }

    pub async fn find_pending(&self, company_id: Uuid) -> BillingResult<Option<Invoice>> {
        self.store.find_pending_invoice(company_id).await
    }

    /// Expire pending invoices created more than the configured TTL ago.
    ///
    /// Each invoice is handled on its own; a failure is reported and the pass
    /// moves on.
    pub async fn expire_stale_invoices(&self) -> BillingResult<StaleInvoiceSweep> {
        let cutoff = self.clock.now() - self.config.invoice_ttl;
        let stale = self.store.list_stale_pending_invoices(cutoff).await?;
        let mut sweep = StaleInvoiceSweep::default();

        for invoice in stale {
            let outcome =
                tokio::time::timeout(self.config.record_timeout, self.mark_expired(invoice.id))
                    .await;
            match outcome {
                Ok(Ok(true)) => sweep.expired.push(invoice.id),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        invoice_id = %invoice.id,
                        company_id = %invoice.company_id,
                        error = %e,
                        "Failed to expire stale invoice"
                    );
                    sweep.failed.push((invoice.id, e.to_string()));
                }
                Err(_) => {
                    tracing::error!(
                        invoice_id = %invoice.id,
                        company_id = %invoice.company_id,
                        "Timed out expiring stale invoice"
                    );
                    sweep.failed.push((invoice.id, "timed out".to_string()));
                }
            }
        }

        if !sweep.expired.is_empty() {
            tracing::info!(count = sweep.expired.len(), "Expired stale invoices");
        }
        Ok(sweep)
    }

    async fn require_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))
    }
}
