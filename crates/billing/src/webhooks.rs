//! Payment provider webhook handling
//!
//! The provider calls back with a shared secret in `X-Callback-Token`. The
//! token is checked before the body is even parsed. After that, business
//! conditions (unknown invoice, invoice already settled, unknown event type)
//! are acknowledged so the provider does not keep redelivering; only a bad
//! token or an internal failure produces an error.

use std::sync::Arc;

use serde::Deserialize;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::invoices::{Invoice, InvoiceService, PaymentDetails};
use crate::subscriptions::{SettleOutcome, SubscriptionService};

/// Callback body. Accepts both our field names and the provider's native ones.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "id")]
    pub provider_invoice_id: String,
    /// Our invoice id, echoed back by the provider
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(alias = "status")]
    pub event_type: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub payment_channel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebhookEvent {
    Paid,
    Expired,
    Other,
}

impl WebhookEvent {
    fn parse(event_type: &str) -> Self {
        match event_type.to_ascii_lowercase().as_str() {
            "paid" | "settled" | "invoice.paid" => WebhookEvent::Paid,
            "expired" | "failed" | "invoice.expired" => WebhookEvent::Expired,
            _ => WebhookEvent::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The invoice was settled and its subscription effect applied
    Applied { invoice_id: Uuid },
    /// The invoice was expired; the subscription is untouched
    Expired { invoice_id: Uuid },
    /// No local invoice matches; acknowledged without action
    UnknownInvoice,
    /// The invoice had already reached a terminal status
    AlreadyProcessed { invoice_id: Uuid },
    /// Event type we do not act on
    Ignored,
}

#[derive(Clone)]
pub struct WebhookHandler {
    callback_token: String,
    invoices: InvoiceService,
    subscriptions: SubscriptionService,
    clock: Arc<dyn Clock>,
}

impl WebhookHandler {
    pub fn new(
        callback_token: String,
        invoices: InvoiceService,
        subscriptions: SubscriptionService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            callback_token,
            invoices,
            subscriptions,
            clock,
        }
    }

    /// Constant-time comparison against the configured token. An empty
    /// configured token rejects everything.
    pub fn verify_token(&self, provided: Option<&str>) -> BillingResult<()> {
        let expected = self.callback_token.as_bytes();
        let provided = provided.unwrap_or_default().as_bytes();

        let matches = !expected.is_empty() && bool::from(expected.ct_eq(provided));
        if !matches {
            tracing::error!(
                security_event = "webhook_token_mismatch",
                token_present = !provided.is_empty(),
                "Rejected payment webhook with invalid callback token"
            );
            return Err(BillingError::WebhookTokenInvalid);
        }
        Ok(())
    }

    /// Verify, parse and apply one callback
    pub async fn handle(&self, token: Option<&str>, body: &[u8]) -> BillingResult<WebhookOutcome> {
        self.verify_token(token)?;
        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidInput(format!("Malformed webhook body: {}", e)))?;
        self.process(payload).await
    }

    /// Apply an already verified callback
    pub async fn process(&self, payload: WebhookPayload) -> BillingResult<WebhookOutcome> {
        let event = WebhookEvent::parse(&payload.event_type);
        if event == WebhookEvent::Other {
            tracing::debug!(
                provider_invoice_id = %payload.provider_invoice_id,
                event_type = %payload.event_type,
                "Ignoring unhandled webhook event type"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let Some(invoice) = self.lookup(&payload).await? else {
            tracing::warn!(
                provider_invoice_id = %payload.provider_invoice_id,
                event_type = %payload.event_type,
                "Webhook for unknown invoice, acknowledging"
            );
            return Ok(WebhookOutcome::UnknownInvoice);
        };

        if !invoice.is_pending() {
            tracing::info!(
                invoice_id = %invoice.id,
                status = invoice.status.as_str(),
                event_type = %payload.event_type,
                "Webhook for already settled invoice, skipping"
            );
            return Ok(WebhookOutcome::AlreadyProcessed {
                invoice_id: invoice.id,
            });
        }

        match event {
            WebhookEvent::Paid => {
                let payment = PaymentDetails {
                    paid_at: payload.paid_at.unwrap_or_else(|| self.clock.now()),
                    method: payload.payment_method,
                    channel: payload.payment_channel,
                };
                match self
                    .subscriptions
                    .settle_paid_invoice(invoice.id, payment)
                    .await?
                {
                    SettleOutcome::Applied(_) => Ok(WebhookOutcome::Applied {
                        invoice_id: invoice.id,
                    }),
                    SettleOutcome::AlreadyProcessed(inv) => {
                        Ok(WebhookOutcome::AlreadyProcessed { invoice_id: inv.id })
                    }
                }
            }
            WebhookEvent::Expired => {
                if self.invoices.mark_expired(invoice.id).await? {
                    Ok(WebhookOutcome::Expired {
                        invoice_id: invoice.id,
                    })
                } else {
                    Ok(WebhookOutcome::AlreadyProcessed {
                        invoice_id: invoice.id,
                    })
                }
            }
            WebhookEvent::Other => Ok(WebhookOutcome::Ignored),
        }
    }

    /// Find the invoice by provider id, falling back to the echoed external id
    /// for callbacks that beat the provider id being stored locally.
    async fn lookup(&self, payload: &WebhookPayload) -> BillingResult<Option<Invoice>> {
        if let Some(invoice) = self
            .invoices
            .find_by_provider_id(&payload.provider_invoice_id)
            .await?
        {
            return Ok(Some(invoice));
        }

        let Some(local_id) = payload
            .external_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            return Ok(None);
        };

        Ok(self.invoices.find(local_id).await?.filter(|invoice| {
            invoice
                .provider_invoice_id
                .as_deref()
                .map_or(true, |id| id == payload.provider_invoice_id)
        }))
    }
}
