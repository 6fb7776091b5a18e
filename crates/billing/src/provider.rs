//! Payment provider client
//!
//! The core only asks the provider for a hosted invoice and later consumes the
//! provider's webhook. Creating the invoice is retried with exponential backoff
//! for transient failures; 4xx answers are final.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};

const MAX_ATTEMPTS: usize = 3;

/// What the core asks the provider to collect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRequest {
    /// Local invoice id, sent as the provider's external id and idempotency key
    pub invoice_id: Uuid,
    pub company_id: Uuid,
    pub amount: i64,
    pub description: String,
    /// Seconds until the hosted invoice stops accepting payment
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInvoice {
    pub provider_invoice_id: String,
    pub invoice_url: String,
    pub expires_at: Option<OffsetDateTime>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_invoice(&self, request: &InvoiceRequest) -> BillingResult<ProviderInvoice>;
}

#[derive(Debug, Serialize)]
struct CreateInvoiceBody<'a> {
    external_id: String,
    amount: i64,
    description: &'a str,
    invoice_duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    success_redirect_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    id: String,
    invoice_url: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expiry_date: Option<OffsetDateTime>,
}

/// REST client for the hosted-invoice API
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    success_redirect_url: Option<String>,
}

impl HttpPaymentProvider {
    pub fn new(config: &BillingConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BillingError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.provider_url.trim_end_matches('/').to_string(),
            secret_key: config.provider_secret_key.clone(),
            success_redirect_url: config.success_redirect_url.clone(),
        })
    }

    async fn post_invoice(&self, request: &InvoiceRequest) -> BillingResult<ProviderInvoice> {
        let body = CreateInvoiceBody {
            external_id: request.invoice_id.to_string(),
            amount: request.amount,
            description: &request.description,
            invoice_duration: request.ttl_seconds,
            success_redirect_url: self.success_redirect_url.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/v2/invoices", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .header("x-idempotency-key", request.invoice_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Provider(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(BillingError::ProviderRejected(format!("{}: {}", status, text)));
        }
        if !status.is_success() {
            return Err(BillingError::Provider(format!("unexpected status {}", status)));
        }

        let parsed: CreateInvoiceResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Provider(format!("malformed response: {}", e)))?;

        Ok(ProviderInvoice {
            provider_invoice_id: parsed.id,
            invoice_url: parsed.invoice_url,
            expires_at: parsed.expiry_date,
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_invoice(&self, request: &InvoiceRequest) -> BillingResult<ProviderInvoice> {
        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(MAX_ATTEMPTS - 1);

        let result = RetryIf::start(
            strategy,
            || self.post_invoice(request),
            |e: &BillingError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(
                        invoice_id = %request.invoice_id,
                        error = %e,
                        "Payment provider call failed, retrying"
                    );
                }
                retry
            },
        )
        .await;

        match &result {
            Ok(created) => tracing::info!(
                invoice_id = %request.invoice_id,
                provider_invoice_id = %created.provider_invoice_id,
                "Created provider invoice"
            ),
            Err(e) => tracing::error!(
                invoice_id = %request.invoice_id,
                company_id = %request.company_id,
                error = %e,
                "Payment provider invoice creation failed"
            ),
        }
        result
    }
}

/// In-process provider that records requests and hands out predictable ids
#[derive(Debug, Default)]
pub struct FakePaymentProvider {
    requests: Mutex<Vec<InvoiceRequest>>,
    fail_with: Mutex<Option<String>>,
}

impl FakePaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail as a rejected request
    pub fn fail_next_calls(&self, reason: &str) {
        if let Ok(mut fail) = self.fail_with.lock() {
            *fail = Some(reason.to_string());
        }
    }

    pub fn recover(&self) {
        if let Ok(mut fail) = self.fail_with.lock() {
            *fail = None;
        }
    }

    pub fn requests(&self) -> Vec<InvoiceRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Provider id handed out for a local invoice
    pub fn provider_id_for(invoice_id: Uuid) -> String {
        format!("inv_{}", invoice_id.simple())
    }
}

#[async_trait]
impl PaymentProvider for FakePaymentProvider {
    async fn create_invoice(&self, request: &InvoiceRequest) -> BillingResult<ProviderInvoice> {
        if let Ok(fail) = self.fail_with.lock() {
            if let Some(reason) = fail.as_ref() {
                return Err(BillingError::ProviderRejected(reason.clone()));
            }
        }
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let id = Self::provider_id_for(request.invoice_id);
        Ok(ProviderInvoice {
            invoice_url: format!("https://pay.example.test/{}", id),
            provider_invoice_id: id,
            expires_at: None,
        })
    }
}
