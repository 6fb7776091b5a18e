//! Shared fixtures for unit tests: an in-memory billing core on a manual clock

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{Feature, Plan};
use crate::clock::{Clock, ManualClock};
use crate::config::BillingConfig;
use crate::employees::StaticEmployeeDirectory;
use crate::error::BillingResult;
use crate::invoices::{Invoice, PaymentDetails};
use crate::provider::FakePaymentProvider;
use crate::store::InMemoryBillingStore;
use crate::subscriptions::{SettleOutcome, Subscription};
use crate::webhooks::WebhookOutcome;
use crate::BillingService;

pub const CALLBACK_TOKEN: &str = "test-callback-token";

/// 2026-01-01T00:00:00Z plus `day` days
pub fn at(day: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_767_225_600 + day * 86_400).unwrap()
}

fn feature(code: &str, name: &str) -> Feature {
    Feature {
        code: code.to_string(),
        name: name.to_string(),
    }
}

fn plan(id: &str, price: i64, seats: i32, features: &[Feature]) -> Plan {
    Plan {
        id: id.to_string(),
        name: id.to_string(),
        price,
        price_per_extra_seat: 1_000,
        max_seats_included: seats,
        active: true,
        features: features.to_vec(),
    }
}

pub struct Harness {
    pub billing: BillingService,
    pub clock: Arc<ManualClock>,
    pub employees: Arc<StaticEmployeeDirectory>,
    pub store: Arc<InMemoryBillingStore>,
    pub provider: Arc<FakePaymentProvider>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let attendance = feature("attendance", "Attendance");
        let leave = feature("leave", "Leave management");
        let payroll = feature("payroll", "Payroll");
        store.seed_plan(plan("basic", 10_000, 5, &[attendance.clone()]));
        store.seed_plan(plan(
            "starter",
            25_000,
            10,
            &[attendance.clone(), leave.clone()],
        ));
        store.seed_plan(plan("pro", 50_000, 25, &[attendance, leave, payroll]));

        let clock = Arc::new(ManualClock::new(at(0)));
        let employees = Arc::new(StaticEmployeeDirectory::new());
        let provider = Arc::new(FakePaymentProvider::new());
        let config = BillingConfig {
            callback_token: CALLBACK_TOKEN.to_string(),
            ..BillingConfig::default()
        };

        let billing = BillingService::new(
            config,
            store.clone(),
            employees.clone(),
            provider.clone(),
            clock.clone(),
        );

        Self {
            billing,
            clock,
            employees,
            store,
            provider,
        }
    }

    /// A company with a paid, active subscription to `plan_id`
    pub async fn active_company(&self, plan_id: &str) -> Uuid {
        self.checkout_and_pay(plan_id, None).await
    }

    pub async fn active_company_with_seats(&self, plan_id: &str, seats: i32) -> Uuid {
        self.checkout_and_pay(plan_id, Some(seats)).await
    }

    async fn checkout_and_pay(&self, plan_id: &str, seats: Option<i32>) -> Uuid {
        let company = Uuid::new_v4();
        let invoice = self
            .billing
            .subscriptions
            .checkout(company, plan_id, seats)
            .await
            .unwrap();
        self.pay(&invoice).await;
        company
    }

    pub async fn pay(&self, invoice: &Invoice) -> SettleOutcome {
        self.billing
            .subscriptions
            .settle_paid_invoice(
                invoice.id,
                PaymentDetails {
                    paid_at: self.clock.now(),
                    method: Some("BANK_TRANSFER".to_string()),
                    channel: Some("BCA".to_string()),
                },
            )
            .await
            .unwrap()
    }

    /// Deliver a provider callback for `invoice` with the given status
    pub async fn webhook(&self, invoice: &Invoice, event: &str) -> BillingResult<WebhookOutcome> {
        let body = serde_json::json!({
            "id": invoice.provider_invoice_id.clone().unwrap_or_default(),
            "external_id": invoice.id.to_string(),
            "status": event,
            "paid_at": self.clock.now().format(&time::format_description::well_known::Rfc3339).unwrap(),
            "payment_method": "BANK_TRANSFER",
        });
        let body = serde_json::to_vec(&body).unwrap();
        self.billing
            .webhooks
            .handle(Some(CALLBACK_TOKEN), &body)
            .await
    }

    pub async fn subscription(&self, company_id: Uuid) -> Subscription {
        self.billing
            .subscriptions
            .get_subscription(company_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> Invoice {
        self.billing
            .invoices
            .find(invoice_id)
            .await
            .unwrap()
            .unwrap()
    }
}
