//! Append-only billing event log
//!
//! Every ledger and invoice mutation leaves a row here so support can
//! reconstruct how a subscription reached its current state. Writing an event
//! never fails the operation that produced it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    TrialStarted,
    SubscriptionActivated,
    SubscriptionRenewed,
    PlanUpgraded,
    SeatsIncreased,
    DowngradeScheduled,
    SeatDecreaseScheduled,
    PendingChangeCancelled,
    PendingChangeCommitted,
    PendingChangeRefused,
    SubscriptionCancelled,
    InvoiceCreated,
    InvoicePaid,
    InvoiceExpired,
    InvoiceCancelled,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::TrialStarted => "trial_started",
            BillingEventType::SubscriptionActivated => "subscription_activated",
            BillingEventType::SubscriptionRenewed => "subscription_renewed",
            BillingEventType::PlanUpgraded => "plan_upgraded",
            BillingEventType::SeatsIncreased => "seats_increased",
            BillingEventType::DowngradeScheduled => "downgrade_scheduled",
            BillingEventType::SeatDecreaseScheduled => "seat_decrease_scheduled",
            BillingEventType::PendingChangeCancelled => "pending_change_cancelled",
            BillingEventType::PendingChangeCommitted => "pending_change_committed",
            BillingEventType::PendingChangeRefused => "pending_change_refused",
            BillingEventType::SubscriptionCancelled => "subscription_cancelled",
            BillingEventType::InvoiceCreated => "invoice_created",
            BillingEventType::InvoicePaid => "invoice_paid",
            BillingEventType::InvoiceExpired => "invoice_expired",
            BillingEventType::InvoiceCancelled => "invoice_cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let all = [
            BillingEventType::TrialStarted,
            BillingEventType::SubscriptionActivated,
            BillingEventType::SubscriptionRenewed,
            BillingEventType::PlanUpgraded,
            BillingEventType::SeatsIncreased,
            BillingEventType::DowngradeScheduled,
            BillingEventType::SeatDecreaseScheduled,
            BillingEventType::PendingChangeCancelled,
            BillingEventType::PendingChangeCommitted,
            BillingEventType::PendingChangeRefused,
            BillingEventType::SubscriptionCancelled,
            BillingEventType::InvoiceCreated,
            BillingEventType::InvoicePaid,
            BillingEventType::InvoiceExpired,
            BillingEventType::InvoiceCancelled,
        ];
        all.into_iter().find(|t| t.as_str() == s)
    }
}

/// Who caused the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Owner,
    Provider,
    Scheduler,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Owner => "owner",
            ActorType::Provider => "provider",
            ActorType::Scheduler => "scheduler",
            ActorType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "owner" => ActorType::Owner,
            "provider" => ActorType::Provider,
            "scheduler" => ActorType::Scheduler,
            _ => ActorType::System,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub company_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub event_type: BillingEventType,
    pub actor_type: ActorType,
    pub data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub struct BillingEventBuilder {
    company_id: Uuid,
    event_type: BillingEventType,
    subscription_id: Option<Uuid>,
    invoice_id: Option<Uuid>,
    actor_type: ActorType,
    data: serde_json::Value,
}

impl BillingEventBuilder {
    pub fn new(company_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            company_id,
            event_type,
            subscription_id: None,
            invoice_id: None,
            actor_type: ActorType::System,
            data: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn subscription(mut self, id: Uuid) -> Self {
        self.subscription_id = Some(id);
        self
    }

    pub fn invoice(mut self, id: Uuid) -> Self {
        self.invoice_id = Some(id);
        self
    }

    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn build(self, at: OffsetDateTime) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            company_id: self.company_id,
            subscription_id: self.subscription_id,
            invoice_id: self.invoice_id,
            event_type: self.event_type,
            actor_type: self.actor_type,
            data: self.data,
            created_at: at,
        }
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn BillingStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(
        &self,
        builder: BillingEventBuilder,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let event = builder.build(at);
        self.store.append_event(&event).await
    }

    /// Log and swallow failures
    pub async fn record(&self, builder: BillingEventBuilder, at: OffsetDateTime) {
        let event_type = builder.event_type;
        let company_id = builder.company_id;
        if let Err(e) = self.log_event(builder, at).await {
            tracing::warn!(
                company_id = %company_id,
                event_type = event_type.as_str(),
                error = %e,
                "Failed to log billing event"
            );
        }
    }

    pub async fn list_for_company(&self, company_id: Uuid) -> BillingResult<Vec<BillingEvent>> {
        self.store.list_events(company_id).await
    }
}
