//! Subscription ledger
//!
//! Owns the per-company subscription state machine:
//!
//! - Upgrades and seat increases are billed and applied as soon as the invoice
//!   is paid.
//! - Downgrades and seat decreases are stored as pending changes and only
//!   committed by the sweep once the current period has ended, after checking
//!   the live headcount against the new seat cap.
//! - Cancelling keeps access until `period_end`; the sweep expires it later.
//!
//! Every mutation runs under the company's [`TenantLocks`] entry and is written
//! with a compare-and-set on the subscription version.

use std::sync::Arc;

use hrcore_shared::{InvoicePurpose, SubscriptionStatus};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{Catalog, Feature, Plan};
use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::employees::EmployeeDirectory;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::invoices::{Invoice, InvoiceService, NewInvoice, PaymentDetails};
use crate::locks::TenantLocks;
use crate::store::{BillingStore, SubscriptionWrite};

/// Attempts at settling a paid invoice when the subscription changes underneath
const MAX_SETTLE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub company_id: Uuid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    /// Effective seat cap
    pub max_seats: i32,
    /// Seat decrease waiting for the period boundary
    pub pending_max_seats: Option<i32>,
    /// Downgrade waiting for the period boundary
    pub pending_plan_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(skip)]
    pub version: i64,
}

impl Subscription {
    /// Whether the company may use the product at `now`
    pub fn grants_access(&self, now: OffsetDateTime) -> bool {
        !self.status.is_terminal() && now < self.period_end
    }

    pub fn has_pending_change(&self) -> bool {
        self.pending_plan_id.is_some() || self.pending_max_seats.is_some()
    }

    fn clear_pending(&mut self) {
        self.pending_plan_id = None;
        self.pending_max_seats = None;
    }
}

/// Subscription as shown to the company owner
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub plan: Plan,
    pub pending_plan: Option<Plan>,
    pub features: Vec<Feature>,
    pub active_employees: i64,
    pub has_access: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SeatChangeOutcome {
    /// An invoice for the extra seats was created
    Invoiced { invoice: Invoice },
    /// The increase cost nothing and took effect now
    Applied { subscription: Subscription },
    /// The decrease takes effect at the end of the period
    Scheduled { subscription: Subscription },
    /// A previously scheduled decrease was withdrawn
    PendingCleared { subscription: Subscription },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Subscription),
    /// More active employees than the new seat cap; pending fields are kept
    Refused { active: i64, max_seats: i32 },
    NotDue,
    NothingPending,
    /// Expired subscriptions never take pending changes
    NotEligible(SubscriptionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Applied(Subscription),
    /// The invoice had already left `pending`; nothing was changed
    AlreadyProcessed(Invoice),
}

/// Rows moved by one expiry pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryCounts {
    pub cancelled_expired: u64,
    pub grace_expired: u64,
    pub moved_to_past_due: u64,
}

impl ExpiryCounts {
    pub fn total(&self) -> u64 {
        self.cancelled_expired + self.grace_expired + self.moved_to_past_due
    }
}

/// Subscription state after `invoice` was paid at `paid_at`.
///
/// `current` is the company's subscription as read right before settling, if
/// there is one. The returned write is applied together with the invoice.
pub fn paid_effect(
    invoice: &Invoice,
    current: Option<&Subscription>,
    paid_at: OffsetDateTime,
    now: OffsetDateTime,
    period: Duration,
) -> SubscriptionWrite {
    let Some(current) = current else {
        return SubscriptionWrite::Insert(Subscription {
            id: Uuid::new_v4(),
            company_id: invoice.company_id,
            plan_id: invoice.plan_id.clone(),
            status: SubscriptionStatus::Active,
            max_seats: invoice.seats,
            pending_max_seats: None,
            pending_plan_id: None,
            period_start: paid_at,
            period_end: paid_at + period,
            created_at: now,
            updated_at: now,
            version: 0,
        });
    };

    let mut next = current.clone();
    match invoice.purpose {
        InvoicePurpose::Checkout => {
            // Prepaid time is never dropped, whatever the current status
            let (start, end) = if current.plan_id == invoice.plan_id {
                let start = current.period_end.max(paid_at);
                (start, start + period)
            } else {
                (paid_at, (paid_at + period).max(current.period_end))
            };
            next.status = SubscriptionStatus::Active;
            next.plan_id = invoice.plan_id.clone();
            next.max_seats = invoice.seats;
            next.clear_pending();
            next.period_start = start;
            next.period_end = end;
        }
        InvoicePurpose::Upgrade => {
            next.status = SubscriptionStatus::Active;
            next.plan_id = invoice.plan_id.clone();
            next.max_seats = invoice.seats;
            next.clear_pending();
            next.period_start = paid_at;
            next.period_end = (paid_at + period).max(current.period_end);
        }
        InvoicePurpose::SeatChange if invoice.plan_id == current.plan_id => {
            next.max_seats = invoice.seats;
            next.pending_max_seats = None;
        }
        InvoicePurpose::SeatChange => {
            tracing::warn!(
                company_id = %current.company_id,
                invoice_id = %invoice.id,
                invoice_plan = %invoice.plan_id,
                current_plan = %current.plan_id,
                seats = invoice.seats,
                "Seat invoice was priced for another plan; seat cap left unchanged"
            );
        }
    }
    next.updated_at = now;
    next.version = current.version + 1;

    SubscriptionWrite::Update {
        subscription: next,
        expected_version: current.version,
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    catalog: Catalog,
    invoices: InvoiceService,
    employees: Arc<dyn EmployeeDirectory>,
    clock: Arc<dyn Clock>,
    locks: TenantLocks,
    events: BillingEventLogger,
    config: BillingConfig,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: Catalog,
        invoices: InvoiceService,
        employees: Arc<dyn EmployeeDirectory>,
        clock: Arc<dyn Clock>,
        locks: TenantLocks,
        config: BillingConfig,
    ) -> Self {
        Self {
            events: BillingEventLogger::new(store.clone()),
            store,
            catalog,
            invoices,
            employees,
            clock,
            locks,
            config,
        }
    }

    pub async fn get_subscription(&self, company_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.store.get_subscription_by_company(company_id).await
    }

    async fn require_subscription(&self, company_id: Uuid) -> BillingResult<Subscription> {
        self.get_subscription(company_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("No subscription for company {}", company_id))
        })
    }

    /// Write `next` over `current`, failing if another writer got there first
    async fn save(&self, current: &Subscription, mut next: Subscription) -> BillingResult<Subscription> {
        if !self.store.update_subscription(&next, current.version).await? {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} changed during update",
                current.id
            )));
        }
        next.version = current.version + 1;
        Ok(next)
    }

    /// Start a free trial. Fails if the company already has a subscription.
    pub async fn start_trial(&self, company_id: Uuid, plan_id: &str) -> BillingResult<Subscription> {
        let plan = self.catalog.get_purchasable_plan(plan_id).await?;
        let _guard = self.locks.acquire(company_id).await;

        if self.get_subscription(company_id).await?.is_some() {
            return Err(BillingError::Conflict(
                "Company already has a subscription".to_string(),
            ));
        }

        let now = self.clock.now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            company_id,
            plan_id: plan.id.clone(),
            status: SubscriptionStatus::Trial,
            max_seats: plan.max_seats_included,
            pending_max_seats: None,
            pending_plan_id: None,
            period_start: now,
            period_end: now + self.config.trial,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.store.insert_subscription(&subscription).await?;

        self.events
            .record(
                BillingEventBuilder::new(company_id, BillingEventType::TrialStarted)
                    .subscription(subscription.id)
                    .actor(ActorType::Owner)
                    .data(serde_json::json!({ "plan_id": plan.id })),
                now,
            )
            .await;

        tracing::info!(
            company_id = %company_id,
            plan_id = %plan.id,
            period_end = %subscription.period_end,
            "Started trial"
        );
        Ok(subscription)
    }

    /// Bill a plan purchase or renewal.
    ///
    /// Allowed with no subscription, from trial, past_due, cancelled or
    /// expired, and from active only to renew the same plan with no pending
    /// change. The subscription changes when the invoice is paid.
    pub async fn checkout(
        &self,
        company_id: Uuid,
        plan_id: &str,
        seats: Option<i32>,
    ) -> BillingResult<Invoice> {
        let plan = self.catalog.get_purchasable_plan(plan_id).await?;
        let seats = seats.unwrap_or(plan.max_seats_included);
        if seats < 1 {
            return Err(BillingError::InvalidInput(
                "Seat count must be at least 1".to_string(),
            ));
        }

        let _guard = self.locks.acquire(company_id).await;
        let current = self.get_subscription(company_id).await?;

        if let Some(sub) = &current {
            if sub.status == SubscriptionStatus::Active {
                if sub.plan_id != plan.id {
                    return Err(BillingError::InvalidPlanChange(
                        "Active subscriptions change plan through upgrade or downgrade"
                            .to_string(),
                    ));
                }
                if sub.has_pending_change() {
                    return Err(BillingError::Conflict(
                        "Cancel the scheduled change before renewing".to_string(),
                    ));
                }
            }

            let active = self.employees.count_active_by_company_id(company_id).await?;
            if active > i64::from(seats) {
                return Err(BillingError::SeatLimitExceeded {
                    active,
                    max_seats: seats,
                });
            }
        }

        self.invoices
            .create_invoice_for_action(NewInvoice {
                company_id,
                subscription_id: current.as_ref().map(|s| s.id),
                purpose: InvoicePurpose::Checkout,
                plan_id: plan.id.clone(),
                seats,
                amount: plan.price_for(seats),
                description: format!("{} plan, {} seats", plan.name, seats),
            })
            .await
    }

    /// Bill a move to a strictly higher tier. Applied when the invoice is paid.
    pub async fn upgrade_plan(&self, company_id: Uuid, plan_id: &str) -> BillingResult<Invoice> {
        let target = self.catalog.get_purchasable_plan(plan_id).await?;
        let _guard = self.locks.acquire(company_id).await;
        let sub = self.require_subscription(company_id).await?;

        if !matches!(
            sub.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        ) {
            return Err(BillingError::SubscriptionInactive(format!(
                "Cannot upgrade a {} subscription",
                sub.status
            )));
        }

        let current_plan = self.catalog.get_plan(&sub.plan_id).await?;
        if !target.is_higher_tier_than(&current_plan) {
            return Err(BillingError::InvalidPlanChange(format!(
                "Cannot upgrade from {} to {} - use the downgrade flow instead",
                current_plan.name, target.name
            )));
        }

        let seats = sub.max_seats.max(target.max_seats_included);
        self.invoices
            .create_invoice_for_action(NewInvoice {
                company_id,
                subscription_id: Some(sub.id),
                purpose: InvoicePurpose::Upgrade,
                plan_id: target.id.clone(),
                seats,
                amount: target.price_for(seats),
                description: format!("Upgrade to {} plan, {} seats", target.name, seats),
            })
            .await
    }

    /// Schedule a move to a lower or equal tier at the end of the current period
    pub async fn downgrade_plan(&self, company_id: Uuid, plan_id: &str) -> BillingResult<Subscription> {
        let target = self.catalog.get_purchasable_plan(plan_id).await?;
        let _guard = self.locks.acquire(company_id).await;
        let sub = self.require_subscription(company_id).await?;

        if sub.status != SubscriptionStatus::Active {
            return Err(BillingError::SubscriptionInactive(format!(
                "Cannot schedule a downgrade on a {} subscription",
                sub.status
            )));
        }
        if target.id == sub.plan_id {
            return Err(BillingError::InvalidPlanChange(format!(
                "Already on the {} plan",
                target.name
            )));
        }

        let current_plan = self.catalog.get_plan(&sub.plan_id).await?;
        if target.is_higher_tier_than(&current_plan) {
            return Err(BillingError::InvalidPlanChange(format!(
                "Cannot downgrade from {} to {} - use the upgrade flow instead",
                current_plan.name, target.name
            )));
        }

        if let Some(existing) = sub.pending_plan_id.as_deref() {
            if existing != target.id {
                tracing::warn!(
                    company_id = %company_id,
                    existing_pending_plan = %existing,
                    new_pending_plan = %target.id,
                    "Overwriting existing scheduled downgrade"
                );
            }
        }

        let now = self.clock.now();
        let mut next = sub.clone();
        next.pending_plan_id = Some(target.id.clone());
        next.updated_at = now;
        let saved = self.save(&sub, next).await?;

        self.events
            .record(
                BillingEventBuilder::new(company_id, BillingEventType::DowngradeScheduled)
                    .subscription(saved.id)
                    .actor(ActorType::Owner)
                    .data(serde_json::json!({
                        "from_plan": current_plan.id,
                        "to_plan": target.id,
                    })),
                now,
            )
            .await;

        tracing::info!(
            company_id = %company_id,
            current_plan = %current_plan.id,
            new_plan = %target.id,
            effective_date = %saved.period_end,
            "Scheduled subscription downgrade for period end"
        );
        Ok(saved)
    }

    /// Increase seats now (billed when it costs anything) or schedule a decrease
    pub async fn change_seats(&self, company_id: Uuid, seats: i32) -> BillingResult<SeatChangeOutcome> {
        if seats < 1 {
            return Err(BillingError::InvalidInput(
                "Seat count must be at least 1".to_string(),
            ));
        }

        let _guard = self.locks.acquire(company_id).await;
        let sub = self.require_subscription(company_id).await?;
        if sub.status != SubscriptionStatus::Active {
            return Err(BillingError::SubscriptionInactive(format!(
                "Cannot change seats on a {} subscription",
                sub.status
            )));
        }

        let now = self.clock.now();

        if seats > sub.max_seats {
            let plan = self.catalog.get_plan(&sub.plan_id).await?;
            let cost = plan.price_for(seats) - plan.price_for(sub.max_seats);
            if cost > 0 {
                let invoice = self
                    .invoices
                    .create_invoice_for_action(NewInvoice {
                        company_id,
                        subscription_id: Some(sub.id),
                        purpose: InvoicePurpose::SeatChange,
                        plan_id: sub.plan_id.clone(),
                        seats,
                        amount: cost,
                        description: format!(
                            "{} additional seats on the {} plan",
                            seats - sub.max_seats,
                            plan.name
                        ),
                    })
                    .await?;
                return Ok(SeatChangeOutcome::Invoiced { invoice });
            }

            let mut next = sub.clone();
            next.max_seats = seats;
            next.pending_max_seats = None;
            next.updated_at = now;
            let saved = self.save(&sub, next).await?;
            self.record_seat_event(&saved, BillingEventType::SeatsIncreased, sub.max_seats, now)
                .await;
            tracing::info!(
                company_id = %company_id,
                from = sub.max_seats,
                to = seats,
                "Applied seat increase within included seats"
            );
            return Ok(SeatChangeOutcome::Applied { subscription: saved });
        }

        if seats < sub.max_seats {
            let mut next = sub.clone();
            next.pending_max_seats = Some(seats);
            next.updated_at = now;
            let saved = self.save(&sub, next).await?;
            self.record_seat_event(
                &saved,
                BillingEventType::SeatDecreaseScheduled,
                sub.max_seats,
                now,
            )
            .await;
            tracing::info!(
                company_id = %company_id,
                from = sub.max_seats,
                to = seats,
                effective_date = %saved.period_end,
                "Scheduled seat decrease for period end"
            );
            return Ok(SeatChangeOutcome::Scheduled { subscription: saved });
        }

        if sub.pending_max_seats.is_none() {
            return Err(BillingError::InvalidInput(format!(
                "Subscription already has {} seats",
                seats
            )));
        }

        let mut next = sub.clone();
        next.pending_max_seats = None;
        next.updated_at = now;
        let saved = self.save(&sub, next).await?;
        self.record_seat_event(
            &saved,
            BillingEventType::PendingChangeCancelled,
            sub.max_seats,
            now,
        )
        .await;
        Ok(SeatChangeOutcome::PendingCleared { subscription: saved })
    }

    async fn record_seat_event(
        &self,
        sub: &Subscription,
        event_type: BillingEventType,
        previous_seats: i32,
        at: OffsetDateTime,
    ) {
        self.events
            .record(
                BillingEventBuilder::new(sub.company_id, event_type)
                    .subscription(sub.id)
                    .actor(ActorType::Owner)
                    .data(serde_json::json!({
                        "previous_seats": previous_seats,
                        "max_seats": sub.max_seats,
                        "pending_max_seats": sub.pending_max_seats,
                    })),
                at,
            )
            .await;
    }

    /// Cancel at period end. Access continues until `period_end`.
    pub async fn cancel_subscription(&self, company_id: Uuid) -> BillingResult<Subscription> {
        let _guard = self.locks.acquire(company_id).await;
        let sub = self.require_subscription(company_id).await?;

        match sub.status {
            SubscriptionStatus::Cancelled => return Ok(sub),
            SubscriptionStatus::Expired => {
                return Err(BillingError::Conflict(
                    "Subscription has already expired".to_string(),
                ))
            }
            _ => {}
        }

        let now = self.clock.now();
        let mut next = sub.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.clear_pending();
        next.updated_at = now;
        let saved = self.save(&sub, next).await?;

        self.events
            .record(
                BillingEventBuilder::new(company_id, BillingEventType::SubscriptionCancelled)
                    .subscription(saved.id)
                    .actor(ActorType::Owner)
                    .data(serde_json::json!({ "previous_status": sub.status.as_str() })),
                now,
            )
            .await;

        tracing::info!(
            company_id = %company_id,
            access_until = %saved.period_end,
            "Cancelled subscription"
        );
        Ok(saved)
    }

    /// Withdraw a scheduled downgrade and seat decrease
    pub async fn cancel_scheduled_change(&self, company_id: Uuid) -> BillingResult<Subscription> {
        let _guard = self.locks.acquire(company_id).await;
        let sub = self.require_subscription(company_id).await?;
        if !sub.has_pending_change() {
            return Err(BillingError::NotFound(
                "No scheduled change to cancel".to_string(),
            ));
        }

        let now = self.clock.now();
        let mut next = sub.clone();
        next.clear_pending();
        next.updated_at = now;
        let saved = self.save(&sub, next).await?;

        self.events
            .record(
                BillingEventBuilder::new(company_id, BillingEventType::PendingChangeCancelled)
                    .subscription(saved.id)
                    .actor(ActorType::Owner)
                    .data(serde_json::json!({
                        "pending_plan_id": sub.pending_plan_id,
                        "pending_max_seats": sub.pending_max_seats,
                    })),
                now,
            )
            .await;

        tracing::info!(company_id = %company_id, "Cancelled scheduled change");
        Ok(saved)
    }

    pub async fn get_my_subscription(&self, company_id: Uuid) -> BillingResult<SubscriptionView> {
        let subscription = self.require_subscription(company_id).await?;
        let plan = self.catalog.get_plan(&subscription.plan_id).await?;
        let pending_plan = match subscription.pending_plan_id.as_deref() {
            Some(id) => Some(self.catalog.get_plan(id).await?),
            None => None,
        };
        let active_employees = self.employees.count_active_by_company_id(company_id).await?;
        let has_access = subscription.grants_access(self.clock.now());

        Ok(SubscriptionView {
            features: plan.features.clone(),
            subscription,
            plan,
            pending_plan,
            active_employees,
            has_access,
        })
    }

    /// Mark the invoice paid and apply its effect to the subscription as one unit.
    ///
    /// A second call for the same invoice is a no-op.
    pub async fn settle_paid_invoice(
        &self,
        invoice_id: Uuid,
        payment: PaymentDetails,
    ) -> BillingResult<SettleOutcome> {
        let invoice = self.load_invoice(invoice_id).await?;
        let _guard = self.locks.acquire(invoice.company_id).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let invoice = self.load_invoice(invoice_id).await?;
            if !invoice.is_pending() {
                return Ok(SettleOutcome::AlreadyProcessed(invoice));
            }

            let current = self.get_subscription(invoice.company_id).await?;
            let write = paid_effect(
                &invoice,
                current.as_ref(),
                payment.paid_at,
                self.clock.now(),
                self.config.period,
            );

            match self.invoices.mark_paid(invoice_id, &payment, &write).await {
                Ok(true) => {
                    let subscription = write.subscription().clone();
                    self.record_paid_effect(&invoice, current.as_ref(), &subscription, payment.paid_at)
                        .await;
                    return Ok(SettleOutcome::Applied(subscription));
                }
                Ok(false) => {
                    return Ok(SettleOutcome::AlreadyProcessed(
                        self.load_invoice(invoice_id).await?,
                    ))
                }
                Err(BillingError::ConcurrentModification(reason))
                    if attempt < MAX_SETTLE_ATTEMPTS =>
                {
                    tracing::warn!(
                        invoice_id = %invoice_id,
                        attempt = attempt,
                        reason = %reason,
                        "Subscription changed while settling invoice, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))
    }

    async fn record_paid_effect(
        &self,
        invoice: &Invoice,
        previous: Option<&Subscription>,
        subscription: &Subscription,
        paid_at: OffsetDateTime,
    ) {
        let event_type = match invoice.purpose {
            InvoicePurpose::Checkout => match previous {
                Some(prev) if prev.period_end == subscription.period_start => {
                    BillingEventType::SubscriptionRenewed
                }
                _ => BillingEventType::SubscriptionActivated,
            },
            InvoicePurpose::Upgrade => BillingEventType::PlanUpgraded,
            InvoicePurpose::SeatChange => BillingEventType::SeatsIncreased,
        };

        self.events
            .record(
                BillingEventBuilder::new(subscription.company_id, event_type)
                    .subscription(subscription.id)
                    .invoice(invoice.id)
                    .actor(ActorType::Provider)
                    .data(serde_json::json!({
                        "previous_plan": previous.map(|p| p.plan_id.clone()),
                        "plan_id": subscription.plan_id,
                        "max_seats": subscription.max_seats,
                    })),
                paid_at,
            )
            .await;

        tracing::info!(
            company_id = %subscription.company_id,
            invoice_id = %invoice.id,
            purpose = invoice.purpose.as_str(),
            plan_id = %subscription.plan_id,
            max_seats = subscription.max_seats,
            period_end = %subscription.period_end,
            "Applied paid invoice to subscription"
        );
    }

    /// Commit a due pending plan or seat change.
    ///
    /// The new seat cap is re-checked against the live headcount; if it would
    /// be exceeded the change is refused and left pending for the next sweep.
    /// Only an active subscription rolls into a new period. Any other
    /// non-expired status takes the new plan and seats but keeps its lapsed
    /// period.
    pub async fn commit_pending_change(&self, subscription_id: Uuid) -> BillingResult<CommitOutcome> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", subscription_id))
            })?;
        let _guard = self.locks.acquire(sub.company_id).await;

        // Re-read under the lock
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", subscription_id))
            })?;

        if !sub.has_pending_change() {
            return Ok(CommitOutcome::NothingPending);
        }
        if sub.status == SubscriptionStatus::Expired {
            return Ok(CommitOutcome::NotEligible(sub.status));
        }
        let now = self.clock.now();
        if sub.period_end > now {
            return Ok(CommitOutcome::NotDue);
        }

        let target_plan = match sub.pending_plan_id.as_deref() {
            Some(id) => self.catalog.get_plan(id).await?,
            None => self.catalog.get_plan(&sub.plan_id).await?,
        };
        let new_seats = match (sub.pending_max_seats, sub.pending_plan_id.is_some()) {
            (Some(seats), _) => seats,
            (None, true) => target_plan.max_seats_included,
            (None, false) => sub.max_seats,
        };

        let active = self
            .employees
            .count_active_by_company_id(sub.company_id)
            .await?;
        if active > i64::from(new_seats) {
            tracing::warn!(
                company_id = %sub.company_id,
                subscription_id = %sub.id,
                active_employees = active,
                new_max_seats = new_seats,
                pending_plan_id = ?sub.pending_plan_id,
                "Refusing pending change: active employees exceed new seat cap"
            );
            self.events
                .record(
                    BillingEventBuilder::new(sub.company_id, BillingEventType::PendingChangeRefused)
                        .subscription(sub.id)
                        .actor(ActorType::Scheduler)
                        .data(serde_json::json!({
                            "active_employees": active,
                            "new_max_seats": new_seats,
                            "pending_plan_id": sub.pending_plan_id,
                        })),
                    now,
                )
                .await;
            return Ok(CommitOutcome::Refused {
                active,
                max_seats: new_seats,
            });
        }

        let mut next = sub.clone();
        next.plan_id = target_plan.id.clone();
        next.max_seats = new_seats;
        next.clear_pending();
        if sub.status == SubscriptionStatus::Active {
            next.period_start = sub.period_end;
            next.period_end = sub.period_end + self.config.period;
        }
        next.updated_at = now;
        let saved = self.save(&sub, next).await?;

        self.events
            .record(
                BillingEventBuilder::new(sub.company_id, BillingEventType::PendingChangeCommitted)
                    .subscription(saved.id)
                    .actor(ActorType::Scheduler)
                    .data(serde_json::json!({
                        "from_plan": sub.plan_id,
                        "to_plan": saved.plan_id,
                        "from_seats": sub.max_seats,
                        "to_seats": saved.max_seats,
                    })),
                now,
            )
            .await;

        tracing::info!(
            company_id = %saved.company_id,
            from_plan = %sub.plan_id,
            to_plan = %saved.plan_id,
            max_seats = saved.max_seats,
            period_end = %saved.period_end,
            "Committed pending subscription change"
        );
        Ok(CommitOutcome::Committed(saved))
    }

    /// Subscriptions whose pending change is due at `now`
    pub async fn list_due_pending_changes(&self) -> BillingResult<Vec<Subscription>> {
        self.store
            .list_with_pending_changes(Some(self.clock.now()))
            .await
    }

    /// Move lapsed subscriptions along: cancelled to expired, trial and active
    /// to past_due, and anything still unpaid beyond the grace window to
    /// expired.
    pub async fn expire_lapsed_subscriptions(&self) -> BillingResult<ExpiryCounts> {
        let now = self.clock.now();
        let candidates = self
            .store
            .list_expiring(
                &[
                    SubscriptionStatus::Trial,
                    SubscriptionStatus::Active,
                    SubscriptionStatus::PastDue,
                    SubscriptionStatus::Cancelled,
                ],
                now,
            )
            .await?;
        if candidates.is_empty() {
            return Ok(ExpiryCounts::default());
        }

        let grace_cutoff = now - self.config.grace_period;
        let counts = ExpiryCounts {
            cancelled_expired: self
                .store
                .update_expired_to_status(
                    &[SubscriptionStatus::Cancelled],
                    now,
                    SubscriptionStatus::Expired,
                    now,
                )
                .await?,
            // Past the grace window goes straight to expired, even from trial or active
            grace_expired: self
                .store
                .update_expired_to_status(
                    &[
                        SubscriptionStatus::Trial,
                        SubscriptionStatus::Active,
                        SubscriptionStatus::PastDue,
                    ],
                    grace_cutoff,
                    SubscriptionStatus::Expired,
                    now,
                )
                .await?,
            moved_to_past_due: self
                .store
                .update_expired_to_status(
                    &[SubscriptionStatus::Trial, SubscriptionStatus::Active],
                    now,
                    SubscriptionStatus::PastDue,
                    now,
                )
                .await?,
        };

        if counts.total() > 0 {
            tracing::info!(
                cancelled_expired = counts.cancelled_expired,
                grace_expired = counts.grace_expired,
                moved_to_past_due = counts.moved_to_past_due,
                "Applied subscription expiry transitions"
            );
        }
        Ok(counts)
    }
}
