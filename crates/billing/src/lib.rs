// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
#![allow(clippy::too_many_arguments)] // Service constructors take every collaborator explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! HR Core Billing Module
//!
//! Subscription and billing lifecycle for multi-tenant companies.
//!
//! ## Features
//!
//! - **Catalog**: Plans, their features and tier ordering
//! - **Subscription Ledger**: One subscription per company, trial through expiry
//! - **Invoices**: At most one pending invoice per company, created at the payment provider
//! - **Webhooks**: Idempotent reconciliation of provider payment callbacks
//! - **Deferred Changes**: Downgrades and seat decreases committed at period end
//! - **Sweep**: Stale invoices, pending commits and lapsed subscriptions
//! - **Access Guard**: Subscription, feature and seat checks for request handlers
//! - **Invariants**: Runnable consistency checks over billing data

pub mod access;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod employees;
pub mod error;
pub mod events;
pub mod invariants;
pub mod invoices;
pub mod locks;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod test_support;

// Access
pub use access::{AccessDecision, AccessGuard, AccessSnapshot, FastCheck};

// Catalog
pub use catalog::{Catalog, Feature, Plan};

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::BillingConfig;

// Employees
pub use employees::{EmployeeDirectory, PgEmployeeDirectory, StaticEmployeeDirectory};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{Invoice, InvoiceService, NewInvoice, PaymentDetails, StaleInvoiceSweep};

// Locks
pub use locks::TenantLocks;

// Provider
pub use provider::{
    FakePaymentProvider, HttpPaymentProvider, InvoiceRequest, PaymentProvider, ProviderInvoice,
};

// Scheduler
pub use scheduler::{StuckPendingChange, SweepFailure, SweepReport, SweepStep, Sweeper};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore, SubscriptionWrite};

// Subscriptions
pub use subscriptions::{
    CommitOutcome, ExpiryCounts, SeatChangeOutcome, SettleOutcome, Subscription,
    SubscriptionService, SubscriptionView,
};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome, WebhookPayload};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub catalog: Catalog,
    pub subscriptions: SubscriptionService,
    pub invoices: InvoiceService,
    pub webhooks: WebhookHandler,
    pub sweeper: Sweeper,
    pub access: AccessGuard,
    pub invariants: InvariantChecker,
    pub events: BillingEventLogger,
    pub config: BillingConfig,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let provider = HttpPaymentProvider::new(&config)?;

        Ok(Self::new(
            config,
            Arc::new(PgBillingStore::new(pool.clone())),
            Arc::new(PgEmployeeDirectory::new(pool)),
            Arc::new(provider),
            Arc::new(SystemClock),
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        employees: Arc<dyn EmployeeDirectory>,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalog = Catalog::new(store.clone());
        let invoices = InvoiceService::new(
            store.clone(),
            provider,
            clock.clone(),
            config.clone(),
        );
        let subscriptions = SubscriptionService::new(
            store.clone(),
            catalog.clone(),
            invoices.clone(),
            employees.clone(),
            clock.clone(),
            TenantLocks::new(),
            config.clone(),
        );

        Self {
            webhooks: WebhookHandler::new(
                config.callback_token.clone(),
                invoices.clone(),
                subscriptions.clone(),
                clock.clone(),
            ),
            sweeper: Sweeper::new(subscriptions.clone(), invoices.clone(), &config),
            access: AccessGuard::new(store.clone(), catalog.clone(), employees, clock.clone()),
            invariants: InvariantChecker::new(store.clone(), catalog.clone(), clock),
            events: BillingEventLogger::new(store),
            catalog,
            subscriptions,
            invoices,
            config,
        }
    }
}
