//! Billing error types

use uuid::Uuid;

/// Errors produced by the billing core.
///
/// The variants group into the taxonomy the HTTP layer maps onto status codes:
/// not-found, conflict, forbidden, unauthorized and transient failures.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("A pending invoice already exists for company {company_id}")]
    DuplicatePendingInvoice { company_id: Uuid },

    #[error("Invalid plan change: {0}")]
    InvalidPlanChange(String),

    #[error("Feature '{0}' is not included in the current plan")]
    FeatureNotIncluded(String),

    #[error("Seat limit reached: {active} active employees for {max_seats} seats")]
    SeatLimitExceeded { active: i64, max_seats: i32 },

    #[error("Subscription is not usable: {0}")]
    SubscriptionInactive(String),

    #[error("Invalid webhook callback token")]
    WebhookTokenInvalid,

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Payment provider unavailable: {0}")]
    Provider(String),

    #[error("Payment provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Failures that may succeed when the same operation is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::Provider(_)
                | BillingError::Timeout(_)
                | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<hrcore_shared::ParseEnumError> for BillingError {
    fn from(e: hrcore_shared::ParseEnumError) -> Self {
        BillingError::Internal(format!("Corrupt stored value: {}", e))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
