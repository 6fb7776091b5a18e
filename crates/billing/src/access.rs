//! Request-time access checks
//!
//! Checks run in two stages. A token may carry an [`AccessSnapshot`] taken when
//! it was issued; if the snapshot alone allows the request, the ledger is not
//! consulted. Otherwise the ledger decides. A snapshot never denies on its own.

use std::sync::Arc;

use hrcore_shared::SubscriptionStatus;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::employees::EmployeeDirectory;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;
use crate::subscriptions::Subscription;

/// Subscription state as embedded in an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSnapshot {
    pub status: SubscriptionStatus,
    #[serde(rename = "subscription_expires_at", with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastCheck {
    Allow,
    /// Ask the ledger
    Defer,
}

impl AccessSnapshot {
    pub fn from_subscription(subscription: &Subscription, features: Vec<String>) -> Self {
        Self {
            status: subscription.status,
            expires_at: subscription.period_end,
            features,
        }
    }

    pub fn fast_check(&self, now: OffsetDateTime) -> FastCheck {
        if !self.status.is_terminal() && now < self.expires_at {
            FastCheck::Allow
        } else {
            FastCheck::Defer
        }
    }

    pub fn fast_check_feature(&self, code: &str, now: OffsetDateTime) -> FastCheck {
        match self.fast_check(now) {
            FastCheck::Allow if self.features.iter().any(|f| f == code) => FastCheck::Allow,
            _ => FastCheck::Defer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub access_until: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct AccessGuard {
    store: Arc<dyn BillingStore>,
    catalog: Catalog,
    employees: Arc<dyn EmployeeDirectory>,
    clock: Arc<dyn Clock>,
}

impl AccessGuard {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: Catalog,
        employees: Arc<dyn EmployeeDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            employees,
            clock,
        }
    }

    /// The company's subscription if it currently grants access
    async fn live_subscription(&self, company_id: Uuid) -> BillingResult<Option<Subscription>> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_subscription_by_company(company_id)
            .await?
            .filter(|s| s.grants_access(now)))
    }

    pub async fn get_access(&self, company_id: Uuid) -> BillingResult<AccessDecision> {
        let now = self.clock.now();
        let decision = match self.store.get_subscription_by_company(company_id).await? {
            Some(sub) => AccessDecision {
                allowed: sub.grants_access(now),
                status: Some(sub.status),
                plan_id: Some(sub.plan_id),
                access_until: Some(sub.period_end),
            },
            None => AccessDecision {
                allowed: false,
                status: None,
                plan_id: None,
                access_until: None,
            },
        };
        Ok(decision)
    }

    /// Whether the company's current plan includes `code`. False without a
    /// usable subscription; `NotFound` for an unknown feature code.
    pub async fn has_feature(&self, company_id: Uuid, code: &str) -> BillingResult<bool> {
        match self.live_subscription(company_id).await? {
            Some(sub) => self.catalog.has_feature(&sub.plan_id, code).await,
            None => {
                self.catalog.ensure_feature_exists(code).await?;
                Ok(false)
            }
        }
    }

    /// `active employees < max_seats`, using a live headcount
    pub async fn can_add_employee(&self, company_id: Uuid) -> BillingResult<bool> {
        let Some(sub) = self.live_subscription(company_id).await? else {
            return Ok(false);
        };
        let active = self.employees.count_active_by_company_id(company_id).await?;
        Ok(active < i64::from(sub.max_seats))
    }

    pub async fn require_active_subscription(
        &self,
        company_id: Uuid,
        snapshot: Option<&AccessSnapshot>,
    ) -> BillingResult<()> {
        if let Some(snapshot) = snapshot {
            if snapshot.fast_check(self.clock.now()) == FastCheck::Allow {
                return Ok(());
            }
        }

        if self.live_subscription(company_id).await?.is_none() {
            tracing::debug!(company_id = %company_id, "Denied: no active subscription");
            return Err(BillingError::SubscriptionInactive(
                "An active subscription is required".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn require_feature(
        &self,
        company_id: Uuid,
        code: &str,
        snapshot: Option<&AccessSnapshot>,
    ) -> BillingResult<()> {
        if let Some(snapshot) = snapshot {
            if snapshot.fast_check_feature(code, self.clock.now()) == FastCheck::Allow {
                return Ok(());
            }
        }

        let Some(sub) = self.live_subscription(company_id).await? else {
            return Err(BillingError::SubscriptionInactive(
                "An active subscription is required".to_string(),
            ));
        };
        if !self.catalog.has_feature(&sub.plan_id, code).await? {
            tracing::debug!(
                company_id = %company_id,
                plan_id = %sub.plan_id,
                feature = %code,
                "Denied: feature not in plan"
            );
            return Err(BillingError::FeatureNotIncluded(code.to_string()));
        }
        Ok(())
    }

    pub async fn require_seat_available(&self, company_id: Uuid) -> BillingResult<()> {
        let Some(sub) = self.live_subscription(company_id).await? else {
            return Err(BillingError::SubscriptionInactive(
                "An active subscription is required".to_string(),
            ));
        };
        let active = self.employees.count_active_by_company_id(company_id).await?;
        if active >= i64::from(sub.max_seats) {
            return Err(BillingError::SeatLimitExceeded {
                active,
                max_seats: sub.max_seats,
            });
        }
        Ok(())
    }
}
