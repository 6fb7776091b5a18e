//! Plan and feature catalog
//!
//! Read-only view over plans and the features they include. Plans are ordered
//! into tiers by price so upgrades and downgrades can be told apart.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Base price per period in minor currency units
    pub price: i64,
    /// Price per seat above `max_seats_included`
    pub price_per_extra_seat: i64,
    pub max_seats_included: i32,
    pub active: bool,
    pub features: Vec<Feature>,
}

impl Plan {
    /// Total order used for upgrade/downgrade decisions
    pub fn tier_cmp(&self, other: &Plan) -> Ordering {
        self.price
            .cmp(&other.price)
            .then(self.max_seats_included.cmp(&other.max_seats_included))
            .then_with(|| self.name.cmp(&other.name))
    }

    pub fn is_higher_tier_than(&self, other: &Plan) -> bool {
        self.tier_cmp(other) == Ordering::Greater
    }

    /// Price of one period for the given seat count
    pub fn price_for(&self, seats: i32) -> i64 {
        let extra = i64::from((seats - self.max_seats_included).max(0));
        self.price + extra * self.price_per_extra_seat
    }

    pub fn includes(&self, feature_code: &str) -> bool {
        self.features.iter().any(|f| f.code == feature_code)
    }

    pub fn feature_codes(&self) -> Vec<String> {
        self.features.iter().map(|f| f.code.clone()).collect()
    }
}

#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn BillingStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Plans open for new checkouts, cheapest first, with features resolved
    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let mut plans = self.store.list_plans(true).await?;
        plans.sort_by(|a, b| a.tier_cmp(b));
        Ok(plans)
    }

    /// Any plan, including deactivated ones still referenced by subscribers
    pub async fn get_plan(&self, plan_id: &str) -> BillingResult<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan '{}' not found", plan_id)))
    }

    /// Plan that may be used for a new purchase
    pub async fn get_purchasable_plan(&self, plan_id: &str) -> BillingResult<Plan> {
        let plan = self.get_plan(plan_id).await?;
        if !plan.active {
            return Err(BillingError::Conflict(format!(
                "Plan '{}' is no longer offered",
                plan.name
            )));
        }
        Ok(plan)
    }

    pub async fn get_features_by_plan(&self, plan_id: &str) -> BillingResult<Vec<Feature>> {
        Ok(self.get_plan(plan_id).await?.features)
    }

    /// Whether `plan_id` includes `code`. Unknown plans and unknown feature codes
    /// are reported as `NotFound` rather than `false`.
    pub async fn has_feature(&self, plan_id: &str, code: &str) -> BillingResult<bool> {
        let plan = self.get_plan(plan_id).await?;
        if plan.includes(code) {
            return Ok(true);
        }
        self.ensure_feature_exists(code).await?;
        Ok(false)
    }

    pub async fn ensure_feature_exists(&self, code: &str) -> BillingResult<Feature> {
        self.store
            .get_feature(code)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Feature '{}' not found", code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBillingStore;

    fn feature(code: &str) -> Feature {
        Feature {
            code: code.to_string(),
            name: code.to_uppercase(),
        }
    }

    fn plan(id: &str, price: i64, seats: i32, features: &[&str]) -> Plan {
        Plan {
            id: id.to_string(),
            name: id.to_string(),
            price,
            price_per_extra_seat: 1_000,
            max_seats_included: seats,
            active: true,
            features: features.iter().map(|c| feature(c)).collect(),
        }
    }

    #[test]
    fn test_tier_order_follows_price() {
        let basic = plan("basic", 10_000, 5, &[]);
        let starter = plan("starter", 25_000, 10, &[]);
        assert!(starter.is_higher_tier_than(&basic));
        assert!(!basic.is_higher_tier_than(&starter));
        assert_eq!(basic.tier_cmp(&basic.clone()), Ordering::Equal);
    }

    #[test]
    fn test_price_for_extra_seats() {
        let starter = plan("starter", 25_000, 10, &[]);
        assert_eq!(starter.price_for(4), 25_000);
        assert_eq!(starter.price_for(10), 25_000);
        assert_eq!(starter.price_for(13), 28_000);
    }

    #[tokio::test]
    async fn test_has_feature_distinguishes_unknown_codes() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.seed_feature(feature("payroll"));
        store.seed_feature(feature("attendance"));
        store.seed_plan(plan("basic", 10_000, 5, &["attendance"]));
        let catalog = Catalog::new(store);

        assert!(catalog.has_feature("basic", "attendance").await.unwrap());
        assert!(!catalog.has_feature("basic", "payroll").await.unwrap());
        assert!(matches!(
            catalog.has_feature("basic", "teleport").await,
            Err(BillingError::NotFound(_))
        ));
        assert!(matches!(
            catalog.has_feature("gold", "payroll").await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_active_plans_listed_cheapest_first() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.seed_plan(plan("pro", 50_000, 25, &[]));
        store.seed_plan(plan("basic", 10_000, 5, &[]));
        store.seed_plan(plan("starter", 25_000, 10, &[]));
        store.seed_plan(plan("starter-plus", 25_000, 15, &[]));

        let stored: Vec<String> = store
            .list_plans(true)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(stored, ["basic", "starter", "starter-plus", "pro"]);

        let catalog = Catalog::new(store);
        let listed: Vec<String> = catalog
            .list_active_plans()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(listed, ["basic", "starter", "starter-plus", "pro"]);
    }

    #[tokio::test]
    async fn test_inactive_plans_hidden_from_listing() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.seed_plan(plan("pro", 50_000, 25, &[]));
        let mut legacy = plan("legacy", 5_000, 3, &[]);
        legacy.active = false;
        store.seed_plan(legacy);
        let catalog = Catalog::new(store);

        let plans = catalog.list_active_plans().await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].id, "pro");
        assert!(catalog.get_plan("legacy").await.is_ok());
        assert!(matches!(
            catalog.get_purchasable_plan("legacy").await,
            Err(BillingError::Conflict(_))
        ));
    }
}
