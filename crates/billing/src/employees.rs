//! Employee headcount as seen by billing
//!
//! The employee domain owns the `employees` table; billing only asks how many
//! of a company's employees are currently active.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[async_trait]
pub trait EmployeeDirectory: Send + Sync {
    async fn count_active_by_company_id(&self, company_id: Uuid) -> BillingResult<i64>;
}

pub struct PgEmployeeDirectory {
    pool: PgPool,
}

impl PgEmployeeDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmployeeDirectory for PgEmployeeDirectory {
    async fn count_active_by_company_id(&self, company_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM employees WHERE company_id = $1 AND status = 'active'",
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Fixed headcounts, for tests and local runs without the employee schema
#[derive(Debug, Default)]
pub struct StaticEmployeeDirectory {
    counts: Mutex<HashMap<Uuid, i64>>,
}

impl StaticEmployeeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, company_id: Uuid, active: i64) {
        if let Ok(mut counts) = self.counts.lock() {
            counts.insert(company_id, active);
        }
    }
}

#[async_trait]
impl EmployeeDirectory for StaticEmployeeDirectory {
    async fn count_active_by_company_id(&self, company_id: Uuid) -> BillingResult<i64> {
        Ok(self
            .counts
            .lock()
            .ok()
            .and_then(|c| c.get(&company_id).copied())
            .unwrap_or(0))
    }
}
