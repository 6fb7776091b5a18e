//! Postgres-backed store

use std::collections::HashMap;

use async_trait::async_trait;
use hrcore_shared::{InvoiceStatus, SubscriptionStatus};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, SubscriptionWrite};
use crate::catalog::{Feature, Plan};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEvent, BillingEventType};
use crate::invoices::{Invoice, PaymentDetails};
use crate::subscriptions::Subscription;

const ONE_PENDING_INDEX: &str = "idx_invoices_one_pending_per_company";

const SUBSCRIPTION_COLUMNS: &str = "id, company_id, plan_id, status, max_seats, \
     pending_max_seats, pending_plan_id, period_start, period_end, created_at, updated_at, version";

const INVOICE_COLUMNS: &str = "id, company_id, subscription_id, provider_invoice_id, invoice_url, \
     status, purpose, plan_id, seats, amount, payment_method, payment_channel, created_at, \
     expires_at, paid_at";

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: String,
    name: String,
    price: i64,
    price_per_extra_seat: i64,
    max_seats_included: i32,
    active: bool,
}

#[derive(sqlx::FromRow)]
struct PlanFeatureRow {
    plan_id: String,
    code: String,
    name: String,
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    company_id: Uuid,
    plan_id: String,
    status: String,
    max_seats: i32,
    pending_max_seats: Option<i32>,
    pending_plan_id: Option<String>,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    version: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            company_id: row.company_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            max_seats: row.max_seats,
            pending_max_seats: row.pending_max_seats,
            pending_plan_id: row.pending_plan_id,
            period_start: row.period_start,
            period_end: row.period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    company_id: Uuid,
    subscription_id: Option<Uuid>,
    provider_invoice_id: Option<String>,
    invoice_url: Option<String>,
    status: String,
    purpose: String,
    plan_id: String,
    seats: i32,
    amount: i64,
    payment_method: Option<String>,
    payment_channel: Option<String>,
    created_at: OffsetDateTime,
    expires_at: Option<OffsetDateTime>,
    paid_at: Option<OffsetDateTime>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Invoice {
            id: row.id,
            company_id: row.company_id,
            subscription_id: row.subscription_id,
            provider_invoice_id: row.provider_invoice_id,
            invoice_url: row.invoice_url,
            status: row.status.parse()?,
            purpose: row.purpose.parse()?,
            plan_id: row.plan_id,
            seats: row.seats,
            amount: row.amount,
            payment_method: row.payment_method,
            payment_channel: row.payment_channel,
            created_at: row.created_at,
            expires_at: row.expires_at,
            paid_at: row.paid_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    company_id: Uuid,
    subscription_id: Option<Uuid>,
    invoice_id: Option<Uuid>,
    event_type: String,
    actor_type: String,
    data: serde_json::Value,
    created_at: OffsetDateTime,
}

fn status_list(statuses: &[SubscriptionStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn is_unique_violation(e: &sqlx::Error, constraint: &str) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() && db.constraint().map_or(false, |c| c == constraint)
        }
        _ => false,
    }
}

pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_plans(&self, rows: Vec<PlanRow>) -> BillingResult<Vec<Plan>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let feature_rows: Vec<PlanFeatureRow> = sqlx::query_as(
            r#"
            SELECT pf.plan_id, f.code, f.name
            FROM plan_features pf
            JOIN features f ON f.code = pf.feature_code
            WHERE pf.plan_id = ANY($1)
            ORDER BY pf.plan_id, pf.position, f.code
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut features: HashMap<String, Vec<Feature>> = HashMap::new();
        for row in feature_rows {
            features.entry(row.plan_id).or_default().push(Feature {
                code: row.code,
                name: row.name,
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| Plan {
                features: features.remove(&row.id).unwrap_or_default(),
                id: row.id,
                name: row.name,
                price: row.price,
                price_per_extra_seat: row.price_per_extra_seat,
                max_seats_included: row.max_seats_included,
                active: row.active,
            })
            .collect())
    }

    async fn write_subscription(
        tx: &mut Transaction<'_, Postgres>,
        write: &SubscriptionWrite,
    ) -> BillingResult<bool> {
        let affected = match write {
            SubscriptionWrite::Insert(sub) => sqlx::query(
                r#"
                INSERT INTO subscriptions (id, company_id, plan_id, status, max_seats,
                    pending_max_seats, pending_plan_id, period_start, period_end,
                    created_at, updated_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0)
                ON CONFLICT (company_id) DO NOTHING
                "#,
            )
            .bind(sub.id)
            .bind(sub.company_id)
            .bind(&sub.plan_id)
            .bind(sub.status.as_str())
            .bind(sub.max_seats)
            .bind(sub.pending_max_seats)
            .bind(&sub.pending_plan_id)
            .bind(sub.period_start)
            .bind(sub.period_end)
            .bind(sub.created_at)
            .bind(sub.updated_at)
            .execute(&mut **tx)
            .await?
            .rows_affected(),
            SubscriptionWrite::Update {
                subscription: sub,
                expected_version,
            } => sqlx::query(
                r#"
                UPDATE subscriptions
                SET plan_id = $1,
                    status = $2,
                    max_seats = $3,
                    pending_max_seats = $4,
                    pending_plan_id = $5,
                    period_start = $6,
                    period_end = $7,
                    updated_at = $8,
                    version = version + 1
                WHERE id = $9 AND version = $10
                "#,
            )
            .bind(&sub.plan_id)
            .bind(sub.status.as_str())
            .bind(sub.max_seats)
            .bind(sub.pending_max_seats)
            .bind(&sub.pending_plan_id)
            .bind(sub.period_start)
            .bind(sub.period_end)
            .bind(sub.updated_at)
            .bind(sub.id)
            .bind(expected_version)
            .execute(&mut **tx)
            .await?
            .rows_affected(),
        };
        Ok(affected == 1)
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn list_plans(&self, active_only: bool) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, price, price_per_extra_seat, max_seats_included, active
            FROM plans
            WHERE active OR NOT $1
            ORDER BY price, max_seats_included, name
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        self.fetch_plans(rows).await
    }

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, price, price_per_extra_seat, max_seats_included, active
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.fetch_plans(vec![row]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn get_feature(&self, code: &str) -> BillingResult<Option<Feature>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT code, name FROM features WHERE code = $1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(code, name)| Feature { code, name }))
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription_by_company(
        &self,
        company_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE company_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let inserted =
            Self::write_subscription(&mut tx, &SubscriptionWrite::Insert(subscription.clone()))
                .await?;
        if !inserted {
            return Err(BillingError::Conflict(format!(
                "Company {} already has a subscription",
                subscription.company_id
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = Self::write_subscription(
            &mut tx,
            &SubscriptionWrite::Update {
                subscription: subscription.clone(),
                expected_version,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn list_expiring(
        &self,
        statuses: &[SubscriptionStatus],
        before: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE status = ANY($1) AND period_end < $2",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(status_list(statuses))
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn list_with_pending_changes(
        &self,
        due_by: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE (pending_plan_id IS NOT NULL OR pending_max_seats IS NOT NULL)
              AND ($1::timestamptz IS NULL OR period_end <= $1)
            ORDER BY period_end
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(due_by)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn update_expired_to_status(
        &self,
        from: &[SubscriptionStatus],
        cutoff: OffsetDateTime,
        to: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, updated_at = $2, version = version + 1
            WHERE status = ANY($3) AND period_end < $4
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(status_list(from))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO invoices (id, company_id, subscription_id, provider_invoice_id,
                invoice_url, status, purpose, plan_id, seats, amount, payment_method,
                payment_channel, created_at, expires_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.company_id)
        .bind(invoice.subscription_id)
        .bind(&invoice.provider_invoice_id)
        .bind(&invoice.invoice_url)
        .bind(invoice.status.as_str())
        .bind(invoice.purpose.as_str())
        .bind(&invoice.plan_id)
        .bind(invoice.seats)
        .bind(invoice.amount)
        .bind(&invoice.payment_method)
        .bind(&invoice.payment_channel)
        .bind(invoice.created_at)
        .bind(invoice.expires_at)
        .bind(invoice.paid_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e, ONE_PENDING_INDEX) => {
                Err(BillingError::DuplicatePendingInvoice {
                    company_id: invoice.company_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE id = $1",
            INVOICE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn get_invoice_by_provider_id(
        &self,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE provider_invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(provider_invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn find_pending_invoice(&self, company_id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE company_id = $1 AND status = 'pending' LIMIT 1",
            INVOICE_COLUMNS
        ))
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn count_pending_invoices(&self, company_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM invoices WHERE company_id = $1 AND status = 'pending'",
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_invoices(&self, company_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE company_id = $1 ORDER BY created_at DESC",
            INVOICE_COLUMNS
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Invoice::try_from).collect()
    }

    async fn attach_provider_invoice(
        &self,
        id: Uuid,
        provider_invoice_id: &str,
        invoice_url: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET provider_invoice_id = $1, invoice_url = $2, expires_at = $3
            WHERE id = $4
            "#,
        )
        .bind(provider_invoice_id)
        .bind(invoice_url)
        .bind(expires_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Invoice {} not found", id)));
        }
        Ok(())
    }

    async fn transition_invoice(
        &self,
        id: Uuid,
        to: InvoiceStatus,
        payment: Option<&PaymentDetails>,
    ) -> BillingResult<bool> {
        if to == InvoiceStatus::Paid && payment.is_none() {
            return Err(BillingError::InvalidInput(
                "Paid transition needs payment details".to_string(),
            ));
        }
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $1,
                paid_at = COALESCE($2, paid_at),
                payment_method = COALESCE($3, payment_method),
                payment_channel = COALESCE($4, payment_channel)
            WHERE id = $5 AND status = 'pending'
            "#,
        )
        .bind(to.as_str())
        .bind(payment.map(|p| p.paid_at))
        .bind(payment.and_then(|p| p.method.clone()))
        .bind(payment.and_then(|p| p.channel.clone()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn settle_invoice(
        &self,
        id: Uuid,
        payment: &PaymentDetails,
        write: &SubscriptionWrite,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        // The row lock serializes concurrent deliveries of the same invoice
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        if status.as_deref() != Some(InvoiceStatus::Pending.as_str()) {
            tx.rollback().await?;
            return Ok(false);
        }

        if !Self::write_subscription(&mut tx, write).await? {
            tx.rollback().await?;
            return Err(BillingError::ConcurrentModification(format!(
                "subscription for company {} changed while settling invoice {}",
                write.subscription().company_id,
                id
            )));
        }

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'paid', paid_at = $1, payment_method = $2, payment_channel = $3,
                subscription_id = $4
            WHERE id = $5
            "#,
        )
        .bind(payment.paid_at)
        .bind(&payment.method)
        .bind(&payment.channel)
        .bind(write.subscription().id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_stale_pending_invoices(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE status = 'pending' AND created_at < $1 ORDER BY created_at",
            INVOICE_COLUMNS
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Invoice::try_from).collect()
    }

    async fn companies_with_multiple_pending_invoices(&self) -> BillingResult<Vec<(Uuid, i64)>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT company_id, COUNT(*)
            FROM invoices
            WHERE status = 'pending'
            GROUP BY company_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn paid_invoices_missing_paid_at(&self) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE status = 'paid' AND paid_at IS NULL",
            INVOICE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Invoice::try_from).collect()
    }

    async fn append_event(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (id, company_id, subscription_id, invoice_id,
                event_type, actor_type, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.company_id)
        .bind(event.subscription_id)
        .bind(event.invoice_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(&event.data)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(&self, company_id: Uuid) -> BillingResult<Vec<BillingEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, company_id, subscription_id, invoice_id, event_type, actor_type,
                   data, created_at
            FROM billing_events
            WHERE company_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_type = BillingEventType::parse(&row.event_type).ok_or_else(|| {
                BillingError::Internal(format!("Unknown billing event type '{}'", row.event_type))
            })?;
            events.push(BillingEvent {
                id: row.id,
                company_id: row.company_id,
                subscription_id: row.subscription_id,
                invoice_id: row.invoice_id,
                event_type,
                actor_type: ActorType::parse(&row.actor_type),
                data: row.data,
                created_at: row.created_at,
            });
        }
        Ok(events)
    }
}
