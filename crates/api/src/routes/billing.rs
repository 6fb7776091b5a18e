//! Billing routes for company owners and members
//!
//! Reads are open to every authenticated member of the company. Anything that
//! creates an invoice or changes the subscription is owner-only.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use hrcore_billing::{
    AccessDecision, Invoice, Plan, SeatChangeOutcome, Subscription, SubscriptionView,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: String,
    /// Defaults to the plan's included seats
    #[serde(default)]
    pub seats: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeSeatsRequest {
    pub seats: i32,
}

#[derive(Debug, Serialize)]
pub struct FeatureAccessResponse {
    pub feature: String,
    pub included: bool,
}

#[derive(Debug, Serialize)]
pub struct SeatAvailabilityResponse {
    pub can_add_employee: bool,
}

/// List purchasable plans with their features
pub async fn get_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.billing.catalog.list_active_plans().await?))
}

pub async fn get_my_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionView>> {
    let view = state
        .billing
        .subscriptions
        .get_my_subscription(auth_user.company_id)
        .await?;
    Ok(Json(view))
}

pub async fn get_invoices(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Invoice>>> {
    let invoices = state
        .billing
        .invoices
        .get_invoices(auth_user.company_id)
        .await?;
    Ok(Json(invoices))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    let invoice = state
        .billing
        .invoices
        .get_invoice_by_id(auth_user.company_id, invoice_id)
        .await?;
    Ok(Json(invoice))
}

pub async fn cancel_pending_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    auth_user.require_owner()?;
    let invoice = state
        .billing
        .invoices
        .cancel_pending_invoice(auth_user.company_id, invoice_id)
        .await?;
    Ok(Json(invoice))
}

pub async fn start_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<Subscription>> {
    auth_user.require_owner()?;
    let sub = state
        .billing
        .subscriptions
        .start_trial(auth_user.company_id, &req.plan_id)
        .await?;
    Ok(Json(sub))
}

pub async fn checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<Invoice>> {
    auth_user.require_owner()?;
    tracing::info!(
        company_id = %auth_user.company_id,
        user_id = %auth_user.user_id,
        plan_id = %req.plan_id,
        seats = ?req.seats,
        "Checkout requested"
    );
    let invoice = state
        .billing
        .subscriptions
        .checkout(auth_user.company_id, &req.plan_id, req.seats)
        .await?;
    Ok(Json(invoice))
}

pub async fn upgrade_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<Invoice>> {
    auth_user.require_owner()?;
    let invoice = state
        .billing
        .subscriptions
        .upgrade_plan(auth_user.company_id, &req.plan_id)
        .await?;
    Ok(Json(invoice))
}

pub async fn downgrade_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<Subscription>> {
    auth_user.require_owner()?;
    let sub = state
        .billing
        .subscriptions
        .downgrade_plan(auth_user.company_id, &req.plan_id)
        .await?;
    Ok(Json(sub))
}

pub async fn change_seats(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ChangeSeatsRequest>,
) -> ApiResult<Json<SeatChangeOutcome>> {
    auth_user.require_owner()?;
    let outcome = state
        .billing
        .subscriptions
        .change_seats(auth_user.company_id, req.seats)
        .await?;
    Ok(Json(outcome))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    auth_user.require_owner()?;
    let sub = state
        .billing
        .subscriptions
        .cancel_subscription(auth_user.company_id)
        .await?;
    Ok(Json(sub))
}

/// Withdraw a scheduled downgrade or seat decrease
pub async fn cancel_scheduled_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    auth_user.require_owner()?;
    let sub = state
        .billing
        .subscriptions
        .cancel_scheduled_change(auth_user.company_id)
        .await?;
    Ok(Json(sub))
}

pub async fn get_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<AccessDecision>> {
    Ok(Json(
        state.billing.access.get_access(auth_user.company_id).await?,
    ))
}

pub async fn has_feature(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(code): Path<String>,
) -> ApiResult<Json<FeatureAccessResponse>> {
    let included = state
        .billing
        .access
        .has_feature(auth_user.company_id, &code)
        .await?;
    Ok(Json(FeatureAccessResponse {
        feature: code,
        included,
    }))
}

pub async fn can_add_employee(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SeatAvailabilityResponse>> {
    let can_add_employee = state
        .billing
        .access
        .can_add_employee(auth_user.company_id)
        .await?;
    Ok(Json(SeatAvailabilityResponse { can_add_employee }))
}
