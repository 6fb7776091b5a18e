//! API routes

pub mod admin;
pub mod billing;
pub mod webhooks;

use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let billing_routes = Router::new()
        .route("/subscription", get(billing::get_my_subscription))
        .route("/invoices", get(billing::get_invoices))
        .route("/invoices/{id}", get(billing::get_invoice))
        .route("/invoices/{id}/cancel", post(billing::cancel_pending_invoice))
        .route("/trial", post(billing::start_trial))
        .route("/checkout", post(billing::checkout))
        .route("/upgrade", post(billing::upgrade_plan))
        .route("/downgrade", post(billing::downgrade_plan))
        .route("/seats", post(billing::change_seats))
        .route("/cancel", post(billing::cancel_subscription))
        .route("/scheduled-change", delete(billing::cancel_scheduled_change))
        .route("/access", get(billing::get_access))
        .route("/features/{code}", get(billing::has_feature))
        .route("/seats/available", get(billing::can_add_employee))
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    let admin_routes = Router::new()
        .route(
            "/billing/invariants",
            get(admin::check_billing_invariants),
        )
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .route("/health", get(health))
        // Public
        .route("/api/v1/billing/plans", get(billing::get_plans))
        // Authenticated by callback token, not JWT
        .route("/api/v1/webhooks/payments", post(webhooks::payment_webhook))
        .nest("/api/v1/billing", billing_routes)
        .nest("/api/v1/admin", admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
