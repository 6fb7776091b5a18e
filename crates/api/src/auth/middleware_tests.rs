//! Request-level tests for authentication, subscription gating and routes
//!
//! Every test drives the real router over an in-memory billing core, so the
//! token checks, role checks and error mapping are exercised end to end.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    routing::get,
    Router,
};
use hrcore_billing::{
    AccessSnapshot, BillingConfig, BillingService, FakePaymentProvider, Feature,
    InMemoryBillingStore, ManualClock, PaymentDetails, Plan, StaticEmployeeDirectory,
};
use hrcore_shared::SubscriptionStatus;
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use uuid::Uuid;

use super::middleware::*;
use crate::{config::Config, routes::create_router, state::AppState};

const JWT_SECRET: &str = "test-jwt-secret-key-for-testing-only";
const CALLBACK_TOKEN: &str = "test-callback-token";

fn plan(id: &str, price: i64, seats: i32, features: &[&str]) -> Plan {
    Plan {
        id: id.to_string(),
        name: id.to_string(),
        price,
        price_per_extra_seat: 1_000,
        max_seats_included: seats,
        active: true,
        features: features
            .iter()
            .map(|code| Feature {
                code: code.to_string(),
                name: code.to_string(),
            })
            .collect(),
    }
}

fn setup_state() -> AppState {
    let store = Arc::new(InMemoryBillingStore::new());
    store.seed_plan(plan("basic", 10_000, 5, &["attendance"]));
    store.seed_plan(plan("pro", 50_000, 25, &["attendance", "payroll"]));

    let config = Config {
        database_url: "postgresql://localhost/test".to_string(),
        bind_address: "127.0.0.1:0".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        jwt_expiry_hours: 1,
        run_migrations: false,
        allowed_origins: vec![],
    };
    let billing = BillingService::new(
        BillingConfig {
            callback_token: CALLBACK_TOKEN.to_string(),
            ..BillingConfig::default()
        },
        store,
        Arc::new(StaticEmployeeDirectory::new()),
        Arc::new(FakePaymentProvider::new()),
        Arc::new(ManualClock::new(OffsetDateTime::now_utc())),
    );
    AppState::new(config, billing)
}

fn token(state: &AppState, company_id: Uuid, role: &str, snapshot: Option<AccessSnapshot>) -> String {
    state
        .jwt_manager
        .generate_access_token(Uuid::new_v4(), company_id, role, snapshot)
        .unwrap()
}

/// Pay for `plan_id` directly through the billing core
async fn activate(state: &AppState, company_id: Uuid, plan_id: &str) {
    let invoice = state
        .billing
        .subscriptions
        .checkout(company_id, plan_id, None)
        .await
        .unwrap();
    state
        .billing
        .subscriptions
        .settle_paid_invoice(
            invoice.id,
            PaymentDetails {
                paid_at: OffsetDateTime::now_utc(),
                method: None,
                channel: None,
            },
        )
        .await
        .unwrap();
}

fn get_request(uri: &str, token: Option<&str>) -> Request {
    let mut builder = axum::http::Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(uri: &str, token: &str, body: Value) -> Request {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook_request(token: Option<&str>, body: Value) -> Request {
    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/payments")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header("x-callback-token", token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// A router with one handler behind `require_auth` and a subscription gate
fn gated_router(state: &AppState, feature: Option<&'static str>) -> Router {
    let protected = Router::new().route("/protected", get(|| async { "ok" }));
    let protected = match feature {
        Some(code) => protected.layer(middleware::from_fn_with_state(
            state.clone(),
            move |s: State<AppState>, req: Request, next: Next| require_feature(code, s, req, next),
        )),
        None => protected.layer(middleware::from_fn_with_state(
            state.clone(),
            require_active_subscription,
        )),
    };
    protected
        .layer(middleware::from_fn_with_state(state.auth_state(), require_auth))
        .with_state(state.clone())
}

// =============================================================================
// Token extraction
// =============================================================================

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let state = setup_state();
    let app = create_router(state);

    let response = app
        .oneshot(get_request("/api/v1/billing/subscription", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn test_token_signed_with_other_secret_is_unauthorized() {
    let state = setup_state();
    let forged = super::jwt::JwtManager::new("another-secret-that-is-long-enough-123", 1)
        .generate_access_token(Uuid::new_v4(), Uuid::new_v4(), ROLE_OWNER, None)
        .unwrap();
    let app = create_router(state);

    let response = app
        .oneshot(get_request("/api/v1/billing/access", Some(&forged)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_accepted_from_cookie() {
    let state = setup_state();
    let token = token(&state, Uuid::new_v4(), ROLE_OWNER, None);
    let app = create_router(state);

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/api/v1/billing/access")
        .header(header::COOKIE, format!("theme=dark; hrcore_auth_token={}", token))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], false);
}

#[tokio::test]
async fn test_plans_are_public() {
    let state = setup_state();
    let app = create_router(state);

    let response = app
        .oneshot(get_request("/api/v1/billing/plans", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.as_array().map(Vec::len), Some(2));
}

// =============================================================================
// Subscription gate
// =============================================================================

#[tokio::test]
async fn test_no_subscription_is_forbidden() {
    let state = setup_state();
    let token = token(&state, Uuid::new_v4(), ROLE_OWNER, None);

    let response = gated_router(&state, None)
        .oneshot(get_request("/protected", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_fresh_snapshot_allows_without_ledger_row() {
    let state = setup_state();
    let snapshot = AccessSnapshot {
        status: SubscriptionStatus::Active,
        expires_at: OffsetDateTime::now_utc() + Duration::days(3),
        features: vec![],
    };
    let token = token(&state, Uuid::new_v4(), ROLE_OWNER, Some(snapshot));

    let response = gated_router(&state, None)
        .oneshot(get_request("/protected", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_stale_snapshot_falls_back_to_ledger() {
    let state = setup_state();
    let company = Uuid::new_v4();
    activate(&state, company, "basic").await;
    // Issued before the renewal was paid
    let snapshot = AccessSnapshot {
        status: SubscriptionStatus::Active,
        expires_at: OffsetDateTime::now_utc() - Duration::days(1),
        features: vec![],
    };
    let token = token(&state, company, ROLE_OWNER, Some(snapshot));

    let response = gated_router(&state, None)
        .oneshot(get_request("/protected", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_feature_outside_plan_is_forbidden() {
    let state = setup_state();
    let company = Uuid::new_v4();
    activate(&state, company, "basic").await;
    let token = token(&state, company, ROLE_OWNER, None);

    let denied = gated_router(&state, Some("payroll"))
        .oneshot(get_request("/protected", Some(&token)))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let allowed = gated_router(&state, Some("attendance"))
        .oneshot(get_request("/protected", Some(&token)))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

// =============================================================================
// Roles
// =============================================================================

#[tokio::test]
async fn test_member_cannot_checkout() {
    let state = setup_state();
    let token = token(&state, Uuid::new_v4(), "member", None);
    let app = create_router(state);

    let response = app
        .oneshot(post_json(
            "/api/v1/billing/checkout",
            &token,
            json!({ "plan_id": "basic" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invariants_require_platform_admin() {
    let state = setup_state();
    let owner = token(&state, Uuid::new_v4(), ROLE_OWNER, None);
    let admin = token(&state, Uuid::new_v4(), ROLE_PLATFORM_ADMIN, None);
    let app = create_router(state);

    let denied = app
        .clone()
        .oneshot(get_request("/api/v1/admin/billing/invariants", Some(&owner)))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let allowed = app
        .oneshot(get_request("/api/v1/admin/billing/invariants", Some(&admin)))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    let body = body_json(allowed).await;
    assert_eq!(body["healthy"], true);
}

// =============================================================================
// Checkout and provider callback
// =============================================================================

#[tokio::test]
async fn test_second_checkout_conflicts() {
    let state = setup_state();
    let token = token(&state, Uuid::new_v4(), ROLE_OWNER, None);
    let app = create_router(state);

    let first = app
        .clone()
        .oneshot(post_json(
            "/api/v1/billing/checkout",
            &token,
            json!({ "plan_id": "basic" }),
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(post_json(
            "/api/v1/billing/checkout",
            &token,
            json!({ "plan_id": "pro" }),
        ))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_webhook_with_wrong_token_is_rejected() {
    let state = setup_state();
    let app = create_router(state);

    let body = json!({ "id": "inv_x", "status": "PAID" });
    let missing = app
        .clone()
        .oneshot(webhook_request(None, body.clone()))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .oneshot(webhook_request(Some("not-the-token"), body))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_webhook_malformed_body_is_bad_request() {
    let state = setup_state();
    let app = create_router(state);

    let response = app
        .oneshot(webhook_request(Some(CALLBACK_TOKEN), json!({ "unexpected": true })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_checkout_then_paid_callback_activates() {
    let state = setup_state();
    let company = Uuid::new_v4();
    let token = token(&state, company, ROLE_OWNER, None);
    let app = create_router(state);

    let checkout = app
        .clone()
        .oneshot(post_json(
            "/api/v1/billing/checkout",
            &token,
            json!({ "plan_id": "pro" }),
        ))
        .await
        .unwrap();
    assert_eq!(checkout.status(), StatusCode::OK);
    let invoice = body_json(checkout).await;
    assert_eq!(invoice["status"], "pending");

    let callback = json!({
        "id": invoice["provider_invoice_id"],
        "external_id": invoice["id"],
        "status": "PAID",
        "payment_method": "BANK_TRANSFER",
    });
    let paid = app
        .clone()
        .oneshot(webhook_request(Some(CALLBACK_TOKEN), callback.clone()))
        .await
        .unwrap();
    assert_eq!(paid.status(), StatusCode::OK);
    assert_eq!(body_json(paid).await["status"], "applied");

    // Provider redelivery
    let again = app
        .clone()
        .oneshot(webhook_request(Some(CALLBACK_TOKEN), callback))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(body_json(again).await["status"], "already_processed");

    let view = app
        .clone()
        .oneshot(get_request("/api/v1/billing/subscription", Some(&token)))
        .await
        .unwrap();
    assert_eq!(view.status(), StatusCode::OK);
    let view = body_json(view).await;
    assert_eq!(view["subscription"]["status"], "active");
    assert_eq!(view["plan"]["id"], "pro");

    let feature = app
        .oneshot(get_request("/api/v1/billing/features/payroll", Some(&token)))
        .await
        .unwrap();
    assert_eq!(body_json(feature).await["included"], true);
}

#[tokio::test]
async fn test_unknown_invoice_route_is_not_found() {
    let state = setup_state();
    let token = token(&state, Uuid::new_v4(), ROLE_OWNER, None);
    let app = create_router(state);

    let uri = format!("/api/v1/billing/invoices/{}", Uuid::new_v4());
    let response = app.oneshot(get_request(&uri, Some(&token))).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
