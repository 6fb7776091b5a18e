//! Payment provider callback endpoint
//!
//! Only a bad token, a malformed body or a transient failure produce a non-200
//! response. Unknown or already settled invoices are acknowledged so the
//! provider stops retrying.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hrcore_billing::WebhookOutcome;
use serde_json::json;

use crate::{error::ApiError, state::AppState};

pub const CALLBACK_TOKEN_HEADER: &str = "x-callback-token";

fn outcome_status(outcome: &WebhookOutcome) -> &'static str {
    match outcome {
        WebhookOutcome::Applied { .. } => "applied",
        WebhookOutcome::Expired { .. } => "expired",
        WebhookOutcome::UnknownInvoice => "unknown_invoice",
        WebhookOutcome::AlreadyProcessed { .. } => "already_processed",
        WebhookOutcome::Ignored => "ignored",
    }
}

pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers
        .get(CALLBACK_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    match state.billing.webhooks.handle(token, &body).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "received": true, "status": outcome_status(&outcome) })),
        )
            .into_response(),
        Err(e) if e.is_transient() => {
            tracing::error!(error = %e, "Webhook processing failed, provider will retry");
            ApiError::ServiceUnavailable("Temporarily unavailable".to_string()).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
