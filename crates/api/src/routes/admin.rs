//! Platform admin routes

use axum::{
    extract::{Extension, State},
    Json,
};
use hrcore_billing::InvariantCheckSummary;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Run all billing invariant checks
///
/// - At most one pending invoice per company
/// - Pending plan changes are never upgrades
/// - Paid invoices have a payment time
/// - Pending seat counts are positive
pub async fn check_billing_invariants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    auth_user.require_platform_admin()?;

    let req_id = Uuid::new_v4();
    tracing::info!(
        %req_id,
        admin_id = %auth_user.user_id,
        "Admin checking billing invariants"
    );

    let summary = state.billing.invariants.run_all_checks().await.map_err(|e| {
        tracing::error!(%req_id, error = %e, "Failed to run invariant checks");
        ApiError::Internal
    })?;

    if !summary.healthy {
        tracing::warn!(
            %req_id,
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Billing invariant violations found"
        );
    }
    Ok(Json(summary))
}
