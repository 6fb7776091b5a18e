//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hrcore_billing::BillingError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("Internal server error")]
    Internal,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Conflict(_)
            | BillingError::DuplicatePendingInvoice { .. }
            | BillingError::ConcurrentModification(_) => ApiError::Conflict(e.to_string()),
            BillingError::InvalidPlanChange(_) | BillingError::InvalidInput(_) => {
                ApiError::Validation(e.to_string())
            }
            BillingError::FeatureNotIncluded(_)
            | BillingError::SeatLimitExceeded { .. }
            | BillingError::SubscriptionInactive(_) => ApiError::Forbidden(e.to_string()),
            BillingError::WebhookTokenInvalid => ApiError::Unauthorized,
            BillingError::ProviderRejected(_) => ApiError::Validation(e.to_string()),
            BillingError::Database(_) | BillingError::Provider(_) | BillingError::Timeout(_) => {
                tracing::error!(error = %e, "Transient billing failure");
                ApiError::ServiceUnavailable("Temporarily unavailable, please retry".to_string())
            }
            BillingError::Config(_) | BillingError::Internal(_) => {
                tracing::error!(error = %e, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16()
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_billing_errors_map_to_taxonomy() {
        let cases = [
            (BillingError::NotFound("plan".into()), StatusCode::NOT_FOUND),
            (
                BillingError::DuplicatePendingInvoice {
                    company_id: Uuid::new_v4(),
                },
                StatusCode::CONFLICT,
            ),
            (
                BillingError::InvalidPlanChange("same plan".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::SeatLimitExceeded {
                    active: 6,
                    max_seats: 5,
                },
                StatusCode::FORBIDDEN,
            ),
            (BillingError::WebhookTokenInvalid, StatusCode::UNAUTHORIZED),
            (
                BillingError::Database("reset".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (BillingError::Internal("bad row".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let err = ApiError::from(BillingError::Database("password=hunter2".into()));
        assert!(!err.to_string().contains("hunter2"));
    }
}
