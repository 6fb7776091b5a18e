//! Authentication and subscription middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use hrcore_billing::AccessSnapshot;
use serde_json::json;
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::error::ApiError;
use crate::state::AppState;

pub const ROLE_OWNER: &str = "owner";
pub const ROLE_PLATFORM_ADMIN: &str = "platform_admin";

/// Authenticated user extracted from the access token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub role: String,
    pub subscription: Option<AccessSnapshot>,
}

impl AuthUser {
    /// Billing changes are reserved for the company owner
    pub fn require_owner(&self) -> Result<(), AuthError> {
        if self.role == ROLE_OWNER {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions)
        }
    }

    pub fn require_platform_admin(&self) -> Result<(), AuthError> {
        if self.role == ROLE_PLATFORM_ADMIN {
            Ok(())
        } else {
            tracing::warn!(
                user_id = %self.user_id,
                role = %self.role,
                "Unauthorized admin access attempt"
            );
            Err(AuthError::InsufficientPermissions)
        }
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .find_map(|c| c.trim().strip_prefix("hrcore_auth_token="))
                .map(String::from)
        })
}

/// Bearer token from the Authorization header, falling back to the auth cookie
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    extract_token_from_cookie(request)
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no token in header or cookie");
        return AuthError::MissingAuth.into_response();
    };

    match auth_state.jwt_manager.validate_access_token(&token) {
        Ok(claims) => {
            let auth_user = AuthUser {
                user_id: claims.sub,
                company_id: claims.company_id,
                role: claims.role,
                subscription: claims.subscription,
            };
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                company_id = %auth_user.company_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Requires a usable subscription. The token's snapshot is tried first and
/// the ledger decides whenever the snapshot cannot allow the request.
/// Must run after [`require_auth`].
pub async fn require_active_subscription(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>().cloned() else {
        return AuthError::MissingAuth.into_response();
    };

    match state
        .billing
        .access
        .require_active_subscription(auth_user.company_id, auth_user.subscription.as_ref())
        .await
    {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Requires the company's plan to include `feature`. Same two-tier check as
/// [`require_active_subscription`].
pub async fn require_feature(
    feature: &'static str,
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>().cloned() else {
        return AuthError::MissingAuth.into_response();
    };

    match state
        .billing
        .access
        .require_feature(
            auth_user.company_id,
            feature,
            auth_user.subscription.as_ref(),
        )
        .await
    {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingAuth | AuthError::InvalidToken => ApiError::Unauthorized,
            AuthError::InsufficientPermissions => {
                ApiError::Forbidden("Insufficient permissions".to_string())
            }
            AuthError::Internal(_) => ApiError::Internal,
        }
    }
}
