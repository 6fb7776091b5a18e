//! Authentication module for HRCore

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtManager};
pub use middleware::{
    require_active_subscription, require_auth, require_feature, AuthError, AuthState, AuthUser,
    ROLE_OWNER, ROLE_PLATFORM_ADMIN,
};
