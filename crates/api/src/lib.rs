// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps billing errors by value
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! HRCore API Library
//!
//! HTTP surface of the billing core: subscription and invoice endpoints for
//! company owners, the payment provider callback and the admin invariant check.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
