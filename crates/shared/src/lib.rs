#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! HRCore shared primitives
//!
//! Types and database helpers used by the API server, the billing core and the worker.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{InvoicePurpose, InvoiceStatus, ParseEnumError, SubscriptionStatus};
