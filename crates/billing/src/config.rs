//! Billing configuration loaded from the environment

use std::str::FromStr;

use time::Duration;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_PERIOD_DAYS: i64 = 30;
pub const DEFAULT_TRIAL_DAYS: i64 = 14;
/// How long a past_due subscription keeps access before it expires
pub const DEFAULT_GRACE_PERIOD_DAYS: i64 = 7;
/// Pending invoices older than this are expired by the sweep
pub const DEFAULT_INVOICE_TTL_HOURS: i64 = 24;
pub const DEFAULT_RECORD_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Shared secret the provider sends in `X-Callback-Token`
    pub callback_token: String,
    /// Base URL of the payment provider API
    pub provider_url: String,
    /// Secret API key for the payment provider
    pub provider_secret_key: String,
    /// Where the hosted invoice page redirects after payment
    pub success_redirect_url: Option<String>,
    pub period: Duration,
    pub trial: Duration,
    pub grace_period: Duration,
    pub invoice_ttl: Duration,
    /// Upper bound on the time one subscription may take inside a sweep step
    pub record_timeout: std::time::Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            callback_token: String::new(),
            provider_url: String::new(),
            provider_secret_key: String::new(),
            success_redirect_url: None,
            period: Duration::days(DEFAULT_PERIOD_DAYS),
            trial: Duration::days(DEFAULT_TRIAL_DAYS),
            grace_period: Duration::days(DEFAULT_GRACE_PERIOD_DAYS),
            invoice_ttl: Duration::hours(DEFAULT_INVOICE_TTL_HOURS),
            record_timeout: std::time::Duration::from_secs(DEFAULT_RECORD_TIMEOUT_SECS),
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let callback_token = std::env::var("PAYMENT_CALLBACK_TOKEN")
            .map_err(|_| BillingError::Config("PAYMENT_CALLBACK_TOKEN not set".to_string()))?;
        if callback_token.trim().is_empty() {
            return Err(BillingError::Config(
                "PAYMENT_CALLBACK_TOKEN must not be empty".to_string(),
            ));
        }

        let provider_secret_key = std::env::var("PAYMENT_PROVIDER_SECRET_KEY").map_err(|_| {
            BillingError::Config("PAYMENT_PROVIDER_SECRET_KEY not set".to_string())
        })?;

        let provider_url = std::env::var("PAYMENT_PROVIDER_URL")
            .unwrap_or_else(|_| "https://api.xendit.co".to_string());

        Ok(Self {
            callback_token,
            provider_url,
            provider_secret_key,
            success_redirect_url: std::env::var("INVOICE_SUCCESS_REDIRECT_URL").ok(),
            period: Duration::days(env_or("BILLING_PERIOD_DAYS", DEFAULT_PERIOD_DAYS)?),
            trial: Duration::days(env_or("BILLING_TRIAL_DAYS", DEFAULT_TRIAL_DAYS)?),
            grace_period: Duration::days(env_or(
                "BILLING_GRACE_PERIOD_DAYS",
                DEFAULT_GRACE_PERIOD_DAYS,
            )?),
            invoice_ttl: Duration::hours(env_or("INVOICE_TTL_HOURS", DEFAULT_INVOICE_TTL_HOURS)?),
            record_timeout: std::time::Duration::from_secs(env_or(
                "SWEEP_RECORD_TIMEOUT_SECS",
                DEFAULT_RECORD_TIMEOUT_SECS,
            )?),
        })
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.period, Duration::days(30));
        assert_eq!(config.grace_period, Duration::days(7));
        assert_eq!(config.invoice_ttl, Duration::hours(24));
        assert!(config.callback_token.is_empty());
    }

    #[test]
    fn test_env_or_falls_back_when_unset() {
        let value: i64 = env_or("HRCORE_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
