//! Engine configuration
//!
//! Loaded once from environment variables at startup, the way the worker
//! binary expects. Sensible defaults for every tunable except credentials.

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Payment provider and recovery policy configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the provider API
    pub api_base: String,
    /// Secret API key (bearer auth)
    pub secret_key: String,
    /// Shared secret for webhook signature verification
    pub webhook_secret: String,
    /// Per-call timeout for provider HTTP requests
    pub request_timeout: Duration,
    /// Max charge attempts within a single process_payment call
    pub max_charge_attempts: usize,
    /// Base delay for exponential backoff between charge attempts
    pub retry_base_delay: Duration,
    /// Minimum hours between recovery sweep re-charges of a failed subscription
    pub recovery_backoff_hours: i64,
    /// Days a subscription may sit in payment_failed before it is cancelled
    pub recovery_grace_days: i64,
    /// Tolerance for webhook signature timestamps, in seconds
    pub webhook_timestamp_tolerance_secs: i64,
}

impl ProviderConfig {
    /// Load configuration from environment variables.
    ///
    /// `PROVIDER_SECRET_KEY` and `PROVIDER_WEBHOOK_SECRET` are required;
    /// everything else has defaults.
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("PROVIDER_SECRET_KEY")
            .map_err(|_| BillingError::Config("PROVIDER_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("PROVIDER_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("PROVIDER_WEBHOOK_SECRET not set".to_string()))?;

        let api_base = std::env::var("PROVIDER_API_BASE")
            .unwrap_or_else(|_| "https://api.payments.example.com/v1".to_string());

        Ok(Self {
            api_base,
            secret_key,
            webhook_secret,
            request_timeout: Duration::from_secs(env_u64("PROVIDER_TIMEOUT_SECS", 30)),
            max_charge_attempts: env_u64("PAYMENT_MAX_CHARGE_ATTEMPTS", 3) as usize,
            retry_base_delay: Duration::from_millis(env_u64("PAYMENT_RETRY_BASE_DELAY_MS", 500)),
            recovery_backoff_hours: env_u64("PAYMENT_RECOVERY_BACKOFF_HOURS", 24) as i64,
            recovery_grace_days: env_u64("PAYMENT_RECOVERY_GRACE_DAYS", 14) as i64,
            webhook_timestamp_tolerance_secs: env_u64("WEBHOOK_TIMESTAMP_TOLERANCE_SECS", 300)
                as i64,
        })
    }

    /// Configuration suitable for tests: no credentials, tight timings.
    pub fn for_tests() -> Self {
        Self {
            api_base: "http://localhost:0".to_string(),
            secret_key: "sk_test_dummy".to_string(),
            webhook_secret: "whsec_test_secret".to_string(),
            request_timeout: Duration::from_millis(100),
            max_charge_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            recovery_backoff_hours: 24,
            recovery_grace_days: 14,
            webhook_timestamp_tolerance_secs: 300,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_has_bounded_retries() {
        let config = ProviderConfig::for_tests();
        assert!(config.max_charge_attempts >= 1);
        assert!(config.webhook_timestamp_tolerance_secs > 0);
    }
}
