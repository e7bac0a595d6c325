//! Payment provider client abstraction
//!
//! The provider is the system of record for money movement; the engine only
//! talks to it through this port. Two implementations ship here: an HTTP
//! adapter for the real provider API, and a configurable mock for tests.
//! All calls are safe to retry from the caller's side; the provider
//! deduplicates charges by payment-intent semantics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::ProviderConfig;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Provider-side failure, split by whether a retry can help.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Timeout, 5xx, or rate limit; retrying with backoff may succeed
    #[error("provider unavailable: {0}")]
    Transient(String),
    /// Permanent rejection (declined card, invalid method); never retried
    #[error("provider rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<ProviderError> for crate::error::BillingError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => crate::error::BillingError::ProviderUnavailable(msg),
            ProviderError::Rejected(msg) => crate::error::BillingError::ProviderRejected(msg),
        }
    }
}

/// Request to charge a payment method.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub payment_method_id: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Correlates retries of the same logical charge on the provider side
    pub idempotency_key: String,
}

/// Outcome of a successful charge call.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeOutcome {
    pub status: String,
    pub provider_payment_intent_id: String,
}

/// Remote subscription state as reported by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub status: String,
    pub current_period_end: Option<OffsetDateTime>,
}

/// Parameters for creating a remote subscription.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRemoteSubscriptionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub trial_days: Option<i64>,
}

/// Port to the external payment provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn create_customer(&self, user_email: &str) -> ProviderResult<String>;

    async fn create_remote_subscription(
        &self,
        req: CreateRemoteSubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription>;

    async fn charge_payment(&self, req: ChargeRequest) -> ProviderResult<ChargeOutcome>;

    async fn validate_payment_method(&self, payment_method_id: &str) -> ProviderResult<()>;

    async fn get_remote_subscription(&self, id: &str) -> ProviderResult<RemoteSubscription>;

    async fn cancel_remote_subscription(&self, id: &str) -> ProviderResult<()>;

    async fn pause_remote_subscription(&self, id: &str) -> ProviderResult<()>;

    async fn resume_remote_subscription(&self, id: &str) -> ProviderResult<()>;
}

/// HTTP adapter for the provider's REST API.
///
/// Bearer auth with the configured secret key; every call runs under the
/// configured request timeout. Timeouts and 5xx/429 responses surface as
/// [`ProviderError::Transient`], 4xx as [`ProviderError::Rejected`].
pub struct HttpProviderClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> ProviderResult<T> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ProviderError::Transient(e.to_string())
                } else {
                    ProviderError::Rejected(e.to_string())
                }
            })?;

        Self::decode(response).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> ProviderResult<T> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ProviderError::Transient(e.to_string())
                } else {
                    ProviderError::Rejected(e.to_string())
                }
            })?;

        Self::decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> ProviderResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ProviderError::Rejected(format!("malformed provider response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(ProviderError::Transient(format!(
                "provider returned {status}: {body}"
            )))
        } else {
            Err(ProviderError::Rejected(format!(
                "provider returned {status}: {body}"
            )))
        }
    }
}

#[derive(Deserialize)]
struct CustomerResponse {
    id: String,
}

#[derive(Serialize)]
struct EmptyBody {}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn create_customer(&self, user_email: &str) -> ProviderResult<String> {
        let body = serde_json::json!({ "email": user_email });
        let customer: CustomerResponse = self.post_json("customers", &body).await?;
        Ok(customer.id)
    }

    async fn create_remote_subscription(
        &self,
        req: CreateRemoteSubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        self.post_json("subscriptions", &req).await
    }

    async fn charge_payment(&self, req: ChargeRequest) -> ProviderResult<ChargeOutcome> {
        self.post_json("charges", &req).await
    }

    async fn validate_payment_method(&self, payment_method_id: &str) -> ProviderResult<()> {
        let _: serde_json::Value = self
            .get_json(&format!("payment_methods/{payment_method_id}"))
            .await?;
        Ok(())
    }

    async fn get_remote_subscription(&self, id: &str) -> ProviderResult<RemoteSubscription> {
        self.get_json(&format!("subscriptions/{id}")).await
    }

    async fn cancel_remote_subscription(&self, id: &str) -> ProviderResult<()> {
        let _: serde_json::Value = self
            .post_json(&format!("subscriptions/{id}/cancel"), &EmptyBody {})
            .await?;
        Ok(())
    }

    async fn pause_remote_subscription(&self, id: &str) -> ProviderResult<()> {
        let _: serde_json::Value = self
            .post_json(&format!("subscriptions/{id}/pause"), &EmptyBody {})
            .await?;
        Ok(())
    }

    async fn resume_remote_subscription(&self, id: &str) -> ProviderResult<()> {
        let _: serde_json::Value = self
            .post_json(&format!("subscriptions/{id}/resume"), &EmptyBody {})
            .await?;
        Ok(())
    }
}

/// A scripted charge outcome for the mock provider.
#[derive(Debug, Clone)]
pub enum MockChargeOutcome {
    Success { payment_intent_id: String },
    Transient { message: String },
    Rejected { message: String },
}

/// Mock provider for tests.
///
/// Charge outcomes are consumed in order; once the script is exhausted every
/// charge succeeds. All calls are recorded for verification.
#[derive(Clone, Default)]
pub struct MockProviderClient {
    charge_script: Arc<Mutex<VecDeque<MockChargeOutcome>>>,
    charges: Arc<Mutex<Vec<ChargeRequest>>>,
    invalid_payment_methods: Arc<Mutex<Vec<String>>>,
}

impl MockProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_charge_outcomes(self, outcomes: Vec<MockChargeOutcome>) -> Self {
        lock(&self.charge_script).extend(outcomes);
        self
    }

    pub fn with_invalid_payment_method(self, payment_method_id: &str) -> Self {
        lock(&self.invalid_payment_methods).push(payment_method_id.to_string());
        self
    }

    /// Charge calls made so far, for assertions.
    pub fn charge_calls(&self) -> Vec<ChargeRequest> {
        lock(&self.charges).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn create_customer(&self, _user_email: &str) -> ProviderResult<String> {
        Ok(format!("cus_mock_{}", uuid::Uuid::new_v4().simple()))
    }

    async fn create_remote_subscription(
        &self,
        req: CreateRemoteSubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        Ok(RemoteSubscription {
            id: format!("sub_mock_{}", uuid::Uuid::new_v4().simple()),
            status: if req.trial_days.unwrap_or(0) > 0 {
                "trialing".to_string()
            } else {
                "active".to_string()
            },
            current_period_end: None,
        })
    }

    async fn charge_payment(&self, req: ChargeRequest) -> ProviderResult<ChargeOutcome> {
        lock(&self.charges).push(req);

        let scripted = lock(&self.charge_script).pop_front();
        match scripted {
            Some(MockChargeOutcome::Success { payment_intent_id }) => Ok(ChargeOutcome {
                status: "succeeded".to_string(),
                provider_payment_intent_id: payment_intent_id,
            }),
            Some(MockChargeOutcome::Transient { message }) => {
                Err(ProviderError::Transient(message))
            }
            Some(MockChargeOutcome::Rejected { message }) => Err(ProviderError::Rejected(message)),
            None => Ok(ChargeOutcome {
                status: "succeeded".to_string(),
                provider_payment_intent_id: format!("pi_mock_{}", uuid::Uuid::new_v4().simple()),
            }),
        }
    }

    async fn validate_payment_method(&self, payment_method_id: &str) -> ProviderResult<()> {
        let invalid = lock(&self.invalid_payment_methods).contains(&payment_method_id.to_string());
        if invalid {
            Err(ProviderError::Rejected(format!(
                "unknown payment method {payment_method_id}"
            )))
        } else {
            Ok(())
        }
    }

    async fn get_remote_subscription(&self, id: &str) -> ProviderResult<RemoteSubscription> {
        Ok(RemoteSubscription {
            id: id.to_string(),
            status: "active".to_string(),
            current_period_end: None,
        })
    }

    async fn cancel_remote_subscription(&self, _id: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn pause_remote_subscription(&self, _id: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn resume_remote_subscription(&self, _id: &str) -> ProviderResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_consumes_scripted_outcomes_in_order() {
        let provider = MockProviderClient::new().with_charge_outcomes(vec![
            MockChargeOutcome::Transient {
                message: "timeout".to_string(),
            },
            MockChargeOutcome::Success {
                payment_intent_id: "pi_1".to_string(),
            },
        ]);

        let req = ChargeRequest {
            payment_method_id: "pm_1".to_string(),
            amount_cents: 2900,
            currency: "usd".to_string(),
            idempotency_key: "key_1".to_string(),
        };

        let first = provider.charge_payment(req.clone()).await;
        assert!(matches!(first, Err(ProviderError::Transient(_))));

        let second = provider.charge_payment(req).await;
        assert_eq!(
            second.map(|o| o.provider_payment_intent_id).ok(),
            Some("pi_1".to_string())
        );

        assert_eq!(provider.charge_calls().len(), 2);
    }

    #[tokio::test]
    async fn mock_rejects_configured_payment_methods() {
        let provider = MockProviderClient::new().with_invalid_payment_method("pm_bad");
        assert!(provider.validate_payment_method("pm_good").await.is_ok());
        let err = provider.validate_payment_method("pm_bad").await;
        assert!(matches!(err, Err(ProviderError::Rejected(_))));
    }
}
