// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Transition recording carries full audit context
#![allow(clippy::result_large_err)] // BillingError variants carry diagnostic strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! subsync billing engine
//!
//! Subscription lifecycle and billing synchronization against an external
//! payment provider.
//!
//! ## Features
//!
//! - **Lifecycle**: a fixed transition table over seven statuses; every
//!   accepted transition is applied atomically and recorded in history
//! - **Payments**: bounded-retry charging with per-period double-charge
//!   protection and a scheduled recovery sweep for failed payments
//! - **Trials**: extension, conversion to paid, and expiration sweeps
//! - **Webhooks**: signature-verified ingestion with a durable idempotency
//!   ledger; duplicate and out-of-order events are acknowledged, not re-applied
//! - **Invariants**: runnable consistency checks over the billing tables

pub mod config;
pub mod error;
pub mod history;
pub mod invariants;
pub mod ledger;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod payments;
pub mod provider;
pub mod response;
pub mod subscriptions;
pub mod trials;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Config
pub use config::ProviderConfig;

// Error
pub use error::{BillingError, BillingResult};

// Response
pub use response::{status_code_for, ServiceResponse};

// Model
pub use model::{fetch_subscription, BillingRecord, Subscription};

// Lifecycle
pub use lifecycle::{permitted_transition, LifecycleService, TransitionContext, Trigger};

// History
pub use history::{Actor, StatusHistoryEntry, StatusHistoryRecorder};

// Ledger
pub use ledger::{ClaimResult, IdempotencyLedger, ProcessedEvent, ProcessingOutcome};

// Provider
pub use provider::{
    ChargeOutcome, ChargeRequest, CreateRemoteSubscriptionRequest, HttpProviderClient,
    MockChargeOutcome, MockProviderClient, ProviderClient, ProviderError, ProviderResult,
    RemoteSubscription,
};

// Notify
pub use notify::{LogNotifier, Notifier};

// Payments
pub use payments::{PaymentOutcome, PaymentRequest, PaymentService, RecoveryOutcome};

// Trials
pub use trials::TrialService;

// Subscriptions
pub use subscriptions::{CreateSubscriptionRequest, SubscriptionService};

// Webhooks
pub use webhooks::{verify_signature, WebhookEnvelope, WebhookHandler, WebhookOutcome, WebhookReceipt};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all engine functionality
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub payments: PaymentService,
    pub trials: TrialService,
    pub lifecycle: LifecycleService,
    pub webhooks: WebhookHandler,
    pub ledger: IdempotencyLedger,
    pub history: StatusHistoryRecorder,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = ProviderConfig::from_env()?;
        let provider: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::new(config.clone()));
        Ok(Self::with_provider(pool, provider, Arc::new(LogNotifier), config))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: ProviderConfig, pool: PgPool) -> Self {
        let provider: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::new(config.clone()));
        Self::with_provider(pool, provider, Arc::new(LogNotifier), config)
    }

    /// Create a billing service over explicit collaborators. Tests inject
    /// [`MockProviderClient`] here.
    pub fn with_provider(
        pool: PgPool,
        provider: Arc<dyn ProviderClient>,
        notifier: Arc<dyn Notifier>,
        config: ProviderConfig,
    ) -> Self {
        let payments = PaymentService::new(
            pool.clone(),
            provider.clone(),
            notifier.clone(),
            config.clone(),
        );

        Self {
            subscriptions: SubscriptionService::new(pool.clone(), provider.clone(), notifier.clone()),
            trials: TrialService::new(pool.clone(), payments.clone()),
            payments,
            lifecycle: LifecycleService::new(pool.clone()),
            webhooks: WebhookHandler::new(pool.clone(), notifier, config),
            ledger: IdempotencyLedger::new(pool.clone()),
            history: StatusHistoryRecorder::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
        }
    }
}
