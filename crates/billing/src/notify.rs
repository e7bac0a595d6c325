//! Notification collaborator boundary
//!
//! Fire-and-forget signals about subscription state changes and payment
//! failures. Dispatch happens on a spawned task after the billing
//! transaction commits; a failing notifier can never roll billing state
//! back.

use std::sync::Arc;

use async_trait::async_trait;
use subsync_shared::SubscriptionStatus;
use uuid::Uuid;

/// Outbound notification port. Implementations deliver email/SMS/etc.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn subscription_state_changed(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        new_status: SubscriptionStatus,
    ) -> Result<(), String>;

    async fn payment_failed(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        attempts: i32,
        error: &str,
    ) -> Result<(), String>;
}

/// Default notifier: logs the signal and succeeds.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn subscription_state_changed(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        new_status: SubscriptionStatus,
    ) -> Result<(), String> {
        tracing::info!(
            subscription_id = %subscription_id,
            user_id = %user_id,
            new_status = %new_status,
            "Notification: subscription state changed"
        );
        Ok(())
    }

    async fn payment_failed(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        attempts: i32,
        error: &str,
    ) -> Result<(), String> {
        tracing::info!(
            subscription_id = %subscription_id,
            user_id = %user_id,
            attempts = attempts,
            error = %error,
            "Notification: payment failed"
        );
        Ok(())
    }
}

/// Dispatch a state-change signal without blocking the caller.
pub fn dispatch_state_changed(
    notifier: Arc<dyn Notifier>,
    subscription_id: Uuid,
    user_id: Uuid,
    new_status: SubscriptionStatus,
) {
    tokio::spawn(async move {
        if let Err(e) = notifier
            .subscription_state_changed(subscription_id, user_id, new_status)
            .await
        {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "State-change notification failed"
            );
        }
    });
}

/// Dispatch a payment-failed signal without blocking the caller.
pub fn dispatch_payment_failed(
    notifier: Arc<dyn Notifier>,
    subscription_id: Uuid,
    user_id: Uuid,
    attempts: i32,
    error: String,
) {
    tokio::spawn(async move {
        if let Err(e) = notifier
            .payment_failed(subscription_id, user_id, attempts, &error)
            .await
        {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "Payment-failed notification failed"
            );
        }
    });
}
