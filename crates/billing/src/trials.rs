//! Trial management
//!
//! Extensions, conversion to paid, and the expiration sweep. A trial's
//! price is fixed on the subscription row at creation, so conversion only
//! needs to charge it; the successful charge is what moves the
//! subscription to Active.

use sqlx::PgPool;
use subsync_shared::SubscriptionStatus;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::history::{Actor, StatusHistoryRecorder};
use crate::lifecycle::{LifecycleService, TransitionContext, Trigger};
use crate::model::{fetch_subscription, fetch_subscription_for_update, Subscription};
use crate::payments::{PaymentOutcome, PaymentRequest, PaymentService};

/// New trial-end and next-billing dates after an extension.
pub fn extended_trial_dates(
    trial_end: OffsetDateTime,
    next_billing_date: Option<OffsetDateTime>,
    extra_days: i64,
) -> (OffsetDateTime, OffsetDateTime) {
    let shift = Duration::days(extra_days);
    let new_trial_end = trial_end + shift;
    // Billing follows the trial: never bill before the extended trial ends
    let new_next_billing = match next_billing_date {
        Some(date) => (date + shift).max(new_trial_end),
        None => new_trial_end,
    };
    (new_trial_end, new_next_billing)
}

pub struct TrialService {
    pool: PgPool,
    payments: PaymentService,
}

impl TrialService {
    pub fn new(pool: PgPool, payments: PaymentService) -> Self {
        Self { pool, payments }
    }

    /// Push a trial's end date out by `extra_days`.
    ///
    /// Only a `trial_active` subscription can be extended; the next billing
    /// date moves with the trial end. The extension is recorded in the
    /// status history even though the status itself does not change.
    pub async fn extend_trial(
        &self,
        subscription_id: Uuid,
        extra_days: i64,
        reason: &str,
    ) -> BillingResult<Subscription> {
        if extra_days <= 0 {
            return Err(BillingError::Validation(
                "trial extension must add at least one day".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "trial extension requires a reason".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let sub = fetch_subscription_for_update(&mut tx, subscription_id).await?;

        if sub.status != SubscriptionStatus::TrialActive {
            return Err(BillingError::Validation(format!(
                "only trial_active subscriptions can be extended, {} is {}",
                subscription_id, sub.status
            )));
        }
        let trial_end = sub.trial_end.ok_or_else(|| {
            BillingError::Internal(format!(
                "trial_active subscription {} has no trial end date",
                subscription_id
            ))
        })?;

        let (new_trial_end, new_next_billing) =
            extended_trial_dates(trial_end, sub.next_billing_date, extra_days);

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions SET
                trial_end = $1,
                next_billing_date = $2,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(new_trial_end)
        .bind(new_next_billing)
        .bind(subscription_id)
        .bind(sub.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} changed during trial extension",
                subscription_id
            )));
        }

        StatusHistoryRecorder::record_in_tx(
            &mut tx,
            subscription_id,
            Some(sub.status),
            sub.status,
            Actor::Admin,
            Some(reason),
            serde_json::json!({
                "extended_days": extra_days,
                "new_trial_end": new_trial_end.unix_timestamp(),
            }),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            extra_days = extra_days,
            new_trial_end = %new_trial_end,
            "Trial extended"
        );

        let mut sub = sub;
        sub.trial_end = Some(new_trial_end);
        sub.next_billing_date = Some(new_next_billing);
        sub.version += 1;
        Ok(sub)
    }

    /// Convert a trial to a paying subscription by charging the stored
    /// price. The subscription becomes Active only when the charge
    /// succeeds; a failed charge leaves it in its trial status with the
    /// failure recorded.
    pub async fn convert_trial(
        &self,
        subscription_id: Uuid,
        request: PaymentRequest,
    ) -> BillingResult<PaymentOutcome> {
        let sub = fetch_subscription(&self.pool, subscription_id).await?;

        match sub.status {
            SubscriptionStatus::TrialActive | SubscriptionStatus::TrialExpired => {}
            from => {
                return Err(BillingError::InvalidTransition {
                    from: from.as_str().to_string(),
                    trigger: Trigger::ConvertTrial.as_str().to_string(),
                })
            }
        }

        // process_payment re-validates under the row lock; this check just
        // gives conversion its own error shape before any provider call
        self.payments.process_payment(subscription_id, request).await
    }

    /// Move every trial past its end date to `trial_expired`.
    ///
    /// Each expiry runs in its own transaction so one contended row never
    /// stalls the sweep. Returns the ids that expired.
    pub async fn run_expiration_sweep(&self) -> BillingResult<Vec<Uuid>> {
        let due: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM subscriptions
            WHERE status = 'trial_active' AND trial_end IS NOT NULL AND trial_end < NOW()
            ORDER BY trial_end ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        tracing::info!(candidates = due.len(), "Trial expiration sweep starting");

        let lifecycle = LifecycleService::new(self.pool.clone());
        let mut expired = Vec::new();

        for (subscription_id,) in due {
            let ctx = TransitionContext::system();
            match lifecycle
                .apply_transition(subscription_id, Trigger::ExpireTrial, ctx)
                .await
            {
                Ok(_) => expired.push(subscription_id),
                // Converted, cancelled, or extended since the select
                Err(BillingError::InvalidTransition { from, .. }) => {
                    tracing::info!(
                        subscription_id = %subscription_id,
                        current_status = %from,
                        "Trial no longer expirable; skipped"
                    );
                }
                Err(BillingError::ConcurrentModification(_)) => {
                    tracing::info!(
                        subscription_id = %subscription_id,
                        "Trial row contended during sweep; next run retries"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Trial expiration failed; next run retries"
                    );
                }
            }
        }

        tracing::info!(expired = expired.len(), "Trial expiration sweep finished");
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn extension_moves_trial_end_and_billing_together() {
        let trial_end = datetime!(2026-03-01 00:00 UTC);
        let next_billing = Some(datetime!(2026-03-01 00:00 UTC));
        let (new_end, new_billing) = extended_trial_dates(trial_end, next_billing, 7);
        assert_eq!(new_end, datetime!(2026-03-08 00:00 UTC));
        assert_eq!(new_billing, datetime!(2026-03-08 00:00 UTC));
    }

    #[test]
    fn extension_never_bills_before_trial_ends() {
        // Billing date drifted earlier than the trial end; extension pulls
        // it up to the new end rather than leaving it inside the trial
        let trial_end = datetime!(2026-03-10 00:00 UTC);
        let next_billing = Some(datetime!(2026-03-05 00:00 UTC));
        let (new_end, new_billing) = extended_trial_dates(trial_end, next_billing, 3);
        assert_eq!(new_end, datetime!(2026-03-13 00:00 UTC));
        assert_eq!(new_billing, new_end);
    }

    #[test]
    fn extension_without_billing_date_uses_trial_end() {
        let trial_end = datetime!(2026-03-01 00:00 UTC);
        let (new_end, new_billing) = extended_trial_dates(trial_end, None, 14);
        assert_eq!(new_billing, new_end);
    }
}
