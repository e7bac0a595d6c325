//! Payment execution and recovery engine
//!
//! Charges a subscription against the payment provider and reconciles the
//! result with local state. A pending billing record is claimed before the
//! external call so the attempt is observable even if the process dies
//! mid-charge, and the claim makes concurrent charges for the same billing
//! period mutually exclusive.
//!
//! Transient provider failures are retried with exponential backoff inside
//! one `process_payment` call; longer-horizon recovery across billing
//! cycles is the scheduled sweep re-invoking `process_payment` for
//! subscriptions sitting in `payment_failed`.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use subsync_shared::SubscriptionStatus;
use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{LifecycleService, TransitionContext, Trigger};
use crate::model::{
    fetch_subscription_for_update, BillingRecord, BillingRecordRow, Subscription,
};
use crate::notify::{dispatch_payment_failed, dispatch_state_changed, Notifier};
use crate::provider::{ChargeOutcome, ChargeRequest, ProviderClient, ProviderError};
use crate::response::ServiceResponse;

/// A claim on a pending record goes stale after this long; a crashed charge
/// attempt must not block the period forever.
const CHARGE_CLAIM_TIMEOUT_MINUTES: i32 = 10;

/// Caller's charge request.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payment_method_id: String,
}

/// Result of a `process_payment` call.
#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    /// Charge succeeded; subscription is Active
    Paid { record: BillingRecord },
    /// A paid record already exists for this billing period; no-op
    AlreadyPaid { record: BillingRecord },
    /// Charge failed (rejected, or transient failures exhausted retries)
    Failed {
        record_id: Uuid,
        attempts: i32,
        error: String,
    },
    /// Another call holds the charge claim for this period right now
    InProgress,
}

/// Per-subscription result of one recovery sweep pass.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    Recovered { subscription_id: Uuid },
    StillFailing { subscription_id: Uuid, error: String },
    CancelledAfterGrace { subscription_id: Uuid },
    Skipped { subscription_id: Uuid, reason: String },
}

#[derive(Clone)]
pub struct PaymentService {
    pool: PgPool,
    provider: Arc<dyn ProviderClient>,
    notifier: Arc<dyn Notifier>,
    config: ProviderConfig,
}

impl PaymentService {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn ProviderClient>,
        notifier: Arc<dyn Notifier>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            pool,
            provider,
            notifier,
            config,
        }
    }

    /// Thin-surface entry point: structured response, never a bare error.
    pub async fn handle_payment(
        &self,
        subscription_id: Uuid,
        request: PaymentRequest,
    ) -> ServiceResponse<PaymentOutcome> {
        match self.process_payment(subscription_id, request).await {
            Ok(outcome) => ServiceResponse::ok("payment processed", outcome),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// Execute a charge for one subscription and reconcile the result.
    ///
    /// Returns `Ok` with a [`PaymentOutcome`] for every reconciled result,
    /// including failed charges (the failure is recorded state, not an
    /// error). `Err` is reserved for not-found, validation, and storage
    /// failures.
    pub async fn process_payment(
        &self,
        subscription_id: Uuid,
        request: PaymentRequest,
    ) -> BillingResult<PaymentOutcome> {
        // Phase 1: under the row lock, settle the billing period and claim
        // a pending record. Committed before the provider call so the
        // attempt is observable even if the charge never returns.
        let mut tx = self.pool.begin().await?;
        let sub = fetch_subscription_for_update(&mut tx, subscription_id).await?;

        if sub.status.is_terminal() {
            return Err(BillingError::Validation(format!(
                "cannot charge subscription {} in terminal status {}",
                subscription_id, sub.status
            )));
        }
        if sub.current_price_cents <= 0 {
            return Err(BillingError::Validation(format!(
                "subscription {} has no chargeable amount",
                subscription_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let period_start = sub.next_billing_date.unwrap_or(now);
        let period_end = sub.billing_interval.next_billing_date(period_start);

        if let Some(paid) = Self::find_paid_record(&mut tx, subscription_id, period_start).await? {
            tx.commit().await?;
            tracing::info!(
                subscription_id = %subscription_id,
                record_id = %paid.id,
                "Billing period already paid; process_payment is a no-op"
            );
            return Ok(PaymentOutcome::AlreadyPaid { record: paid });
        }

        let record_id = match Self::claim_pending_record(
            &mut tx,
            &sub,
            period_start,
            period_end,
            now,
        )
        .await?
        {
            Some(id) => id,
            None => {
                tx.commit().await?;
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Charge already in progress for this billing period"
                );
                return Ok(PaymentOutcome::InProgress);
            }
        };
        tx.commit().await?;

        // Phase 2: talk to the provider. No locks held across network I/O.
        let charge_result = self
            .validate_and_charge(&sub, &request, period_start)
            .await;

        // Phase 3: reconcile under a fresh row lock.
        match charge_result {
            Ok(outcome) => {
                let record = self
                    .reconcile_success(&sub, record_id, &request, &outcome)
                    .await?;
                dispatch_state_changed(
                    self.notifier.clone(),
                    sub.id,
                    sub.user_id,
                    SubscriptionStatus::Active,
                );
                Ok(PaymentOutcome::Paid { record })
            }
            Err(provider_err) => {
                let attempts = self
                    .reconcile_failure(&sub, record_id, &provider_err.to_string())
                    .await?;
                dispatch_payment_failed(
                    self.notifier.clone(),
                    sub.id,
                    sub.user_id,
                    attempts,
                    provider_err.to_string(),
                );
                Ok(PaymentOutcome::Failed {
                    record_id,
                    attempts,
                    error: provider_err.to_string(),
                })
            }
        }
    }

    /// Validate the payment method, then charge with bounded retries.
    async fn validate_and_charge(
        &self,
        sub: &Subscription,
        request: &PaymentRequest,
        period_start: OffsetDateTime,
    ) -> Result<ChargeOutcome, ProviderError> {
        self.provider
            .validate_payment_method(&request.payment_method_id)
            .await?;

        let charge = ChargeRequest {
            payment_method_id: request.payment_method_id.clone(),
            amount_cents: sub.current_price_cents,
            currency: sub.currency.clone(),
            // One key per subscription-period, so provider-side dedup holds
            // across engine retries and recovery sweeps
            idempotency_key: format!("{}:{}", sub.id, period_start.unix_timestamp()),
        };

        charge_with_retry(
            self.provider.as_ref(),
            charge,
            self.config.max_charge_attempts,
            self.config.retry_base_delay.as_millis() as u64,
        )
        .await
    }

    async fn reconcile_success(
        &self,
        sub: &Subscription,
        record_id: Uuid,
        request: &PaymentRequest,
        outcome: &ChargeOutcome,
    ) -> BillingResult<BillingRecord> {
        let mut tx = self.pool.begin().await?;

        let row: Option<BillingRecordRow> = sqlx::query_as(
            r#"
            UPDATE billing_records SET
                status = 'paid',
                provider_payment_intent_id = $1,
                transaction_id = $2,
                billing_date = NOW(),
                failure_message = NULL,
                updated_at = NOW()
            WHERE id = $3
            RETURNING id, subscription_id, user_id, amount_cents, currency, status,
                      due_date, billing_date, period_start, period_end,
                      provider_payment_intent_id, provider_invoice_id, transaction_id,
                      failure_message, created_at, updated_at
            "#,
        )
        .bind(&outcome.provider_payment_intent_id)
        .bind(&outcome.status)
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let record: BillingRecord = row
            .ok_or_else(|| {
                BillingError::Internal(format!("billing record {} vanished", record_id))
            })?
            .try_into()?;

        // The money moved regardless of what local state says now. If a
        // concurrent cancel landed between charge and reconcile, keep the
        // paid record and leave the status alone.
        let ctx = TransitionContext::system().with_metadata(serde_json::json!({
            "billing_record_id": record.id,
            "provider_payment_intent_id": outcome.provider_payment_intent_id,
        }));
        // A first successful charge on a trial is the conversion moment;
        // record it under the trigger the audit trail should show
        let trigger = match sub.status {
            SubscriptionStatus::TrialActive | SubscriptionStatus::TrialExpired => {
                Trigger::ConvertTrial
            }
            _ => Trigger::PaymentSucceeded,
        };
        match LifecycleService::apply_in_tx(&mut tx, sub.id, trigger, &ctx).await {
            Ok(_) => {}
            Err(BillingError::InvalidTransition { from, .. }) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    current_status = %from,
                    "Charge succeeded but subscription no longer accepts the transition; keeping paid record only"
                );
            }
            Err(other) => return Err(other),
        }

        // Remember the method that worked for recovery sweeps
        sqlx::query(
            "UPDATE subscriptions SET default_payment_method_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(&request.payment_method_id)
        .bind(sub.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            record_id = %record.id,
            amount_cents = record.amount_cents,
            payment_intent = %outcome.provider_payment_intent_id,
            "Payment succeeded"
        );

        Ok(record)
    }

    /// Mark the record failed, bump failure counters, and move the
    /// subscription to `payment_failed` where the current status permits.
    /// Returns the new attempt count.
    async fn reconcile_failure(
        &self,
        sub: &Subscription,
        record_id: Uuid,
        error: &str,
    ) -> BillingResult<i32> {
        let mut tx = self.pool.begin().await?;

        let ctx = TransitionContext::system()
            .with_metadata(serde_json::json!({ "billing_record_id": record_id }));
        let mut track_counters = true;
        match LifecycleService::apply_in_tx(&mut tx, sub.id, Trigger::PaymentFailed, &ctx).await {
            Ok(_) => {}
            Err(BillingError::InvalidTransition { from, .. }) => {
                // e.g. a charge kicked off while Active, sub got paused
                // meanwhile; record the failure without a status change
                tracing::info!(
                    subscription_id = %sub.id,
                    current_status = %from,
                    "Recording charge failure without status change"
                );
                // Still need the row lock for the counter update below
                let current = fetch_subscription_for_update(&mut tx, sub.id).await?;
                track_counters = failure_tracking_applies(current.status);
            }
            Err(other) => return Err(other),
        }

        sqlx::query(
            r#"
            UPDATE billing_records SET
                status = 'failed', failure_message = $1, updated_at = NOW(),
                charge_started_at = NULL
            WHERE id = $2
            "#,
        )
        .bind(error)
        .bind(record_id)
        .execute(&mut *tx)
        .await?;

        let attempts: i32 = if track_counters {
            sqlx::query_scalar(
                r#"
                UPDATE subscriptions SET
                    failed_payment_attempts = failed_payment_attempts + 1,
                    last_payment_error = $1,
                    last_payment_failed_at = NOW(),
                    updated_at = NOW()
                WHERE id = $2
                RETURNING failed_payment_attempts
                "#,
            )
            .bind(error)
            .bind(sub.id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            // Terminal row: the recovery sweep never revisits it, so the
            // counters stay as last recorded
            sub.failed_payment_attempts
        };

        tx.commit().await?;

        tracing::warn!(
            subscription_id = %sub.id,
            record_id = %record_id,
            attempts = attempts,
            error = %error,
            "Payment failed"
        );

        Ok(attempts)
    }

    pub(crate) async fn find_paid_record(
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
    ) -> BillingResult<Option<BillingRecord>> {
        let row: Option<BillingRecordRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, user_id, amount_cents, currency, status,
                   due_date, billing_date, period_start, period_end,
                   provider_payment_intent_id, provider_invoice_id, transaction_id,
                   failure_message, created_at, updated_at
            FROM billing_records
            WHERE subscription_id = $1 AND period_start = $2 AND status = 'paid'
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(BillingRecord::try_from).transpose()
    }

    /// Create the pending record for this period, or re-claim an existing
    /// one whose previous charge attempt went stale. `None` means another
    /// call holds a live claim.
    async fn claim_pending_record(
        tx: &mut Transaction<'_, Postgres>,
        sub: &Subscription,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        due_date: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_records
                (subscription_id, user_id, amount_cents, currency, status,
                 due_date, period_start, period_end, charge_started_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, NOW())
            ON CONFLICT (subscription_id, period_start) WHERE status = 'pending'
            DO UPDATE SET charge_started_at = NOW(), updated_at = NOW()
            WHERE billing_records.charge_started_at IS NULL
               OR billing_records.charge_started_at < NOW() - make_interval(mins => $8)
            RETURNING id
            "#,
        )
        .bind(sub.id)
        .bind(sub.user_id)
        .bind(sub.current_price_cents)
        .bind(&sub.currency)
        .bind(due_date)
        .bind(period_start)
        .bind(period_end)
        .bind(CHARGE_CLAIM_TIMEOUT_MINUTES)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(claimed.map(|(id,)| id))
    }

    /// Re-charge subscriptions sitting in `payment_failed`.
    ///
    /// Eligible: last failure older than the configured backoff. Past the
    /// grace window the subscription is cancelled instead of re-charged.
    /// Re-entrant: the per-period claim and the provider idempotency key
    /// make a re-run of an interrupted sweep safe.
    pub async fn run_recovery_sweep(&self) -> BillingResult<Vec<RecoveryOutcome>> {
        let candidates: Vec<(Uuid, Option<String>, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT id, default_payment_method_id, last_payment_failed_at
            FROM subscriptions
            WHERE status = 'payment_failed'
              AND (last_payment_failed_at IS NULL
                   OR last_payment_failed_at < NOW() - make_interval(hours => $1))
            ORDER BY last_payment_failed_at ASC NULLS FIRST
            "#,
        )
        .bind(self.config.recovery_backoff_hours as i32)
        .fetch_all(&self.pool)
        .await?;

        let grace = Duration::days(self.config.recovery_grace_days);
        let now = OffsetDateTime::now_utc();
        let mut outcomes = Vec::with_capacity(candidates.len());

        for (subscription_id, payment_method, last_failed_at) in candidates {
            let past_grace = last_failed_at
                .map(|failed_at| now - failed_at > grace)
                .unwrap_or(false);

            if past_grace {
                let lifecycle = LifecycleService::new(self.pool.clone());
                let ctx = TransitionContext {
                    actor: crate::history::Actor::System,
                    reason: Some("payment recovery window elapsed".to_string()),
                    metadata: serde_json::Value::Null,
                };
                match lifecycle
                    .apply_transition(subscription_id, Trigger::Cancel, ctx)
                    .await
                {
                    Ok(sub) => {
                        dispatch_state_changed(
                            self.notifier.clone(),
                            sub.id,
                            sub.user_id,
                            sub.status,
                        );
                        outcomes.push(RecoveryOutcome::CancelledAfterGrace { subscription_id });
                    }
                    Err(e) => {
                        tracing::error!(
                            subscription_id = %subscription_id,
                            error = %e,
                            "Failed to cancel subscription past recovery grace window"
                        );
                        outcomes.push(RecoveryOutcome::Skipped {
                            subscription_id,
                            reason: e.to_string(),
                        });
                    }
                }
                continue;
            }

            let Some(payment_method_id) = payment_method else {
                outcomes.push(RecoveryOutcome::Skipped {
                    subscription_id,
                    reason: "no payment method on file".to_string(),
                });
                continue;
            };

            match self
                .process_payment(subscription_id, PaymentRequest { payment_method_id })
                .await
            {
                Ok(PaymentOutcome::Paid { .. }) | Ok(PaymentOutcome::AlreadyPaid { .. }) => {
                    outcomes.push(RecoveryOutcome::Recovered { subscription_id });
                }
                Ok(PaymentOutcome::Failed { error, .. }) => {
                    outcomes.push(RecoveryOutcome::StillFailing {
                        subscription_id,
                        error,
                    });
                }
                Ok(PaymentOutcome::InProgress) => {
                    outcomes.push(RecoveryOutcome::Skipped {
                        subscription_id,
                        reason: "charge already in progress".to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Recovery charge errored"
                    );
                    outcomes.push(RecoveryOutcome::Skipped {
                        subscription_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(outcomes)
    }
}

/// Whether charge-failure bookkeeping applies to a subscription in this
/// status. The counters drive the recovery sweep, which never touches
/// terminal rows; bumping them there would misstate a closed subscription.
pub(crate) fn failure_tracking_applies(status: SubscriptionStatus) -> bool {
    !status.is_terminal()
}

/// Charge with exponential backoff on transient provider failures.
///
/// `max_attempts` bounds the total number of charge calls; permanent
/// rejections are returned immediately.
pub async fn charge_with_retry(
    provider: &dyn ProviderClient,
    request: ChargeRequest,
    max_attempts: usize,
    base_delay_ms: u64,
) -> Result<ChargeOutcome, ProviderError> {
    let retries = max_attempts.saturating_sub(1);
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(base_delay_ms.max(1) / 2 + 1)
        .take(retries);

    RetryIf::spawn(
        strategy,
        || provider.charge_payment(request.clone()),
        |err: &ProviderError| err.is_transient(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockChargeOutcome, MockProviderClient};

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let provider = MockProviderClient::new().with_charge_outcomes(vec![
            MockChargeOutcome::Transient {
                message: "gateway timeout".to_string(),
            },
            MockChargeOutcome::Transient {
                message: "rate limited".to_string(),
            },
            MockChargeOutcome::Success {
                payment_intent_id: "pi_recovered".to_string(),
            },
        ]);

        let request = ChargeRequest {
            payment_method_id: "pm_1".to_string(),
            amount_cents: 2900,
            currency: "usd".to_string(),
            idempotency_key: "sub:period".to_string(),
        };

        let outcome = charge_with_retry(&provider, request, 3, 1).await;
        assert_eq!(
            outcome.map(|o| o.provider_payment_intent_id).ok(),
            Some("pi_recovered".to_string())
        );
        assert_eq!(provider.charge_calls().len(), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_bounded_attempts() {
        let provider = MockProviderClient::new().with_charge_outcomes(vec![
            MockChargeOutcome::Transient {
                message: "down".to_string(),
            },
            MockChargeOutcome::Transient {
                message: "down".to_string(),
            },
            MockChargeOutcome::Transient {
                message: "down".to_string(),
            },
            MockChargeOutcome::Success {
                payment_intent_id: "pi_too_late".to_string(),
            },
        ]);

        let request = ChargeRequest {
            payment_method_id: "pm_1".to_string(),
            amount_cents: 2900,
            currency: "usd".to_string(),
            idempotency_key: "sub:period".to_string(),
        };

        let outcome = charge_with_retry(&provider, request, 3, 1).await;
        assert!(matches!(outcome, Err(ProviderError::Transient(_))));
        // Exactly max_attempts calls, never the fourth
        assert_eq!(provider.charge_calls().len(), 3);
    }

    #[tokio::test]
    async fn rejection_is_never_retried() {
        let provider = MockProviderClient::new().with_charge_outcomes(vec![
            MockChargeOutcome::Rejected {
                message: "card declined".to_string(),
            },
            MockChargeOutcome::Success {
                payment_intent_id: "pi_should_not_happen".to_string(),
            },
        ]);

        let request = ChargeRequest {
            payment_method_id: "pm_declined".to_string(),
            amount_cents: 2900,
            currency: "usd".to_string(),
            idempotency_key: "sub:period".to_string(),
        };

        let outcome = charge_with_retry(&provider, request, 3, 1).await;
        assert!(matches!(outcome, Err(ProviderError::Rejected(_))));
        assert_eq!(provider.charge_calls().len(), 1);
    }

    #[test]
    fn terminal_rows_keep_their_failure_counters() {
        use SubscriptionStatus::*;

        for status in [TrialActive, Active, Paused, TrialExpired, PaymentFailed] {
            assert!(failure_tracking_applies(status), "{status} tracks failures");
        }
        for status in [Cancelled, Expired] {
            assert!(
                !failure_tracking_applies(status),
                "{status} keeps its last recorded counters"
            );
        }
    }
}
