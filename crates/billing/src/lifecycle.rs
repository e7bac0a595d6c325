//! Subscription lifecycle state machine
//!
//! The sole authority for changing `subscriptions.status`. The transition
//! table is a pure function over (status, trigger); the service wraps it in
//! a row-locked transaction that applies the status write, trigger-specific
//! side effects, and the history row atomically. `Cancelled` and `Expired`
//! are terminal: no trigger leads out of them, including reactivation.

use sqlx::{PgPool, Postgres, Transaction};
use subsync_shared::SubscriptionStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::history::{Actor, StatusHistoryRecorder};
use crate::model::{fetch_subscription_for_update, Subscription};

/// What is being asked of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Trial converts to a paying subscription
    ConvertTrial,
    /// Trial end date passed without conversion
    ExpireTrial,
    Pause,
    Resume,
    /// Requires a non-empty reason
    Cancel,
    /// Charge succeeded (scheduled billing or recovery)
    PaymentSucceeded,
    /// Charge failed during scheduled billing
    PaymentFailed,
    /// Subscription naturally ends, no further billing
    Expire,
    /// Explicitly unsupported: cancellation is terminal
    Reactivate,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::ConvertTrial => "convert_trial",
            Trigger::ExpireTrial => "expire_trial",
            Trigger::Pause => "pause",
            Trigger::Resume => "resume",
            Trigger::Cancel => "cancel",
            Trigger::PaymentSucceeded => "payment_succeeded",
            Trigger::PaymentFailed => "payment_failed",
            Trigger::Expire => "expire",
            Trigger::Reactivate => "reactivate",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The transition table. Returns the target status, or `None` when the
/// trigger is not permitted from `from`.
///
/// Business rules encoded here:
/// - trial subscriptions cannot be paused
/// - resume is only legal from `Paused`
/// - cancel is legal from every non-terminal status
/// - reactivation of a cancelled subscription is not supported
pub fn permitted_transition(
    from: SubscriptionStatus,
    trigger: Trigger,
) -> Option<SubscriptionStatus> {
    use SubscriptionStatus::*;

    match (from, trigger) {
        (TrialActive, Trigger::ConvertTrial) => Some(Active),
        (TrialExpired, Trigger::ConvertTrial) => Some(Active),
        (TrialActive, Trigger::ExpireTrial) => Some(TrialExpired),

        (Active, Trigger::Pause) => Some(Paused),
        (Paused, Trigger::Resume) => Some(Active),

        (from, Trigger::Cancel) if !from.is_terminal() => Some(Cancelled),

        // A successful charge lands on Active wherever billing is live;
        // the Active self-loop covers renewal reconciliation from webhooks.
        (Active, Trigger::PaymentSucceeded) => Some(Active),
        (PaymentFailed, Trigger::PaymentSucceeded) => Some(Active),
        (TrialActive, Trigger::PaymentSucceeded) => Some(Active),
        (TrialExpired, Trigger::PaymentSucceeded) => Some(Active),

        (Active, Trigger::PaymentFailed) => Some(PaymentFailed),
        (PaymentFailed, Trigger::PaymentFailed) => Some(PaymentFailed),

        (Active, Trigger::Expire) => Some(Expired),

        _ => None,
    }
}

/// Context accompanying a transition request.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub actor: Actor,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

impl TransitionContext {
    pub fn system() -> Self {
        Self {
            actor: Actor::System,
            reason: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn user(reason: Option<String>) -> Self {
        Self {
            actor: Actor::User,
            reason,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn provider(reason: impl Into<String>) -> Self {
        Self {
            actor: Actor::Provider,
            reason: Some(reason.into()),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Applies validated transitions to subscription rows.
#[derive(Clone)]
pub struct LifecycleService {
    pool: PgPool,
}

impl LifecycleService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a transition in its own transaction.
    ///
    /// Locks the subscription row, validates the trigger against the current
    /// status, writes the new status plus side effects and the history row,
    /// then commits. Rejected transitions leave no trace.
    pub async fn apply_transition(
        &self,
        subscription_id: Uuid,
        trigger: Trigger,
        ctx: TransitionContext,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let updated = Self::apply_in_tx(&mut tx, subscription_id, trigger, &ctx).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            trigger = %trigger,
            new_status = %updated.status,
            actor = %ctx.actor,
            "Applied lifecycle transition"
        );

        Ok(updated)
    }

    /// Apply a transition inside the caller's transaction.
    ///
    /// Used by the payment engine and the webhook pipeline so that billing
    /// record changes and the status change land atomically.
    pub async fn apply_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
        trigger: Trigger,
        ctx: &TransitionContext,
    ) -> BillingResult<Subscription> {
        if trigger == Trigger::Cancel && ctx.reason.as_deref().unwrap_or("").trim().is_empty() {
            return Err(BillingError::Validation(
                "cancellation requires a non-empty reason".to_string(),
            ));
        }

        let current = fetch_subscription_for_update(tx, subscription_id).await?;

        let target = permitted_transition(current.status, trigger).ok_or_else(|| {
            BillingError::InvalidTransition {
                from: current.status.to_string(),
                trigger: trigger.to_string(),
            }
        })?;

        let now = OffsetDateTime::now_utc();
        Self::write_status(tx, &current, target, trigger, ctx, now).await?;

        StatusHistoryRecorder::record_in_tx(
            tx,
            subscription_id,
            Some(current.status),
            target,
            ctx.actor,
            ctx.reason.as_deref(),
            ctx.metadata.clone(),
        )
        .await?;

        let mut updated = current;
        Self::project_side_effects(&mut updated, target, trigger, ctx, now);
        Ok(updated)
    }

    /// Persist the status change and its trigger-specific side effects.
    async fn write_status(
        tx: &mut Transaction<'_, Postgres>,
        current: &Subscription,
        target: SubscriptionStatus,
        trigger: Trigger,
        ctx: &TransitionContext,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let rows_affected = match trigger {
            Trigger::Pause => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        status = $1, paused_at = $2,
                        version = version + 1, updated_at = NOW()
                    WHERE id = $3 AND version = $4
                    "#,
                )
                .bind(target.as_str())
                .bind(now)
                .bind(current.id)
                .bind(current.version)
                .execute(&mut **tx)
                .await?
                .rows_affected()
            }
            Trigger::Resume => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        status = $1, paused_at = NULL,
                        version = version + 1, updated_at = NOW()
                    WHERE id = $2 AND version = $3
                    "#,
                )
                .bind(target.as_str())
                .bind(current.id)
                .bind(current.version)
                .execute(&mut **tx)
                .await?
                .rows_affected()
            }
            Trigger::Cancel => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        status = $1, cancelled_at = $2, cancellation_reason = $3,
                        auto_renew = FALSE, next_billing_date = NULL,
                        version = version + 1, updated_at = NOW()
                    WHERE id = $4 AND version = $5
                    "#,
                )
                .bind(target.as_str())
                .bind(now)
                .bind(ctx.reason.as_deref())
                .bind(current.id)
                .bind(current.version)
                .execute(&mut **tx)
                .await?
                .rows_affected()
            }
            Trigger::ConvertTrial | Trigger::PaymentSucceeded => {
                let next_billing = current.billing_interval.next_billing_date(now);
                sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        status = $1, failed_payment_attempts = 0,
                        last_payment_error = NULL, paused_at = NULL,
                        next_billing_date = $2,
                        version = version + 1, updated_at = NOW()
                    WHERE id = $3 AND version = $4
                    "#,
                )
                .bind(target.as_str())
                .bind(next_billing)
                .bind(current.id)
                .bind(current.version)
                .execute(&mut **tx)
                .await?
                .rows_affected()
            }
            Trigger::ExpireTrial => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        status = $1, next_billing_date = NULL,
                        version = version + 1, updated_at = NOW()
                    WHERE id = $2 AND version = $3
                    "#,
                )
                .bind(target.as_str())
                .bind(current.id)
                .bind(current.version)
                .execute(&mut **tx)
                .await?
                .rows_affected()
            }
            Trigger::PaymentFailed => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        status = $1, last_payment_failed_at = $2,
                        version = version + 1, updated_at = NOW()
                    WHERE id = $3 AND version = $4
                    "#,
                )
                .bind(target.as_str())
                .bind(now)
                .bind(current.id)
                .bind(current.version)
                .execute(&mut **tx)
                .await?
                .rows_affected()
            }
            Trigger::Expire => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions SET
                        status = $1, next_billing_date = NULL, auto_renew = FALSE,
                        version = version + 1, updated_at = NOW()
                    WHERE id = $2 AND version = $3
                    "#,
                )
                .bind(target.as_str())
                .bind(current.id)
                .bind(current.version)
                .execute(&mut **tx)
                .await?
                .rows_affected()
            }
            // Unreachable: the transition table rejects it above
            Trigger::Reactivate => 0,
        };

        if rows_affected == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another operation",
                current.id
            )));
        }

        Ok(())
    }

    /// Mirror the SQL side effects onto the in-memory copy we return.
    fn project_side_effects(
        sub: &mut Subscription,
        target: SubscriptionStatus,
        trigger: Trigger,
        ctx: &TransitionContext,
        now: OffsetDateTime,
    ) {
        sub.status = target;
        sub.version += 1;
        sub.updated_at = now;
        match trigger {
            Trigger::Pause => sub.paused_at = Some(now),
            Trigger::Resume => sub.paused_at = None,
            Trigger::Cancel => {
                sub.cancelled_at = Some(now);
                sub.cancellation_reason = ctx.reason.clone();
                sub.auto_renew = false;
                sub.next_billing_date = None;
            }
            Trigger::ConvertTrial | Trigger::PaymentSucceeded => {
                sub.failed_payment_attempts = 0;
                sub.last_payment_error = None;
                sub.paused_at = None;
                sub.next_billing_date = Some(sub.billing_interval.next_billing_date(now));
            }
            Trigger::ExpireTrial => sub.next_billing_date = None,
            Trigger::PaymentFailed => sub.last_payment_failed_at = Some(now),
            Trigger::Expire => {
                sub.next_billing_date = None;
                sub.auto_renew = false;
            }
            Trigger::Reactivate => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn trial_cannot_be_paused() {
        assert_eq!(permitted_transition(TrialActive, Trigger::Pause), None);
        assert_eq!(permitted_transition(Active, Trigger::Pause), Some(Paused));
    }

    #[test]
    fn resume_only_from_paused() {
        assert_eq!(permitted_transition(Paused, Trigger::Resume), Some(Active));
        assert_eq!(permitted_transition(Active, Trigger::Resume), None);
        assert_eq!(permitted_transition(TrialActive, Trigger::Resume), None);
        assert_eq!(permitted_transition(PaymentFailed, Trigger::Resume), None);
    }

    #[test]
    fn cancel_from_any_non_terminal() {
        for from in [TrialActive, Active, Paused, TrialExpired, PaymentFailed] {
            assert_eq!(
                permitted_transition(from, Trigger::Cancel),
                Some(Cancelled),
                "cancel should be permitted from {from}"
            );
        }
        assert_eq!(permitted_transition(Cancelled, Trigger::Cancel), None);
        assert_eq!(permitted_transition(Expired, Trigger::Cancel), None);
    }

    #[test]
    fn cancelled_is_terminal() {
        for trigger in [
            Trigger::ConvertTrial,
            Trigger::ExpireTrial,
            Trigger::Pause,
            Trigger::Resume,
            Trigger::Cancel,
            Trigger::PaymentSucceeded,
            Trigger::PaymentFailed,
            Trigger::Expire,
            Trigger::Reactivate,
        ] {
            assert_eq!(
                permitted_transition(Cancelled, trigger),
                None,
                "{trigger} should be rejected from Cancelled"
            );
        }
    }

    #[test]
    fn reactivation_is_never_supported() {
        for from in [
            TrialActive,
            Active,
            Paused,
            Cancelled,
            Expired,
            TrialExpired,
            PaymentFailed,
        ] {
            assert_eq!(permitted_transition(from, Trigger::Reactivate), None);
        }
    }

    #[test]
    fn payment_recovery_returns_to_active() {
        assert_eq!(
            permitted_transition(PaymentFailed, Trigger::PaymentSucceeded),
            Some(Active)
        );
        assert_eq!(
            permitted_transition(Active, Trigger::PaymentFailed),
            Some(PaymentFailed)
        );
    }

    #[test]
    fn trial_paths() {
        assert_eq!(
            permitted_transition(TrialActive, Trigger::ConvertTrial),
            Some(Active)
        );
        assert_eq!(
            permitted_transition(TrialActive, Trigger::ExpireTrial),
            Some(TrialExpired)
        );
        // Late conversion after trial expiry
        assert_eq!(
            permitted_transition(TrialExpired, Trigger::ConvertTrial),
            Some(Active)
        );
        assert_eq!(permitted_transition(TrialExpired, Trigger::ExpireTrial), None);
    }

    #[test]
    fn expire_only_from_active() {
        assert_eq!(permitted_transition(Active, Trigger::Expire), Some(Expired));
        assert_eq!(permitted_transition(Paused, Trigger::Expire), None);
        assert_eq!(permitted_transition(PaymentFailed, Trigger::Expire), None);
    }
}
