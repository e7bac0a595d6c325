//! Subscription management surface
//!
//! Caller-facing operations over the lifecycle engine: create, read,
//! pause/resume/cancel, plan changes, and billing history. Every operation
//! returns a [`ServiceResponse`] so callers translate outcomes directly
//! into their own result codes.
//!
//! Local state is authoritative. Mutations commit locally first; the
//! matching provider-side call runs afterwards and a failure there is
//! logged, not rolled back — the provider converges through webhooks.

use std::sync::Arc;

use sqlx::PgPool;
use subsync_shared::{Plan, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::history::{Actor, StatusHistoryEntry, StatusHistoryRecorder};
use crate::lifecycle::{LifecycleService, TransitionContext, Trigger};
use crate::model::{fetch_subscription, BillingRecord, Subscription};
use crate::notify::{dispatch_state_changed, Notifier};
use crate::provider::{CreateRemoteSubscriptionRequest, ProviderClient};
use crate::response::ServiceResponse;

/// Parameters for opening a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub user_id: Uuid,
    pub plan: Plan,
    pub customer_email: String,
}

pub struct SubscriptionService {
    pool: PgPool,
    provider: Arc<dyn ProviderClient>,
    notifier: Arc<dyn Notifier>,
    lifecycle: LifecycleService,
    history: StatusHistoryRecorder,
}

impl SubscriptionService {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn ProviderClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let lifecycle = LifecycleService::new(pool.clone());
        let history = StatusHistoryRecorder::new(pool.clone());
        Self {
            pool,
            provider,
            notifier,
            lifecycle,
            history,
        }
    }

    /// Open a subscription on the given plan.
    ///
    /// Plans with a trial start in `trial_active` with no charge; the first
    /// billing date is the trial end. Plans without a trial start `active`
    /// with the first billing date one period out (the opening charge is a
    /// separate payment operation).
    pub async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> ServiceResponse<Subscription> {
        match self.create_subscription_inner(request).await {
            Ok(sub) => ServiceResponse::created("subscription created", sub),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    async fn create_subscription_inner(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        let plan = &request.plan;

        if plan.price_cents <= 0 {
            return Err(BillingError::Validation(format!(
                "plan '{}' has no positive price",
                plan.name
            )));
        }
        if !request.customer_email.contains('@') {
            return Err(BillingError::Validation(
                "customer email is not an address".to_string(),
            ));
        }

        // Provision provider-side first: a local row without provider ids
        // cannot be charged or synced
        let customer_id = self.provider.create_customer(&request.customer_email).await?;
        let remote = self
            .provider
            .create_remote_subscription(CreateRemoteSubscriptionRequest {
                customer_id: customer_id.clone(),
                price_id: plan.provider_price_id.clone(),
                trial_days: plan.has_trial().then_some(plan.trial_days),
            })
            .await?;

        let now = OffsetDateTime::now_utc();
        let status = plan.initial_status();
        let (trial_start, trial_end) = if plan.has_trial() {
            let end = now + time::Duration::days(plan.trial_days);
            (Some(now), Some(end))
        } else {
            (None, None)
        };
        let next_billing_date = match trial_end {
            Some(end) => end,
            None => plan.interval.next_billing_date(now),
        };

        let mut tx = self.pool.begin().await?;

        // The row carries the plan price from day one, trial included;
        // conversion charges this stored price rather than repricing
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, billing_interval, status, current_price_cents, currency,
                 start_date, trial_start, trial_end, next_billing_date, auto_renew,
                 provider_customer_id, provider_subscription_id, provider_price_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(request.user_id)
        .bind(plan.id)
        .bind(plan.interval.as_str())
        .bind(status.as_str())
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(now)
        .bind(trial_start)
        .bind(trial_end)
        .bind(next_billing_date)
        .bind(&customer_id)
        .bind(&remote.id)
        .bind(&plan.provider_price_id)
        .fetch_one(&mut *tx)
        .await?;

        StatusHistoryRecorder::record_in_tx(
            &mut tx,
            id,
            None,
            status,
            Actor::User,
            Some("subscription created"),
            serde_json::json!({
                "plan": plan.name,
                "provider_subscription_id": remote.id,
            }),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %id,
            user_id = %request.user_id,
            plan = %plan.name,
            status = %status,
            "Subscription created"
        );

        dispatch_state_changed(self.notifier.clone(), id, request.user_id, status);

        fetch_subscription(&self.pool, id).await
    }

    pub async fn get_subscription(&self, subscription_id: Uuid) -> ServiceResponse<Subscription> {
        match fetch_subscription(&self.pool, subscription_id).await {
            Ok(sub) => ServiceResponse::ok("subscription", sub),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// Pause an active subscription. Paused time is not credited; billing
    /// resumes on the original schedule.
    pub async fn pause_subscription(
        &self,
        subscription_id: Uuid,
        reason: Option<String>,
    ) -> ServiceResponse<Subscription> {
        self.apply_user_trigger(subscription_id, Trigger::Pause, reason, |id| async move {
            self.provider.pause_remote_subscription(&id).await
        })
        .await
    }

    pub async fn resume_subscription(
        &self,
        subscription_id: Uuid,
        reason: Option<String>,
    ) -> ServiceResponse<Subscription> {
        self.apply_user_trigger(subscription_id, Trigger::Resume, reason, |id| async move {
            self.provider.resume_remote_subscription(&id).await
        })
        .await
    }

    /// Cancel a subscription. Permitted from any non-terminal status and
    /// requires a non-empty reason; cancellation is permanent.
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        reason: String,
    ) -> ServiceResponse<Subscription> {
        self.apply_user_trigger(
            subscription_id,
            Trigger::Cancel,
            Some(reason),
            |id| async move { self.provider.cancel_remote_subscription(&id).await },
        )
        .await
    }

    /// Reactivation of a cancelled or expired subscription is not
    /// supported; the caller opens a new subscription instead. Always a
    /// conflict for existing subscriptions.
    pub async fn reactivate_subscription(
        &self,
        subscription_id: Uuid,
    ) -> ServiceResponse<Subscription> {
        let sub = match fetch_subscription(&self.pool, subscription_id).await {
            Ok(sub) => sub,
            Err(err) => return ServiceResponse::from_error(&err),
        };

        ServiceResponse::from_error(&BillingError::InvalidTransition {
            from: sub.status.as_str().to_string(),
            trigger: Trigger::Reactivate.as_str().to_string(),
        })
    }

    /// Switch an active subscription to a different plan.
    ///
    /// The new price takes effect at the next billing date; no proration.
    /// The provider-side price follows at the next renewal through its own
    /// subscription item update, reported back via webhook.
    pub async fn change_plan(
        &self,
        subscription_id: Uuid,
        new_plan: Plan,
    ) -> ServiceResponse<Subscription> {
        match self.change_plan_inner(subscription_id, new_plan).await {
            Ok(sub) => ServiceResponse::ok("plan changed", sub),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    async fn change_plan_inner(
        &self,
        subscription_id: Uuid,
        new_plan: Plan,
    ) -> BillingResult<Subscription> {
        if new_plan.price_cents <= 0 {
            return Err(BillingError::Validation(format!(
                "plan '{}' has no positive price",
                new_plan.name
            )));
        }

        let mut tx = self.pool.begin().await?;
        let sub = crate::model::fetch_subscription_for_update(&mut tx, subscription_id).await?;

        if sub.status != SubscriptionStatus::Active {
            return Err(BillingError::Validation(format!(
                "plan changes require an active subscription, {} is {}",
                subscription_id, sub.status
            )));
        }
        if sub.plan_id == new_plan.id {
            return Err(BillingError::Validation(
                "subscription is already on this plan".to_string(),
            ));
        }

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_id = $1,
                billing_interval = $2,
                current_price_cents = $3,
                currency = $4,
                provider_price_id = $5,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(new_plan.id)
        .bind(new_plan.interval.as_str())
        .bind(new_plan.price_cents)
        .bind(&new_plan.currency)
        .bind(&new_plan.provider_price_id)
        .bind(subscription_id)
        .bind(sub.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} changed during plan change",
                subscription_id
            )));
        }

        StatusHistoryRecorder::record_in_tx(
            &mut tx,
            subscription_id,
            Some(sub.status),
            sub.status,
            Actor::User,
            Some("plan changed"),
            serde_json::json!({
                "old_plan_id": sub.plan_id,
                "new_plan_id": new_plan.id,
                "old_price_cents": sub.current_price_cents,
                "new_price_cents": new_plan.price_cents,
            }),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            old_price_cents = sub.current_price_cents,
            new_price_cents = new_plan.price_cents,
            "Plan changed"
        );

        fetch_subscription(&self.pool, subscription_id).await
    }

    /// Billing records for one subscription, newest first.
    pub async fn get_billing_history(
        &self,
        subscription_id: Uuid,
    ) -> ServiceResponse<Vec<BillingRecord>> {
        match self.billing_history_inner(subscription_id).await {
            Ok(records) => ServiceResponse::ok("billing history", records),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    async fn billing_history_inner(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<BillingRecord>> {
        // 404 for unknown subscriptions, empty list for known ones
        fetch_subscription(&self.pool, subscription_id).await?;

        let rows: Vec<crate::model::BillingRecordRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, user_id, amount_cents, currency, status,
                   due_date, billing_date, period_start, period_end,
                   provider_payment_intent_id, provider_invoice_id, transaction_id,
                   failure_message, created_at, updated_at
            FROM billing_records
            WHERE subscription_id = $1
            ORDER BY period_start DESC, created_at DESC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BillingRecord::try_from).collect()
    }

    /// Status transition trail for one subscription, oldest first.
    pub async fn get_status_history(
        &self,
        subscription_id: Uuid,
    ) -> ServiceResponse<Vec<StatusHistoryEntry>> {
        if let Err(err) = fetch_subscription(&self.pool, subscription_id).await {
            return ServiceResponse::from_error(&err);
        }
        match self.history.for_subscription(subscription_id).await {
            Ok(entries) => ServiceResponse::ok("status history", entries),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// Apply a user-initiated trigger locally, then mirror it to the
    /// provider. Provider failures after the local commit are logged only;
    /// state converges through webhooks.
    async fn apply_user_trigger<F, Fut>(
        &self,
        subscription_id: Uuid,
        trigger: Trigger,
        reason: Option<String>,
        remote_sync: F,
    ) -> ServiceResponse<Subscription>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = crate::provider::ProviderResult<()>>,
    {
        let ctx = TransitionContext::user(reason);
        let sub = match self
            .lifecycle
            .apply_transition(subscription_id, trigger, ctx)
            .await
        {
            Ok(sub) => sub,
            Err(err) => return ServiceResponse::from_error(&err),
        };

        dispatch_state_changed(self.notifier.clone(), sub.id, sub.user_id, sub.status);

        if let Some(remote_id) = sub.provider_subscription_id.clone() {
            if let Err(e) = remote_sync(remote_id).await {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    trigger = trigger.as_str(),
                    error = %e,
                    "Provider sync after local transition failed; webhook will reconcile"
                );
            }
        }

        ServiceResponse::ok(format!("subscription {}", trigger.as_str()), sub)
    }
}
