//! Persistent records: the subscription aggregate and its billing records
//!
//! Rows are fetched as string-status structs and converted into typed values
//! once, at the fetch helpers. All status columns are TEXT in Postgres;
//! [`SubscriptionStatus`]/[`BillingStatus`] are the in-process truth.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use subsync_shared::{BillingInterval, BillingStatus, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// The subscription aggregate root.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub billing_interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub current_price_cents: i64,
    pub currency: String,
    pub start_date: OffsetDateTime,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub next_billing_date: Option<OffsetDateTime>,
    pub paused_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub auto_renew: bool,
    pub failed_payment_attempts: i32,
    pub last_payment_error: Option<String>,
    pub last_payment_failed_at: Option<OffsetDateTime>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub provider_price_id: Option<String>,
    /// Optimistic lock version, bumped on every mutation
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_paused(&self) -> bool {
        self.status.is_paused()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.status.is_expired()
    }
}

/// One charge attempt / invoice for a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct BillingRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: BillingStatus,
    pub due_date: OffsetDateTime,
    pub billing_date: Option<OffsetDateTime>,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub provider_payment_intent_id: Option<String>,
    pub provider_invoice_id: Option<String>,
    pub transaction_id: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub billing_interval: String,
    pub status: String,
    pub current_price_cents: i64,
    pub currency: String,
    pub start_date: OffsetDateTime,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub next_billing_date: Option<OffsetDateTime>,
    pub paused_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub auto_renew: bool,
    pub failed_payment_attempts: i32,
    pub last_payment_error: Option<String>,
    pub last_payment_failed_at: Option<OffsetDateTime>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Internal(format!(
                "subscription {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;
        let billing_interval = BillingInterval::parse(&row.billing_interval).ok_or_else(|| {
            BillingError::Internal(format!(
                "subscription {} has unknown billing interval '{}'",
                row.id, row.billing_interval
            ))
        })?;

        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            billing_interval,
            status,
            current_price_cents: row.current_price_cents,
            currency: row.currency,
            start_date: row.start_date,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            next_billing_date: row.next_billing_date,
            paused_at: row.paused_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            auto_renew: row.auto_renew,
            failed_payment_attempts: row.failed_payment_attempts,
            last_payment_error: row.last_payment_error,
            last_payment_failed_at: row.last_payment_failed_at,
            provider_customer_id: row.provider_customer_id,
            provider_subscription_id: row.provider_subscription_id,
            provider_price_id: row.provider_price_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BillingRecordRow {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub due_date: OffsetDateTime,
    pub billing_date: Option<OffsetDateTime>,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub provider_payment_intent_id: Option<String>,
    pub provider_invoice_id: Option<String>,
    pub transaction_id: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TryFrom<BillingRecordRow> for BillingRecord {
    type Error = BillingError;

    fn try_from(row: BillingRecordRow) -> BillingResult<Self> {
        let status = BillingStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Internal(format!(
                "billing record {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;

        Ok(BillingRecord {
            id: row.id,
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status,
            due_date: row.due_date,
            billing_date: row.billing_date,
            period_start: row.period_start,
            period_end: row.period_end,
            provider_payment_intent_id: row.provider_payment_intent_id,
            provider_invoice_id: row.provider_invoice_id,
            transaction_id: row.transaction_id,
            failure_message: row.failure_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, plan_id, billing_interval, status, current_price_cents, currency,
    start_date, trial_start, trial_end, next_billing_date, paused_at,
    cancelled_at, cancellation_reason, auto_renew, failed_payment_attempts,
    last_payment_error, last_payment_failed_at, provider_customer_id,
    provider_subscription_id, provider_price_id, version, created_at, updated_at
"#;

/// Fetch a subscription without locking.
pub async fn fetch_subscription(pool: &PgPool, id: Uuid) -> BillingResult<Subscription> {
    let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.ok_or_else(|| BillingError::NotFound(format!("subscription {} not found", id)))?
        .try_into()
}

/// Fetch a subscription under a row lock, serializing concurrent mutations.
pub(crate) async fn fetch_subscription_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> BillingResult<Subscription> {
    let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;

    row.ok_or_else(|| BillingError::NotFound(format!("subscription {} not found", id)))?
        .try_into()
}

/// Look up a subscription by its provider-side subscription id.
pub async fn fetch_subscription_by_provider_id(
    pool: &PgPool,
    provider_subscription_id: &str,
) -> BillingResult<Option<Subscription>> {
    let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE provider_subscription_id = $1"
    ))
    .bind(provider_subscription_id)
    .fetch_optional(pool)
    .await?;

    row.map(Subscription::try_from).transpose()
}
