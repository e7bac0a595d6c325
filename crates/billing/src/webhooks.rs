//! Webhook ingestion pipeline
//!
//! Converts asynchronous provider notifications into local state changes
//! without double-application or lost updates. Pipeline per event:
//! verify signature, claim the event id in the idempotency ledger,
//! dispatch the mapped action inside a transaction, record the outcome.
//!
//! Events may arrive out of order or be redelivered. Dispatch always
//! consults the current local state: a transition the current state does
//! not permit is acknowledged and ignored, never surfaced as a retryable
//! error. Only transient internal failures are surfaced retryable so the
//! provider redelivers.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use subsync_shared::{BillingStatus, SubscriptionStatus};
use time::OffsetDateTime;

use crate::config::ProviderConfig;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{ClaimResult, IdempotencyLedger, ProcessingOutcome};
use crate::lifecycle::{permitted_transition, LifecycleService, TransitionContext, Trigger};
use crate::model::{fetch_subscription_by_provider_id, Subscription};
use crate::notify::{dispatch_payment_failed, dispatch_state_changed, Notifier};
use crate::payments::{failure_tracking_applies, PaymentService};
use crate::response::ServiceResponse;

type HmacSha256 = Hmac<Sha256>;

/// Provider event envelope. Unknown fields and unknown `type` values are
/// tolerated by design; the provider adds fields without notice.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub object: EventObject,
}

/// The `data.object` of the envelope; field presence depends on `type`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Provider subscription id, on invoice events
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl WebhookEnvelope {
    pub fn event_timestamp(&self) -> Option<OffsetDateTime> {
        self.created
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
    }
}

/// What happened to an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event's side effect was applied
    Applied,
    /// Known but mapped to no action in the current state, or unknown type
    Ignored,
    /// Event id already processed (or in flight); idempotent replay
    Duplicate,
}

/// Acknowledgement returned for every accepted event.
#[derive(Debug, Clone)]
pub struct WebhookReceipt {
    pub event_id: String,
    pub event_type: String,
    pub outcome: WebhookOutcome,
}

/// Verify a `t=<ts>,v1=<hex hmac>` signature header against the payload.
///
/// Pure so it can be tested with forged signatures and a fixed clock.
/// The secret's `whsec_` prefix, when present, is stripped before keying.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1]),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::SignatureInvalid)?;

    if (now_unix - timestamp).abs() > tolerance_secs {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::SignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        return Err(BillingError::SignatureInvalid);
    }

    Ok(())
}

/// Translate a provider-side subscription status into a local trigger,
/// relative to the current local state. `None` means the event carries no
/// actionable delta for this subscription right now.
pub fn trigger_for_remote_status(
    local: SubscriptionStatus,
    remote_status: &str,
) -> Option<Trigger> {
    let trigger = match remote_status {
        "paused" => Trigger::Pause,
        "active" if local.is_paused() => Trigger::Resume,
        "canceled" | "cancelled" => Trigger::Cancel,
        "past_due" | "unpaid" => Trigger::PaymentFailed,
        _ => return None,
    };
    // Only propose triggers the current state can accept
    permitted_transition(local, trigger).map(|_| trigger)
}

/// The billing period an uncorrelated payment event may settle.
///
/// The engine's own charges carry no provider invoice id, so a later
/// provider invoice for a period already charged directly matches no
/// record. Booking it blindly would mark the next, unbilled period paid
/// and starve its renewal. Only a period whose billing date has arrived
/// is open to settle this way.
pub(crate) fn due_period_for_uncorrelated_payment(
    next_billing_date: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    next_billing_date.filter(|due| *due <= now)
}

pub struct WebhookHandler {
    pool: PgPool,
    ledger: IdempotencyLedger,
    notifier: Arc<dyn Notifier>,
    config: ProviderConfig,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, notifier: Arc<dyn Notifier>, config: ProviderConfig) -> Self {
        let ledger = IdempotencyLedger::new(pool.clone());
        Self {
            pool,
            ledger,
            notifier,
            config,
        }
    }

    /// Thin-surface entry point: structured response, never a bare error.
    pub async fn handle(&self, payload: &str, signature: &str) -> ServiceResponse<WebhookReceipt> {
        match self.handle_webhook(payload, signature).await {
            Ok(receipt) => ServiceResponse::ok("event accepted", receipt),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// Full pipeline for one delivery.
    ///
    /// `Err(SignatureInvalid)` and malformed payloads reject with no side
    /// effects and no ledger entry. Every authenticated, parseable event is
    /// accepted, including ones that map to no action.
    pub async fn handle_webhook(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<WebhookReceipt> {
        verify_signature(
            payload,
            signature,
            &self.config.webhook_secret,
            self.config.webhook_timestamp_tolerance_secs,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let envelope: WebhookEnvelope = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(error = %e, "Rejected malformed webhook payload");
            BillingError::Validation(format!("malformed webhook payload: {e}"))
        })?;

        let claim = self
            .ledger
            .claim(&envelope.id, &envelope.event_type, envelope.event_timestamp())
            .await?;

        match claim {
            ClaimResult::Duplicate { previous_outcome } => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    previous_outcome = %previous_outcome,
                    "Duplicate webhook event acknowledged"
                );
                return Ok(WebhookReceipt {
                    event_id: envelope.id,
                    event_type: envelope.event_type,
                    outcome: WebhookOutcome::Duplicate,
                });
            }
            ClaimResult::InFlight => {
                tracing::info!(
                    event_id = %envelope.id,
                    "Webhook event already being processed; acknowledged"
                );
                return Ok(WebhookReceipt {
                    event_id: envelope.id,
                    event_type: envelope.event_type,
                    outcome: WebhookOutcome::Duplicate,
                });
            }
            ClaimResult::Claimed { .. } => {}
        }

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Processing webhook event"
        );

        let result = self.dispatch(&envelope).await;

        match &result {
            Ok(WebhookOutcome::Applied) => {
                self.ledger
                    .finalize(&envelope.id, ProcessingOutcome::Applied, None)
                    .await?;
            }
            Ok(WebhookOutcome::Ignored) | Ok(WebhookOutcome::Duplicate) => {
                self.ledger
                    .finalize(&envelope.id, ProcessingOutcome::Ignored, None)
                    .await?;
            }
            Err(e) => {
                // Leave the event re-claimable so the provider's redelivery
                // actually retries the work
                self.ledger
                    .finalize(&envelope.id, ProcessingOutcome::Error, Some(&e.to_string()))
                    .await?;
            }
        }

        let outcome = result?;
        Ok(WebhookReceipt {
            event_id: envelope.id,
            event_type: envelope.event_type,
            outcome,
        })
    }

    /// Map the event type to an action and apply it.
    async fn dispatch(&self, envelope: &WebhookEnvelope) -> BillingResult<WebhookOutcome> {
        match envelope.event_type.as_str() {
            "invoice.paid" | "invoice.payment_succeeded" => {
                self.apply_payment_succeeded(envelope).await
            }
            "invoice.payment_failed" => self.apply_payment_failed(envelope).await,
            "customer.subscription.updated" => self.apply_remote_update(envelope).await,
            "customer.subscription.deleted" => {
                self.apply_lifecycle_event(envelope, Trigger::Cancel, "cancelled by provider")
                    .await
            }
            "customer.subscription.paused" => {
                self.apply_lifecycle_event(envelope, Trigger::Pause, "paused by provider")
                    .await
            }
            "customer.subscription.resumed" => {
                self.apply_lifecycle_event(envelope, Trigger::Resume, "resumed by provider")
                    .await
            }
            other => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %other,
                    "Unhandled webhook event type acknowledged"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Provider subscription id carried by the event, invoice or
    /// subscription shaped.
    fn provider_subscription_id(envelope: &WebhookEnvelope) -> Option<&str> {
        envelope
            .data
            .object
            .subscription
            .as_deref()
            .or(match envelope.event_type.as_str() {
                t if t.starts_with("customer.subscription.") => envelope.data.object.id.as_deref(),
                _ => None,
            })
    }

    async fn find_subscription(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<Option<Subscription>> {
        let Some(provider_sub_id) = Self::provider_subscription_id(envelope) else {
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Webhook event carries no subscription reference; ignored"
            );
            return Ok(None);
        };

        let sub = fetch_subscription_by_provider_id(&self.pool, provider_sub_id).await?;
        if sub.is_none() {
            tracing::warn!(
                event_id = %envelope.id,
                provider_subscription_id = %provider_sub_id,
                "Webhook references unknown subscription; ignored"
            );
        }
        Ok(sub)
    }

    /// Invoice payment succeeded: reconcile the matching billing record to
    /// `paid` and move the subscription toward Active.
    async fn apply_payment_succeeded(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.find_subscription(envelope).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let invoice_id = envelope.data.object.id.as_deref();
        // A paid record must carry a payment-intent id; the invoice id is
        // the correlation fallback when the event omits the intent
        let payment_intent = envelope
            .data
            .object
            .payment_intent
            .as_deref()
            .or(invoice_id)
            .unwrap_or("unknown");
        let amount = envelope
            .data
            .object
            .amount_paid
            .unwrap_or(sub.current_price_cents);

        let mut tx = self.pool.begin().await?;

        // Correlate by provider invoice id first, else record the payment
        // fresh (invoice raised provider-side, never seen locally)
        let existing: Option<(uuid::Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM billing_records
            WHERE subscription_id = $1 AND provider_invoice_id = $2
            FOR UPDATE
            "#,
        )
        .bind(sub.id)
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some((_, ref status)) if status == BillingStatus::Paid.as_str() => {
                // Replayed via a second event id; nothing to apply
                tx.commit().await?;
                return Ok(WebhookOutcome::Ignored);
            }
            Some((record_id, _)) => {
                sqlx::query(
                    r#"
                    UPDATE billing_records SET
                        status = 'paid', provider_payment_intent_id = $1,
                        billing_date = NOW(), failure_message = NULL, updated_at = NOW()
                    WHERE id = $2
                    "#,
                )
                .bind(payment_intent)
                .bind(record_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                let now = OffsetDateTime::now_utc();
                let Some(period_start) =
                    due_period_for_uncorrelated_payment(sub.next_billing_date, now)
                else {
                    // A direct charge already settled the period and moved
                    // the billing date forward; nothing left to book
                    tx.commit().await?;
                    tracing::info!(
                        subscription_id = %sub.id,
                        event_id = %envelope.id,
                        "Payment event matches no record and no period is due; acknowledged"
                    );
                    return Ok(WebhookOutcome::Ignored);
                };
                if PaymentService::find_paid_record(&mut tx, sub.id, period_start)
                    .await?
                    .is_some()
                {
                    tx.commit().await?;
                    return Ok(WebhookOutcome::Ignored);
                }
                let period_end = sub.billing_interval.next_billing_date(period_start);
                sqlx::query(
                    r#"
                    INSERT INTO billing_records
                        (subscription_id, user_id, amount_cents, currency, status,
                         due_date, billing_date, period_start, period_end,
                         provider_payment_intent_id, provider_invoice_id)
                    VALUES ($1, $2, $3, $4, 'paid', $5, NOW(), $6, $7, $8, $9)
                    "#,
                )
                .bind(sub.id)
                .bind(sub.user_id)
                .bind(amount.max(0))
                .bind(envelope.data.object.currency.as_deref().unwrap_or(&sub.currency))
                .bind(period_start)
                .bind(period_start)
                .bind(period_end)
                .bind(payment_intent)
                .bind(invoice_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        let ctx = TransitionContext::provider(format!(
            "invoice payment succeeded (event {})",
            envelope.id
        ));
        match LifecycleService::apply_in_tx(&mut tx, sub.id, Trigger::PaymentSucceeded, &ctx).await
        {
            Ok(updated) => {
                tx.commit().await?;
                dispatch_state_changed(
                    self.notifier.clone(),
                    updated.id,
                    updated.user_id,
                    updated.status,
                );
            }
            Err(BillingError::InvalidTransition { from, .. }) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    current_status = %from,
                    "Payment-succeeded event ignored for current status; record reconciled"
                );
                tx.commit().await?;
            }
            Err(other) => return Err(other),
        }

        Ok(WebhookOutcome::Applied)
    }

    /// Invoice payment failed: record the failure, bump counters, move the
    /// subscription toward `payment_failed` if its state permits.
    async fn apply_payment_failed(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.find_subscription(envelope).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let invoice_id = envelope.data.object.id.as_deref();
        let amount = envelope
            .data
            .object
            .amount_due
            .unwrap_or(sub.current_price_cents);
        let failure = format!("invoice payment failed (event {})", envelope.id);

        let mut tx = self.pool.begin().await?;

        let ctx = TransitionContext::provider(failure.clone());
        let mut track_counters = true;
        match LifecycleService::apply_in_tx(&mut tx, sub.id, Trigger::PaymentFailed, &ctx).await {
            Ok(_) => {}
            Err(BillingError::InvalidTransition { from, .. }) => {
                // A cancelled/expired row keeps its last recorded counters
                track_counters =
                    SubscriptionStatus::parse(&from).map_or(true, failure_tracking_applies);
                tracing::info!(
                    subscription_id = %sub.id,
                    current_status = %from,
                    "Payment-failed event recorded without status change"
                );
            }
            Err(other) => return Err(other),
        }

        // Correlate an existing record by invoice id, else record the
        // failed attempt fresh
        let updated = sqlx::query(
            r#"
            UPDATE billing_records SET
                status = 'failed', failure_message = $1, updated_at = NOW()
            WHERE subscription_id = $2 AND provider_invoice_id = $3 AND status != 'paid'
            "#,
        )
        .bind(&failure)
        .bind(sub.id)
        .bind(invoice_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let now = OffsetDateTime::now_utc();
            let period_start = sub.next_billing_date.unwrap_or(now);
            let period_end = sub.billing_interval.next_billing_date(period_start);
            sqlx::query(
                r#"
                INSERT INTO billing_records
                    (subscription_id, user_id, amount_cents, currency, status,
                     due_date, period_start, period_end, provider_invoice_id, failure_message)
                VALUES ($1, $2, $3, $4, 'failed', $5, $6, $7, $8, $9)
                "#,
            )
            .bind(sub.id)
            .bind(sub.user_id)
            .bind(amount.max(0))
            .bind(envelope.data.object.currency.as_deref().unwrap_or(&sub.currency))
            .bind(period_start)
            .bind(period_start)
            .bind(period_end)
            .bind(invoice_id)
            .bind(&failure)
            .execute(&mut *tx)
            .await?;
        }

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
            .bind(&failure)
            .bind(sub.id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sub.failed_payment_attempts
        };

        tx.commit().await?;

        if track_counters {
            dispatch_payment_failed(self.notifier.clone(), sub.id, sub.user_id, attempts, failure);
        }

        Ok(WebhookOutcome::Applied)
    }

    /// Remote subscription update: translate the provider's status
    /// vocabulary into a local trigger relative to the current state.
    async fn apply_remote_update(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.find_subscription(envelope).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let Some(remote_status) = envelope.data.object.status.as_deref() else {
            return Ok(WebhookOutcome::Ignored);
        };

        let Some(trigger) = trigger_for_remote_status(sub.status, remote_status) else {
            tracing::info!(
                subscription_id = %sub.id,
                local_status = %sub.status,
                remote_status = %remote_status,
                "Remote update carries no actionable delta; acknowledged"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let reason = format!("remote status '{remote_status}' (event {})", envelope.id);
        self.apply_trigger(&sub, trigger, &reason).await
    }

    /// Apply a fixed lifecycle trigger for subscription-shaped events.
    async fn apply_lifecycle_event(
        &self,
        envelope: &WebhookEnvelope,
        trigger: Trigger,
        reason: &str,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.find_subscription(envelope).await? else {
            return Ok(WebhookOutcome::Ignored);
        };
        self.apply_trigger(&sub, trigger, reason).await
    }

    async fn apply_trigger(
        &self,
        sub: &Subscription,
        trigger: Trigger,
        reason: &str,
    ) -> BillingResult<WebhookOutcome> {
        let lifecycle = LifecycleService::new(self.pool.clone());
        let ctx = TransitionContext::provider(reason);
        match lifecycle.apply_transition(sub.id, trigger, ctx).await {
            Ok(updated) => {
                dispatch_state_changed(
                    self.notifier.clone(),
                    updated.id,
                    updated.user_id,
                    updated.status,
                );
                Ok(WebhookOutcome::Applied)
            }
            Err(BillingError::InvalidTransition { from, trigger }) => {
                // Out-of-order delivery: the local state moved on. Log and
                // acknowledge; the provider must not retry this forever.
                tracing::info!(
                    subscription_id = %sub.id,
                    current_status = %from,
                    trigger = %trigger,
                    "Webhook transition invalid for current state; acknowledged as no-op"
                );
                Ok(WebhookOutcome::Ignored)
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn valid_signature_passes() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let header = sign(payload, "whsec_test_secret", 1_700_000_000);
        assert!(
            verify_signature(payload, &header, "whsec_test_secret", 300, 1_700_000_000).is_ok()
        );
    }

    #[test]
    fn tampered_payload_fails() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let header = sign(payload, "whsec_test_secret", 1_700_000_000);
        let tampered = r#"{"id":"evt_2","type":"invoice.paid"}"#;
        let result = verify_signature(tampered, &header, "whsec_test_secret", 300, 1_700_000_000);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[test]
    fn wrong_secret_fails() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_right", 1_700_000_000);
        let result = verify_signature(payload, &header, "whsec_wrong", 300, 1_700_000_000);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[test]
    fn stale_timestamp_fails() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_test_secret", 1_700_000_000);
        let result =
            verify_signature(payload, &header, "whsec_test_secret", 300, 1_700_000_000 + 301);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[test]
    fn timestamp_within_tolerance_passes() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_test_secret", 1_700_000_000);
        assert!(verify_signature(
            payload,
            &header,
            "whsec_test_secret",
            300,
            1_700_000_000 + 299
        )
        .is_ok());
    }

    #[test]
    fn missing_header_parts_fail() {
        let payload = r#"{"id":"evt_1"}"#;
        assert!(matches!(
            verify_signature(payload, "v1=deadbeef", "whsec_s", 300, 0),
            Err(BillingError::SignatureInvalid)
        ));
        assert!(matches!(
            verify_signature(payload, "t=12345", "whsec_s", 300, 12345),
            Err(BillingError::SignatureInvalid)
        ));
        assert!(matches!(
            verify_signature(payload, "", "whsec_s", 300, 0),
            Err(BillingError::SignatureInvalid)
        ));
    }

    #[test]
    fn envelope_tolerates_unknown_fields_and_types() {
        let payload = r#"{
            "id": "evt_42",
            "type": "billing.future_feature.launched",
            "created": 1700000000,
            "api_version": "2031-01-01",
            "data": {
                "object": {
                    "id": "obj_1",
                    "status": "mysterious",
                    "novel_field": {"nested": true}
                }
            },
            "extra_top_level": [1, 2, 3]
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_str(payload).unwrap();
        assert_eq!(envelope.id, "evt_42");
        assert_eq!(envelope.event_type, "billing.future_feature.launched");
        assert_eq!(envelope.data.object.status.as_deref(), Some("mysterious"));
        assert!(envelope.event_timestamp().is_some());
    }

    #[test]
    fn envelope_minimal_fields_suffice() {
        let envelope: WebhookEnvelope =
            serde_json::from_str(r#"{"id":"evt_min","type":"ping"}"#).unwrap();
        assert_eq!(envelope.id, "evt_min");
        assert!(envelope.data.object.id.is_none());
        assert!(envelope.event_timestamp().is_none());
    }

    #[test]
    fn remote_status_translation_respects_local_state() {
        use SubscriptionStatus::*;

        // Pause only lands on Active
        assert_eq!(
            trigger_for_remote_status(Active, "paused"),
            Some(Trigger::Pause)
        );
        assert_eq!(trigger_for_remote_status(TrialActive, "paused"), None);
        assert_eq!(trigger_for_remote_status(Cancelled, "paused"), None);

        // "active" resumes only a paused subscription
        assert_eq!(
            trigger_for_remote_status(Paused, "active"),
            Some(Trigger::Resume)
        );
        assert_eq!(trigger_for_remote_status(Active, "active"), None);

        // Remote cancel applies to any non-terminal state
        assert_eq!(
            trigger_for_remote_status(Active, "canceled"),
            Some(Trigger::Cancel)
        );
        assert_eq!(
            trigger_for_remote_status(PaymentFailed, "cancelled"),
            Some(Trigger::Cancel)
        );
        assert_eq!(trigger_for_remote_status(Cancelled, "canceled"), None);

        // Past-due moves an active subscription to payment_failed
        assert_eq!(
            trigger_for_remote_status(Active, "past_due"),
            Some(Trigger::PaymentFailed)
        );
        assert_eq!(trigger_for_remote_status(Paused, "past_due"), None);

        // Unknown remote vocabulary is never actionable
        assert_eq!(trigger_for_remote_status(Active, "hibernating"), None);
    }

    #[test]
    fn uncorrelated_payment_only_settles_a_due_period() {
        use time::macros::datetime;

        let now = datetime!(2026-06-15 00:00 UTC);

        // Billing date still ahead: a direct charge already settled the
        // period and advanced the date; booking would paint the next
        // period paid and starve its renewal
        assert_eq!(
            due_period_for_uncorrelated_payment(Some(datetime!(2026-07-01 00:00 UTC)), now),
            None
        );

        // A due or overdue period is open to settle
        assert_eq!(
            due_period_for_uncorrelated_payment(Some(datetime!(2026-06-01 00:00 UTC)), now),
            Some(datetime!(2026-06-01 00:00 UTC))
        );
        assert_eq!(due_period_for_uncorrelated_payment(Some(now), now), Some(now));

        // No billing date at all: nothing to settle
        assert_eq!(due_period_for_uncorrelated_payment(None, now), None);
    }
}
