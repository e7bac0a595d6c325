//! Idempotency ledger
//!
//! Durable record of provider event ids the engine has already seen.
//! Claiming is atomic: `INSERT ... ON CONFLICT ... RETURNING` means exactly
//! one concurrent delivery of an event id wins processing rights, even if
//! the provider redelivers while the first delivery is still in flight.
//!
//! A claim stuck in `processing` beyond the timeout can be re-claimed
//! (crash recovery), and a claim that finished in `error` can be re-claimed
//! so the provider's redelivery actually retries the work.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// How long a `processing` claim may sit before another delivery may steal it.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Terminal outcome of processing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The event's side effect was applied
    Applied,
    /// The event mapped to no action (unknown type, state-invalid transition)
    Ignored,
    /// Processing failed; the provider may redeliver
    Error,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Applied => "applied",
            ProcessingOutcome::Ignored => "ignored",
            ProcessingOutcome::Error => "error",
        }
    }
}

/// Result of attempting to claim an event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// This call owns processing of the event
    Claimed { ledger_id: Uuid },
    /// Another delivery already applied or ignored this event
    Duplicate { previous_outcome: String },
    /// Another delivery is actively processing this event right now
    InFlight,
}

/// A row in the ledger, exposed for audit and invariant checks.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessedEvent {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub event_timestamp: Option<OffsetDateTime>,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub processing_started_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    pool: PgPool,
}

impl IdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// The insert wins for new ids. The conflict branch re-claims rows that
    /// errored (provider retry) or whose `processing` claim has timed out.
    pub async fn claim(
        &self,
        provider_event_id: &str,
        event_type: &str,
        event_timestamp: Option<OffsetDateTime>,
    ) -> BillingResult<ClaimResult> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_events
                (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE processed_events.processing_result = 'error'
               OR (processed_events.processing_result = 'processing'
                   AND processed_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(provider_event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                provider_event_id = %provider_event_id,
                error = %e,
                "Failed to claim event in idempotency ledger"
            );
            BillingError::Database(e.to_string())
        })?;

        if let Some((ledger_id,)) = claimed {
            return Ok(ClaimResult::Claimed { ledger_id });
        }

        // Lost the claim: report why, for logging and the caller's response
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM processed_events WHERE provider_event_id = $1",
        )
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        Ok(lost_claim_result(existing.map(|(status,)| status)))
    }

    /// Record the terminal outcome for a claimed event.
    ///
    /// Retries once on failure; a stuck `processing` row would otherwise
    /// block redeliveries until the claim timeout.
    pub async fn finalize(
        &self,
        provider_event_id: &str,
        outcome: ProcessingOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let update = sqlx::query(
            r#"
            UPDATE processed_events
            SET processing_result = $1, error_message = $2
            WHERE provider_event_id = $3
            "#,
        )
        .bind(outcome.as_str())
        .bind(error_message)
        .bind(provider_event_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = update {
            tracing::warn!(
                provider_event_id = %provider_event_id,
                error = %e,
                "First attempt to finalize ledger entry failed, retrying"
            );

            sqlx::query(
                r#"
                UPDATE processed_events
                SET processing_result = $1, error_message = $2
                WHERE provider_event_id = $3
                "#,
            )
            .bind(outcome.as_str())
            .bind(error_message)
            .bind(provider_event_id)
            .execute(&self.pool)
            .await
            .map_err(|retry_err| {
                tracing::error!(
                    provider_event_id = %provider_event_id,
                    outcome = outcome.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to finalize ledger entry after retry; event may appear stuck in 'processing'"
                );
                BillingError::Database(retry_err.to_string())
            })?;
        }

        Ok(())
    }

    /// Look up a ledger row by event id.
    pub async fn get(&self, provider_event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        let row = sqlx::query_as(
            r#"
            SELECT id, provider_event_id, event_type, event_timestamp,
                   processing_result, error_message, processing_started_at, created_at
            FROM processed_events
            WHERE provider_event_id = $1
            "#,
        )
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Drop ledger rows older than the retention window. Returns rows deleted.
    ///
    /// Providers stop redelivering events after days, not months; rows past
    /// that horizon only cost storage.
    pub async fn cleanup_older_than(&self, retention_days: i64) -> BillingResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM processed_events
            WHERE created_at < NOW() - make_interval(days => $1)
              AND processing_result != 'processing'
            "#,
        )
        .bind(retention_days as i32)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

/// Classify a claim lost to another delivery from the row's recorded
/// result. A `processing` row (or one that vanished between the claim and
/// the read) means the other delivery is live right now; any terminal
/// result is a straight duplicate.
fn lost_claim_result(existing: Option<String>) -> ClaimResult {
    match existing {
        Some(status) if status == "processing" => ClaimResult::InFlight,
        Some(status) => ClaimResult::Duplicate {
            previous_outcome: status,
        },
        None => ClaimResult::InFlight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(ProcessingOutcome::Applied.as_str(), "applied");
        assert_eq!(ProcessingOutcome::Ignored.as_str(), "ignored");
        assert_eq!(ProcessingOutcome::Error.as_str(), "error");
    }

    #[test]
    fn lost_claims_classify_by_recorded_result() {
        // A live claim blocks redelivery without reapplying anything
        assert_eq!(
            lost_claim_result(Some("processing".to_string())),
            ClaimResult::InFlight
        );

        // Finished claims acknowledge the redelivery as a duplicate,
        // carrying the recorded outcome
        assert_eq!(
            lost_claim_result(Some("applied".to_string())),
            ClaimResult::Duplicate {
                previous_outcome: "applied".to_string()
            }
        );
        assert_eq!(
            lost_claim_result(Some("ignored".to_string())),
            ClaimResult::Duplicate {
                previous_outcome: "ignored".to_string()
            }
        );

        // Row gone between claim and read: treat as in flight, the
        // provider will redeliver
        assert_eq!(lost_claim_result(None), ClaimResult::InFlight);
    }
}
