//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the subscription engine.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Subscription(s) affected
    pub subscription_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - system may be charging incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for paid records missing a payment intent
#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutIntentRow {
    record_id: Uuid,
    subscription_id: Uuid,
    amount_cents: i64,
}

/// Row type for terminal subscriptions missing their metadata
#[derive(Debug, sqlx::FromRow)]
struct TerminalMetadataRow {
    subscription_id: Uuid,
    status: String,
}

/// Row type for active subscriptions carrying failure counters
#[derive(Debug, sqlx::FromRow)]
struct ActiveWithFailuresRow {
    subscription_id: Uuid,
    status: String,
    failed_payment_attempts: i32,
}

/// Row type for billable subscriptions without a billing date
#[derive(Debug, sqlx::FromRow)]
struct BillableWithoutDateRow {
    subscription_id: Uuid,
    status: String,
}

/// Row type for duplicate paid records in one billing period
#[derive(Debug, sqlx::FromRow)]
struct DoublePaidPeriodRow {
    subscription_id: Uuid,
    period_start: OffsetDateTime,
    paid_count: i64,
}

/// Row type for transitions missing a history record
#[derive(Debug, sqlx::FromRow)]
struct UnrecordedTransitionRow {
    subscription_id: Uuid,
    status: String,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_paid_records_have_intent().await?);
        violations.extend(self.check_terminal_metadata_present().await?);
        violations.extend(self.check_active_counters_clear().await?);
        violations.extend(self.check_billable_has_billing_date().await?);
        violations.extend(self.check_single_paid_record_per_period().await?);
        violations.extend(self.check_transitions_recorded().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: Paid billing records carry a payment-intent id
    ///
    /// A paid record without a provider payment intent means money moved
    /// with no provider-side reference, or a record was marked paid locally
    /// without a charge.
    async fn check_paid_records_have_intent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutIntentRow> = sqlx::query_as(
            r#"
            SELECT id as record_id, subscription_id, amount_cents
            FROM billing_records
            WHERE status = 'paid'
              AND provider_payment_intent_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_records_have_intent".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: format!(
                    "Paid billing record for ${:.2} has no provider payment intent",
                    row.amount_cents as f64 / 100.0
                ),
                context: serde_json::json!({
                    "record_id": row.record_id,
                    "amount_cents": row.amount_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Terminal subscriptions carry their terminal metadata
    ///
    /// A cancelled subscription must have a cancellation timestamp and
    /// reason; without them the audit trail cannot say why access ended.
    async fn check_terminal_metadata_present(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TerminalMetadataRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, status
            FROM subscriptions
            WHERE status = 'cancelled'
              AND (cancelled_at IS NULL OR cancellation_reason IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_metadata_present".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: "Cancelled subscription is missing cancelled_at or reason"
                    .to_string(),
                context: serde_json::json!({
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Active subscriptions have clear failure counters
    ///
    /// Every path back to `active` resets the failed-attempt counter; a
    /// non-zero counter on an active subscription means a reset was missed
    /// and the recovery sweep may misjudge it.
    async fn check_active_counters_clear(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ActiveWithFailuresRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, status, failed_payment_attempts
            FROM subscriptions
            WHERE status = 'active'
              AND failed_payment_attempts > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_counters_clear".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: format!(
                    "Active subscription still shows {} failed payment attempts",
                    row.failed_payment_attempts
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "failed_payment_attempts": row.failed_payment_attempts,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: Billable subscriptions have a next billing date
    ///
    /// `active` and `trial_active` rows with a null next billing date fall
    /// out of every renewal query and silently stop being charged.
    async fn check_billable_has_billing_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BillableWithoutDateRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, status
            FROM subscriptions
            WHERE status IN ('active', 'trial_active')
              AND next_billing_date IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "billable_has_billing_date".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: format!(
                    "Subscription in status '{}' has no next billing date",
                    row.status
                ),
                context: serde_json::json!({
                    "status": row.status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: At most one paid record per billing period
    ///
    /// Two paid records for the same subscription-period means the same
    /// period was charged twice.
    async fn check_single_paid_record_per_period(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DoublePaidPeriodRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, period_start, COUNT(*) as paid_count
            FROM billing_records
            WHERE status = 'paid'
            GROUP BY subscription_id, period_start
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_paid_record_per_period".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: format!(
                    "Billing period starting {} has {} paid records (expected 1)",
                    row.period_start, row.paid_count
                ),
                context: serde_json::json!({
                    "period_start": row.period_start.unix_timestamp(),
                    "paid_count": row.paid_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: Every subscription has a recorded history trail
    ///
    /// Each subscription writes a history row at creation and at every
    /// accepted transition; a row with no trail at all was mutated outside
    /// the engine.
    async fn check_transitions_recorded(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnrecordedTransitionRow> = sqlx::query_as(
            r#"
            SELECT s.id as subscription_id, s.status
            FROM subscriptions s
            WHERE NOT EXISTS (
                SELECT 1 FROM subscription_status_history h
                WHERE h.subscription_id = s.id
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "transitions_recorded".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: format!(
                    "Subscription in status '{}' has no status history at all",
                    row.status
                ),
                context: serde_json::json!({
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "paid_records_have_intent" => self.check_paid_records_have_intent().await,
            "terminal_metadata_present" => self.check_terminal_metadata_present().await,
            "active_counters_clear" => self.check_active_counters_clear().await,
            "billable_has_billing_date" => self.check_billable_has_billing_date().await,
            "single_paid_record_per_period" => self.check_single_paid_record_per_period().await,
            "transitions_recorded" => self.check_transitions_recorded().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "paid_records_have_intent",
            "terminal_metadata_present",
            "active_counters_clear",
            "billable_has_billing_date",
            "single_paid_record_per_period",
            "transitions_recorded",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"paid_records_have_intent"));
        assert!(checks.contains(&"single_paid_record_per_period"));
    }
}
