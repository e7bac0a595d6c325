//! Shared domain types for subsync
//!
//! Reference data used by the billing engine and the worker: subscription
//! lifecycle statuses, billing record statuses, billing intervals, and the
//! plan catalog. Pure data types only; no I/O and no async.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Lifecycle status of a subscription.
///
/// Exactly one status holds at a time. The boolean views (`is_active` etc.)
/// are projections of this enum and can never disagree with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    TrialActive,
    Active,
    Paused,
    Cancelled,
    Expired,
    TrialExpired,
    PaymentFailed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::TrialActive => "trial_active",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::TrialExpired => "trial_expired",
            SubscriptionStatus::PaymentFailed => "payment_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trial_active" => Some(SubscriptionStatus::TrialActive),
            "active" => Some(SubscriptionStatus::Active),
            "paused" => Some(SubscriptionStatus::Paused),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "expired" => Some(SubscriptionStatus::Expired),
            "trial_expired" => Some(SubscriptionStatus::TrialExpired),
            "payment_failed" => Some(SubscriptionStatus::PaymentFailed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SubscriptionStatus::Paused)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, SubscriptionStatus::Expired)
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }

    /// Statuses for which `next_billing_date` is meaningful.
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::TrialActive
                | SubscriptionStatus::Active
                | SubscriptionStatus::PaymentFailed
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single billing record (one charge attempt / invoice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "pending",
            BillingStatus::Paid => "paid",
            BillingStatus::Failed => "failed",
            BillingStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BillingStatus::Pending),
            "paid" => Some(BillingStatus::Paid),
            "failed" => Some(BillingStatus::Failed),
            "refunded" => Some(BillingStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing cadence of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Annual,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingInterval::Monthly),
            "annual" => Some(BillingInterval::Annual),
            _ => None,
        }
    }

    /// Next billing date one period after `from`.
    ///
    /// Fixed-length periods (30/365 days) keep the arithmetic independent of
    /// calendar month lengths, matching how the provider reports
    /// `current_period_end`.
    pub fn next_billing_date(&self, from: OffsetDateTime) -> OffsetDateTime {
        match self {
            BillingInterval::Monthly => from + Duration::days(30),
            BillingInterval::Annual => from + Duration::days(365),
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription plan configuration.
///
/// The plan catalog is read-only reference data from the engine's
/// perspective; CRUD for it lives elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub trial_days: i64,
    /// Price id on the payment provider side, empty until provisioned.
    pub provider_price_id: String,
}

impl Plan {
    /// Starter plan: monthly, 14-day trial
    pub fn starter(provider_price_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "starter".to_string(),
            price_cents: 900,
            currency: "usd".to_string(),
            interval: BillingInterval::Monthly,
            trial_days: 14,
            provider_price_id: provider_price_id.to_string(),
        }
    }

    /// Standard plan: monthly, 14-day trial
    pub fn standard(provider_price_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "standard".to_string(),
            price_cents: 2900,
            currency: "usd".to_string(),
            interval: BillingInterval::Monthly,
            trial_days: 14,
            provider_price_id: provider_price_id.to_string(),
        }
    }

    /// Premium plan: annual, no trial
    pub fn premium(provider_price_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "premium".to_string(),
            price_cents: 29900,
            currency: "usd".to_string(),
            interval: BillingInterval::Annual,
            trial_days: 0,
            provider_price_id: provider_price_id.to_string(),
        }
    }

    pub fn has_trial(&self) -> bool {
        self.trial_days > 0
    }

    /// Initial lifecycle status for a new subscription on this plan.
    pub fn initial_status(&self) -> SubscriptionStatus {
        if self.has_trial() {
            SubscriptionStatus::TrialActive
        } else {
            SubscriptionStatus::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        let all = [
            SubscriptionStatus::TrialActive,
            SubscriptionStatus::Active,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
            SubscriptionStatus::TrialExpired,
            SubscriptionStatus::PaymentFailed,
        ];
        for status in all {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::parse("bogus"), None);
    }

    #[test]
    fn projections_agree_with_status() {
        assert!(SubscriptionStatus::Active.is_active());
        assert!(!SubscriptionStatus::Active.is_paused());
        assert!(SubscriptionStatus::Paused.is_paused());
        assert!(SubscriptionStatus::Cancelled.is_cancelled());
        assert!(SubscriptionStatus::Expired.is_expired());
        assert!(!SubscriptionStatus::TrialActive.is_active());
    }

    #[test]
    fn terminal_statuses() {
        assert!(SubscriptionStatus::Cancelled.is_terminal());
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert!(!SubscriptionStatus::PaymentFailed.is_terminal());
        assert!(!SubscriptionStatus::TrialExpired.is_terminal());
    }

    #[test]
    fn billable_statuses_carry_next_billing_date() {
        assert!(SubscriptionStatus::TrialActive.is_billable());
        assert!(SubscriptionStatus::Active.is_billable());
        assert!(SubscriptionStatus::PaymentFailed.is_billable());
        assert!(!SubscriptionStatus::Paused.is_billable());
        assert!(!SubscriptionStatus::Cancelled.is_billable());
    }

    #[test]
    fn initial_status_follows_trial_config() {
        assert_eq!(
            Plan::starter("price_starter").initial_status(),
            SubscriptionStatus::TrialActive
        );
        assert_eq!(
            Plan::premium("price_premium").initial_status(),
            SubscriptionStatus::Active
        );
    }

    #[test]
    fn interval_advances_billing_date() {
        let from = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(
            BillingInterval::Monthly.next_billing_date(from) - from,
            Duration::days(30)
        );
        assert_eq!(
            BillingInterval::Annual.next_billing_date(from) - from,
            Duration::days(365)
        );
    }
}
