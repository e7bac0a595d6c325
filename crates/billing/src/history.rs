//! Status history recorder
//!
//! Append-only audit trail of accepted lifecycle transitions: one row per
//! transition, written inside the same transaction as the status change so
//! the trail can never disagree with the subscription row. Read-only
//! consumers (reporting, audit) query it through the accessors here.

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use subsync_shared::SubscriptionStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Who or what caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    Admin,
    System,
    Provider,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::User => "user",
            Actor::Admin => "admin",
            Actor::System => "system",
            Actor::Provider => "provider",
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One accepted transition.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StatusHistoryEntry {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor: String,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Appends and reads `subscription_status_history`.
#[derive(Clone)]
pub struct StatusHistoryRecorder {
    pool: PgPool,
}

impl StatusHistoryRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a history row inside the caller's transaction.
    pub async fn record_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
        from_status: Option<SubscriptionStatus>,
        to_status: SubscriptionStatus,
        actor: Actor,
        reason: Option<&str>,
        metadata: serde_json::Value,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_status_history
                (subscription_id, from_status, to_status, actor, reason, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(subscription_id)
        .bind(from_status.map(|s| s.as_str()))
        .bind(to_status.as_str())
        .bind(actor.as_str())
        .bind(reason)
        .bind(metadata)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Full transition trail for one subscription, oldest first.
    pub async fn for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<StatusHistoryEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT id, subscription_id, from_status, to_status, actor, reason, metadata, created_at
            FROM subscription_status_history
            WHERE subscription_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Recent transitions across all subscriptions, for audit consumers.
    pub async fn recent(&self, limit: i64) -> BillingResult<Vec<StatusHistoryEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT id, subscription_id, from_status, to_status, actor, reason, metadata, created_at
            FROM subscription_status_history
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_labels_are_stable() {
        assert_eq!(Actor::User.as_str(), "user");
        assert_eq!(Actor::Admin.as_str(), "admin");
        assert_eq!(Actor::System.as_str(), "system");
        assert_eq!(Actor::Provider.as_str(), "provider");
    }
}
