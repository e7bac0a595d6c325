//! Billing engine error taxonomy
//!
//! Every failure crossing the engine boundary is one of these variants.
//! Transient provider failures (`ProviderUnavailable`) are the only errors
//! the engine retries on its own; everything else is returned to the caller.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Bad input from the caller (missing metadata, empty reason, etc.)
    #[error("validation error: {0}")]
    Validation(String),

    /// The current lifecycle status does not permit the requested trigger
    #[error("invalid transition: cannot apply '{trigger}' from status '{from}'")]
    InvalidTransition { from: String, trigger: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Authorization failure raised by the embedding surface. The engine
    /// performs no auth of its own; the variant keeps the code mapping
    /// complete for callers that do.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transient provider failure (timeout, 5xx, rate limit) after retries
    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Permanent provider rejection (e.g. card declined); never retried
    #[error("payment provider rejected the request: {0}")]
    ProviderRejected(String),

    /// Webhook event id already processed; acknowledged, never a failure.
    /// The pipeline itself reports duplicates as successful receipts; this
    /// variant is for surfaces that turn a
    /// [`crate::ledger::ClaimResult::Duplicate`] into an error-shaped
    /// response (still mapped to a success code).
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    /// Webhook signature/HMAC verification failed
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    /// A paid billing record already exists for this billing period.
    /// `process_payment` reports this as the successful
    /// [`crate::payments::PaymentOutcome::AlreadyPaid`] outcome; the
    /// variant carries the 409 shape for surfaces that treat a repeated
    /// charge request as a conflict.
    #[error("billing period already paid for subscription {0}")]
    AlreadyPaid(String),

    /// Optimistic lock or claim lost to a concurrent operation
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the engine may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::ProviderUnavailable(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_provider_unavailable_is_transient() {
        assert!(BillingError::ProviderUnavailable("timeout".into()).is_transient());
        assert!(!BillingError::ProviderRejected("card declined".into()).is_transient());
        assert!(!BillingError::Validation("bad".into()).is_transient());
        assert!(!BillingError::SignatureInvalid.is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
