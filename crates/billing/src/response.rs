//! Service result surface
//!
//! Every exposed subscription/billing operation returns a [`ServiceResponse`]
//! carrying a status code, a human-readable message, and an optional payload.
//! Callers (HTTP layer, admin tooling) translate the code directly; no
//! unhandled errors cross this boundary.

use serde::Serialize;

use crate::error::BillingError;

/// Structured operation result.
///
/// Code taxonomy: 200 success, 201 created, 400 invalid request or
/// business-rule violation, 403 unauthorized, 404 not found, 409 conflict,
/// 502 provider failure, 500 internal failure.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceResponse<T> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ServiceResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            code: 200,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn created(message: impl Into<String>, data: T) -> Self {
        Self {
            code: 201,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn from_error(err: &BillingError) -> Self {
        Self {
            code: status_code_for(err),
            message: err.to_string(),
            data: None,
        }
    }
}

impl<T> From<BillingError> for ServiceResponse<T> {
    fn from(err: BillingError) -> Self {
        ServiceResponse::from_error(&err)
    }
}

/// Map an engine error to its result status code.
pub fn status_code_for(err: &BillingError) -> u16 {
    match err {
        BillingError::Validation(_) | BillingError::ProviderRejected(_) => 400,
        BillingError::Unauthorized(_) | BillingError::SignatureInvalid => 403,
        BillingError::NotFound(_) => 404,
        BillingError::InvalidTransition { .. }
        | BillingError::AlreadyPaid(_)
        | BillingError::ConcurrentModification(_) => 409,
        // Idempotent replays are acknowledged, not failed
        BillingError::DuplicateEvent(_) => 200,
        BillingError::ProviderUnavailable(_) => 502,
        BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            status_code_for(&BillingError::Validation("x".into())),
            400
        );
        assert_eq!(
            status_code_for(&BillingError::ProviderRejected("declined".into())),
            400
        );
        assert_eq!(status_code_for(&BillingError::SignatureInvalid), 403);
        assert_eq!(status_code_for(&BillingError::NotFound("x".into())), 404);
        assert_eq!(
            status_code_for(&BillingError::InvalidTransition {
                from: "cancelled".into(),
                trigger: "resume".into()
            }),
            409
        );
        assert_eq!(
            status_code_for(&BillingError::DuplicateEvent("evt_1".into())),
            200
        );
        assert_eq!(
            status_code_for(&BillingError::ProviderUnavailable("timeout".into())),
            502
        );
        assert_eq!(status_code_for(&BillingError::Internal("x".into())), 500);
    }

    #[test]
    fn success_constructors() {
        let ok: ServiceResponse<u32> = ServiceResponse::ok("done", 7);
        assert_eq!(ok.code, 200);
        assert!(ok.is_success());

        let created: ServiceResponse<u32> = ServiceResponse::created("made", 7);
        assert_eq!(created.code, 201);
        assert!(created.is_success());

        let failed: ServiceResponse<u32> = BillingError::NotFound("sub".into()).into();
        assert!(!failed.is_success());
        assert!(failed.data.is_none());
    }
}
