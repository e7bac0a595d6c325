// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Subscription Engine
//!
//! Tests critical boundary conditions and race conditions in:
//! - Lifecycle transition table (SUB-L01 to SUB-L07)
//! - Charge retry policy (SUB-P01 to SUB-P03)
//! - Webhook signatures and pipeline gating (SUB-W01 to SUB-W06)
//! - Trial date math (SUB-T01 to SUB-T02)
//! - Billing intervals (SUB-B01 to SUB-B02)
//! - Result codes (SUB-R01 to SUB-R02)

#[cfg(test)]
mod lifecycle_table_tests {
    use crate::lifecycle::{permitted_transition, Trigger};
    use subsync_shared::SubscriptionStatus;

    const ALL_STATUSES: [SubscriptionStatus; 7] = [
        SubscriptionStatus::TrialActive,
        SubscriptionStatus::Active,
        SubscriptionStatus::Paused,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Expired,
        SubscriptionStatus::TrialExpired,
        SubscriptionStatus::PaymentFailed,
    ];

    const ALL_TRIGGERS: [Trigger; 9] = [
        Trigger::ConvertTrial,
        Trigger::ExpireTrial,
        Trigger::Pause,
        Trigger::Resume,
        Trigger::Cancel,
        Trigger::PaymentSucceeded,
        Trigger::PaymentFailed,
        Trigger::Expire,
        Trigger::Reactivate,
    ];

    // =========================================================================
    // SUB-L01: Terminal statuses accept no trigger whatsoever
    // =========================================================================
    #[test]
    fn test_terminal_statuses_are_absorbing() {
        for status in [SubscriptionStatus::Cancelled, SubscriptionStatus::Expired] {
            for trigger in ALL_TRIGGERS {
                assert!(
                    permitted_transition(status, trigger).is_none(),
                    "{:?} must not accept {:?}",
                    status,
                    trigger
                );
            }
        }
    }

    // =========================================================================
    // SUB-L02: Reactivation is rejected from every status
    // =========================================================================
    #[test]
    fn test_reactivate_never_permitted() {
        for status in ALL_STATUSES {
            assert!(
                permitted_transition(status, Trigger::Reactivate).is_none(),
                "reactivate must be rejected from {:?}",
                status
            );
        }
    }

    // =========================================================================
    // SUB-L03: Pause only leaves Active; Resume only leaves Paused
    // =========================================================================
    #[test]
    fn test_pause_resume_are_narrow() {
        for status in ALL_STATUSES {
            let pause = permitted_transition(status, Trigger::Pause);
            let resume = permitted_transition(status, Trigger::Resume);

            if status == SubscriptionStatus::Active {
                assert_eq!(pause, Some(SubscriptionStatus::Paused));
            } else {
                assert!(pause.is_none(), "pause must be rejected from {:?}", status);
            }

            if status == SubscriptionStatus::Paused {
                assert_eq!(resume, Some(SubscriptionStatus::Active));
            } else {
                assert!(resume.is_none(), "resume must be rejected from {:?}", status);
            }
        }
    }

    // =========================================================================
    // SUB-L04: Cancel is permitted from every non-terminal status
    // =========================================================================
    #[test]
    fn test_cancel_reachable_from_all_non_terminal() {
        for status in ALL_STATUSES {
            let cancel = permitted_transition(status, Trigger::Cancel);
            if status.is_terminal() {
                assert!(cancel.is_none());
            } else {
                assert_eq!(
                    cancel,
                    Some(SubscriptionStatus::Cancelled),
                    "cancel must work from {:?}",
                    status
                );
            }
        }
    }

    // =========================================================================
    // SUB-L05: payment_failed loops on further failures, recovers on success
    // =========================================================================
    #[test]
    fn test_payment_failed_loop_and_recovery() {
        assert_eq!(
            permitted_transition(SubscriptionStatus::PaymentFailed, Trigger::PaymentFailed),
            Some(SubscriptionStatus::PaymentFailed)
        );
        assert_eq!(
            permitted_transition(SubscriptionStatus::PaymentFailed, Trigger::PaymentSucceeded),
            Some(SubscriptionStatus::Active)
        );
    }

    // =========================================================================
    // SUB-L06: Both trial statuses convert to Active, nothing else converts
    // =========================================================================
    #[test]
    fn test_conversion_only_from_trials() {
        for status in ALL_STATUSES {
            let converted = permitted_transition(status, Trigger::ConvertTrial);
            match status {
                SubscriptionStatus::TrialActive | SubscriptionStatus::TrialExpired => {
                    assert_eq!(converted, Some(SubscriptionStatus::Active));
                }
                _ => assert!(
                    converted.is_none(),
                    "convert_trial must be rejected from {:?}",
                    status
                ),
            }
        }
    }

    // =========================================================================
    // SUB-L07: No permitted transition targets a state the table cannot leave
    //          except the two terminal states
    // =========================================================================
    #[test]
    fn test_only_terminal_states_are_dead_ends() {
        for status in ALL_STATUSES {
            let has_exit = ALL_TRIGGERS
                .iter()
                .any(|t| permitted_transition(status, *t).is_some_and(|to| to != status));
            assert_eq!(
                has_exit,
                !status.is_terminal(),
                "{:?} exit paths disagree with terminality",
                status
            );
        }
    }
}

#[cfg(test)]
mod charge_retry_tests {
    use crate::payments::charge_with_retry;
    use crate::provider::{
        ChargeRequest, MockChargeOutcome, MockProviderClient, ProviderError,
    };

    fn request() -> ChargeRequest {
        ChargeRequest {
            payment_method_id: "pm_test".to_string(),
            amount_cents: 2900,
            currency: "usd".to_string(),
            idempotency_key: "sub:1700000000".to_string(),
        }
    }

    // =========================================================================
    // SUB-P01: max_attempts = 1 means exactly one provider call, no retry
    // =========================================================================
    #[tokio::test]
    async fn test_single_attempt_budget_never_retries() {
        let provider = MockProviderClient::new().with_charge_outcomes(vec![
            MockChargeOutcome::Transient {
                message: "gateway timeout".to_string(),
            },
            MockChargeOutcome::Success {
                payment_intent_id: "pi_never_reached".to_string(),
            },
        ]);

        let result = charge_with_retry(&provider, request(), 1, 1).await;

        assert!(matches!(result, Err(ProviderError::Transient(_))));
        assert_eq!(provider.charge_calls().len(), 1);
    }

    // =========================================================================
    // SUB-P02: Every retry reuses the same idempotency key
    // =========================================================================
    #[tokio::test]
    async fn test_retries_share_idempotency_key() {
        let provider = MockProviderClient::new().with_charge_outcomes(vec![
            MockChargeOutcome::Transient {
                message: "503".to_string(),
            },
            MockChargeOutcome::Transient {
                message: "503".to_string(),
            },
            MockChargeOutcome::Success {
                payment_intent_id: "pi_third_try".to_string(),
            },
        ]);

        charge_with_retry(&provider, request(), 3, 1).await.unwrap();

        let calls = provider.charge_calls();
        assert_eq!(calls.len(), 3);
        assert!(calls
            .iter()
            .all(|c| c.idempotency_key == "sub:1700000000"));
    }

    // =========================================================================
    // SUB-P03: A rejection after a transient failure stops the retry loop
    // =========================================================================
    #[tokio::test]
    async fn test_rejection_mid_retry_stops_immediately() {
        let provider = MockProviderClient::new().with_charge_outcomes(vec![
            MockChargeOutcome::Transient {
                message: "502".to_string(),
            },
            MockChargeOutcome::Rejected {
                message: "card declined".to_string(),
            },
            MockChargeOutcome::Success {
                payment_intent_id: "pi_never_reached".to_string(),
            },
        ]);

        let result = charge_with_retry(&provider, request(), 5, 1).await;

        assert!(matches!(result, Err(ProviderError::Rejected(_))));
        assert_eq!(provider.charge_calls().len(), 2);
    }
}

#[cfg(test)]
mod webhook_signature_tests {
    use crate::error::BillingError;
    use crate::webhooks::verify_signature;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn sign_header(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    // =========================================================================
    // SUB-W01: Extra header segments (v0, unknown keys) do not break parsing
    // =========================================================================
    #[test]
    fn test_extra_header_segments_tolerated() {
        let payload = r#"{"id":"evt_1"}"#;
        let base = sign_header(payload, "whsec_s", 1_700_000_000);
        let header = format!("{},v0=legacy,scheme=hmac", base);
        assert!(verify_signature(payload, &header, "whsec_s", 300, 1_700_000_000).is_ok());
    }

    // =========================================================================
    // SUB-W02: Timestamp exactly at the tolerance boundary is accepted
    // =========================================================================
    #[test]
    fn test_tolerance_boundary_inclusive() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_header(payload, "whsec_s", 1_700_000_000);
        assert!(
            verify_signature(payload, &header, "whsec_s", 300, 1_700_000_000 + 300).is_ok()
        );
        assert!(matches!(
            verify_signature(payload, &header, "whsec_s", 300, 1_700_000_000 + 301),
            Err(BillingError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // SUB-W03: Timestamps from the future are held to the same tolerance
    // =========================================================================
    #[test]
    fn test_future_timestamp_rejected_past_tolerance() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_header(payload, "whsec_s", 1_700_000_000 + 400);
        assert!(matches!(
            verify_signature(payload, &header, "whsec_s", 300, 1_700_000_000),
            Err(BillingError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // SUB-W04: Secret works with and without the whsec_ prefix
    // =========================================================================
    #[test]
    fn test_secret_prefix_is_optional() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_header(payload, "whsec_shared", 1_700_000_000);
        assert!(verify_signature(payload, &header, "whsec_shared", 300, 1_700_000_000).is_ok());
        assert!(verify_signature(payload, &header, "shared", 300, 1_700_000_000).is_ok());
    }
}

#[cfg(test)]
mod webhook_pipeline_tests {
    use std::sync::Arc;

    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use sqlx::postgres::PgPoolOptions;
    use time::OffsetDateTime;

    use crate::config::ProviderConfig;
    use crate::error::BillingError;
    use crate::notify::LogNotifier;
    use crate::webhooks::WebhookHandler;

    // A lazy pool opens no connection until a query runs; the host here is
    // unreachable, so any storage access would surface as a Database
    // error. The assertions below therefore prove the pipeline rejects
    // BEFORE touching the ledger or any subscription row.
    fn handler() -> WebhookHandler {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://unreachable.invalid/subsync")
            .unwrap();
        WebhookHandler::new(pool, Arc::new(LogNotifier), ProviderConfig::for_tests())
    }

    fn sign_header(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    // =========================================================================
    // SUB-W05: An invalid signature rejects with no ledger write and no
    //          subscription mutation
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_signature_rejects_before_storage() {
        let handler = handler();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("t={},v1=deadbeef", now);

        let result = handler
            .handle_webhook(r#"{"id":"evt_1","type":"ping"}"#, &header)
            .await;

        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    // =========================================================================
    // SUB-W06: An authenticated but malformed payload rejects before any
    //          ledger claim
    // =========================================================================
    #[tokio::test]
    async fn test_malformed_payload_rejects_before_ledger() {
        let handler = handler();
        let payload = "not an event envelope";
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign_header(payload, "whsec_test_secret", now);

        let result = handler.handle_webhook(payload, &header).await;

        assert!(matches!(result, Err(BillingError::Validation(_))));
    }
}

#[cfg(test)]
mod trial_date_tests {
    use crate::trials::extended_trial_dates;
    use time::macros::datetime;

    // =========================================================================
    // SUB-T01: Year-long extensions stay self-consistent
    // =========================================================================
    #[test]
    fn test_long_extension_keeps_dates_aligned() {
        let trial_end = datetime!(2026-01-15 12:00 UTC);
        let (new_end, new_billing) = extended_trial_dates(trial_end, Some(trial_end), 365);
        assert_eq!(new_end, datetime!(2027-01-15 12:00 UTC));
        assert_eq!(new_billing, new_end);
    }

    // =========================================================================
    // SUB-T02: A billing date already past the trial end keeps its distance
    // =========================================================================
    #[test]
    fn test_later_billing_date_shifts_with_extension() {
        let trial_end = datetime!(2026-03-01 00:00 UTC);
        let billing = datetime!(2026-03-05 00:00 UTC);
        let (new_end, new_billing) = extended_trial_dates(trial_end, Some(billing), 10);
        assert_eq!(new_end, datetime!(2026-03-11 00:00 UTC));
        assert_eq!(new_billing, datetime!(2026-03-15 00:00 UTC));
    }
}

#[cfg(test)]
mod billing_interval_tests {
    use subsync_shared::BillingInterval;
    use time::macros::datetime;

    // =========================================================================
    // SUB-B01: Periods are fixed-length, independent of calendar months
    // =========================================================================
    #[test]
    fn test_fixed_length_periods() {
        let start = datetime!(2026-01-31 00:00 UTC);
        assert_eq!(
            BillingInterval::Monthly.next_billing_date(start),
            datetime!(2026-03-02 00:00 UTC)
        );
        assert_eq!(
            BillingInterval::Annual.next_billing_date(start),
            datetime!(2027-01-31 00:00 UTC)
        );
    }

    // =========================================================================
    // SUB-B02: Chained monthly periods drift from the annual period
    // =========================================================================
    #[test]
    fn test_twelve_monthly_periods_are_not_one_annual() {
        let start = datetime!(2026-01-01 00:00 UTC);
        let mut date = start;
        for _ in 0..12 {
            date = BillingInterval::Monthly.next_billing_date(date);
        }
        // 12 * 30 = 360 days vs 365
        assert!(date < BillingInterval::Annual.next_billing_date(start));
    }
}

#[cfg(test)]
mod result_code_tests {
    use crate::error::BillingError;
    use crate::response::{status_code_for, ServiceResponse};

    // =========================================================================
    // SUB-R01: Conflict-shaped failures all map to 409
    // =========================================================================
    #[test]
    fn test_conflict_family_maps_to_409() {
        let conflicts = [
            BillingError::InvalidTransition {
                from: "cancelled".into(),
                trigger: "reactivate".into(),
            },
            BillingError::AlreadyPaid("sub".into()),
            BillingError::ConcurrentModification("sub".into()),
        ];
        for err in conflicts {
            assert_eq!(status_code_for(&err), 409, "{err}");
        }
    }

    // =========================================================================
    // SUB-R02: Duplicate webhook deliveries acknowledge with success
    // =========================================================================
    #[test]
    fn test_duplicate_event_is_not_a_failure() {
        let response: ServiceResponse<()> =
            ServiceResponse::from_error(&BillingError::DuplicateEvent("evt_1".into()));
        assert_eq!(response.code, 200);
        assert!(response.is_success());
    }
}
