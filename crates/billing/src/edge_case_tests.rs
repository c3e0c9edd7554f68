// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Ledger
//!
//! Tests critical boundary conditions in:
//! - Subscription lifecycle (PAY-L01 to PAY-L07)
//! - Webhook signatures (PAY-W01 to PAY-W06)
//! - Invoice line items (PAY-I01 to PAY-I04)
//! - Refund proration (PAY-RF01 to PAY-RF04)
//! - Error taxonomy (PAY-E01 to PAY-E03)

#[cfg(test)]
mod lifecycle_tests {
    use crate::error::BillingError;
    use crate::subscriptions::{next_status, LifecycleEvent};
    use ledgerpay_shared::SubscriptionStatus;

    // =========================================================================
    // PAY-L01: Full happy path pending -> active -> active -> cancelled
    // =========================================================================
    #[test]
    fn test_happy_path_sequence() {
        let mut status = SubscriptionStatus::Pending;
        status = next_status(status, LifecycleEvent::PaymentConfirmed).unwrap();
        assert_eq!(status, SubscriptionStatus::Active);
        status = next_status(status, LifecycleEvent::PaymentConfirmed).unwrap();
        assert_eq!(status, SubscriptionStatus::Active);
        status = next_status(status, LifecycleEvent::UserCancelled).unwrap();
        assert_eq!(status, SubscriptionStatus::Cancelled);
    }

    // =========================================================================
    // PAY-L02: Dunning path active -> past_due -> active (late recovery)
    // =========================================================================
    #[test]
    fn test_dunning_recovery_sequence() {
        let mut status = SubscriptionStatus::Active;
        status = next_status(status, LifecycleEvent::RenewalFailed).unwrap();
        assert_eq!(status, SubscriptionStatus::PastDue);
        status = next_status(status, LifecycleEvent::PaymentConfirmed).unwrap();
        assert_eq!(status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // PAY-L03: Dunning path active -> past_due -> expired (grace elapsed)
    // =========================================================================
    #[test]
    fn test_dunning_expiry_sequence() {
        let mut status = SubscriptionStatus::Active;
        status = next_status(status, LifecycleEvent::RenewalFailed).unwrap();
        status = next_status(status, LifecycleEvent::GraceElapsed).unwrap();
        assert_eq!(status, SubscriptionStatus::Expired);
    }

    // =========================================================================
    // PAY-L04: Payment confirmation after expiry must not resurrect
    // =========================================================================
    #[test]
    fn test_payment_after_expiry_rejected() {
        let err =
            next_status(SubscriptionStatus::Expired, LifecycleEvent::PaymentConfirmed)
                .unwrap_err();
        match err {
            BillingError::InvalidTransition { from, event } => {
                assert_eq!(from, "expired");
                assert_eq!(event, "payment_confirmed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // =========================================================================
    // PAY-L05: Cancellation after cancellation is not a valid transition
    //          (service-level cancel handles idempotency before the machine)
    // =========================================================================
    #[test]
    fn test_double_cancel_rejected_by_machine() {
        assert!(
            next_status(SubscriptionStatus::Cancelled, LifecycleEvent::UserCancelled).is_err()
        );
    }

    // =========================================================================
    // PAY-L06: Renewal failure on a pending subscription is rejected;
    //          nothing was ever renewed
    // =========================================================================
    #[test]
    fn test_renewal_failure_needs_active() {
        assert!(next_status(SubscriptionStatus::Pending, LifecycleEvent::RenewalFailed).is_err());
        assert!(next_status(SubscriptionStatus::PastDue, LifecycleEvent::RenewalFailed).is_err());
    }

    // =========================================================================
    // PAY-L07: Every reachable status has a parseable string form
    // =========================================================================
    #[test]
    fn test_status_round_trip_through_storage_form() {
        for status in [
            SubscriptionStatus::Pending,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
        ] {
            let parsed: SubscriptionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}

#[cfg(test)]
mod webhook_signature_tests {
    use crate::webhooks::verify_signature;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    const SECRET: &str = "whsec_edge_case_secret";
    const NOW: i64 = 1_720_000_000;

    fn sign(payload: &str, timestamp: i64) -> String {
        let key = SECRET.strip_prefix("whsec_").unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    // =========================================================================
    // PAY-W01: Timestamp exactly at the tolerance boundary passes
    // =========================================================================
    #[test]
    fn test_timestamp_exactly_at_tolerance() {
        let payload = "{}";
        let ts = NOW - 300;
        let header = format!("t={ts},v1={}", sign(payload, ts));
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }

    // =========================================================================
    // PAY-W02: One second past tolerance fails
    // =========================================================================
    #[test]
    fn test_timestamp_one_second_past_tolerance() {
        let payload = "{}";
        let ts = NOW - 301;
        let header = format!("t={ts},v1={}", sign(payload, ts));
        assert!(verify_signature(payload, &header, SECRET, NOW).is_err());
    }

    // =========================================================================
    // PAY-W03: Signature over a different timestamp than the header claims
    // =========================================================================
    #[test]
    fn test_timestamp_substitution_rejected() {
        let payload = "{}";
        let header = format!("t={NOW},v1={}", sign(payload, NOW - 10));
        assert!(verify_signature(payload, &header, SECRET, NOW).is_err());
    }

    // =========================================================================
    // PAY-W04: Empty payload still verifies correctly
    // =========================================================================
    #[test]
    fn test_empty_payload() {
        let header = format!("t={NOW},v1={}", sign("", NOW));
        assert!(verify_signature("", &header, SECRET, NOW).is_ok());
    }

    // =========================================================================
    // PAY-W05: Header with extra unknown schemes is tolerated
    // =========================================================================
    #[test]
    fn test_extra_schemes_ignored() {
        let payload = r#"{"k":1}"#;
        let header = format!("t={NOW},v0=legacy,v1={},v2=future", sign(payload, NOW));
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }

    // =========================================================================
    // PAY-W06: Non-hex v1 value is skipped, not a panic
    // =========================================================================
    #[test]
    fn test_non_hex_signature_value() {
        let header = format!("t={NOW},v1=not-hex-at-all");
        assert!(verify_signature("{}", &header, SECRET, NOW).is_err());
    }
}

#[cfg(test)]
mod invoice_line_tests {
    use crate::invoices::{period_line_items, validate_line_items};
    use crate::plans::Plan;
    use crate::store::NewLineItem;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn plan(price_cents: i64, duration_days: i32) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "Annual".to_string(),
            price_cents,
            currency: "usd".to_string(),
            duration_days,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    // =========================================================================
    // PAY-I01: Zero-amount invoice (free period) has matching lines
    // =========================================================================
    #[test]
    fn test_zero_amount_invoice_lines() {
        let lines = period_line_items(&plan(0, 30), 0);
        assert!(validate_line_items(&lines, 0).is_ok());
    }

    // =========================================================================
    // PAY-I02: Line items for the amount actually paid, not the plan price
    // =========================================================================
    #[test]
    fn test_lines_use_paid_amount_not_plan_price() {
        // Plan price changed to 5000 after the payment of 2900 settled.
        let lines = period_line_items(&plan(5000, 30), 2900);
        assert_eq!(lines[0].amount_cents, 2900);
        assert!(validate_line_items(&lines, 2900).is_ok());
        assert!(validate_line_items(&lines, 5000).is_err());
    }

    // =========================================================================
    // PAY-I03: Mismatch detection catches off-by-one-cent errors
    // =========================================================================
    #[test]
    fn test_one_cent_mismatch_detected() {
        let lines = vec![NewLineItem {
            description: "cycle".to_string(),
            quantity: 1,
            unit_price_cents: 999,
            amount_cents: 999,
        }];
        assert!(validate_line_items(&lines, 1000).is_err());
        assert!(validate_line_items(&lines, 998).is_err());
        assert!(validate_line_items(&lines, 999).is_ok());
    }

    // =========================================================================
    // PAY-I04: Multi-line invoices sum across all lines
    // =========================================================================
    #[test]
    fn test_multi_line_sum() {
        let lines = vec![
            NewLineItem {
                description: "base".to_string(),
                quantity: 1,
                unit_price_cents: 2000,
                amount_cents: 2000,
            },
            NewLineItem {
                description: "seats".to_string(),
                quantity: 3,
                unit_price_cents: 500,
                amount_cents: 1500,
            },
        ];
        assert!(validate_line_items(&lines, 3500).is_ok());
    }
}

#[cfg(test)]
mod refund_proration_tests {
    use crate::refund::calculate_prorated_amount;

    // =========================================================================
    // PAY-RF01: One day into a 30-day period refunds 29/30
    // =========================================================================
    #[test]
    fn test_one_day_used() {
        assert_eq!(calculate_prorated_amount(3000, 30, 29), 2900);
    }

    // =========================================================================
    // PAY-RF02: Last day of the period refunds 1/30, rounded down
    // =========================================================================
    #[test]
    fn test_last_day() {
        // 2999 * 1 / 30 = 99.96 -> 99
        assert_eq!(calculate_prorated_amount(2999, 30, 1), 99);
    }

    // =========================================================================
    // PAY-RF03: Proration never exceeds the original amount
    // =========================================================================
    #[test]
    fn test_never_exceeds_original() {
        for remaining in 0..100 {
            let prorated = calculate_prorated_amount(2900, 30, remaining);
            assert!(prorated <= 2900, "remaining={remaining} gave {prorated}");
            assert!(prorated >= 0);
        }
    }

    // =========================================================================
    // PAY-RF04: Single-day plans prorate all or nothing
    // =========================================================================
    #[test]
    fn test_single_day_plan() {
        assert_eq!(calculate_prorated_amount(500, 1, 1), 500);
        assert_eq!(calculate_prorated_amount(500, 1, 0), 0);
    }
}

#[cfg(test)]
mod error_taxonomy_tests {
    use crate::error::BillingError;
    use ledgerpay_shared::ErrorCode;
    use uuid::Uuid;

    // =========================================================================
    // PAY-E01: Domain rejections surface as client errors, not 500s
    // =========================================================================
    #[test]
    fn test_domain_rejections_are_client_errors() {
        let duplicate = BillingError::DuplicateSubscription {
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
        };
        assert_eq!(duplicate.error_code(), ErrorCode::InvalidInput);

        let transition = BillingError::InvalidTransition {
            from: "expired",
            event: "payment_confirmed",
        };
        assert_eq!(transition.error_code(), ErrorCode::InvalidInput);
    }

    // =========================================================================
    // PAY-E02: Provider timeouts are retryable, signature failures are not
    // =========================================================================
    #[test]
    fn test_retryability_split() {
        assert!(BillingError::ProviderTimeout.is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::RefundFailed("charge disputed".to_string()).is_retryable());
    }

    // =========================================================================
    // PAY-E03: Error codes serialize to the stable wire names
    // =========================================================================
    #[test]
    fn test_error_code_wire_names() {
        let code = BillingError::WebhookSignatureInvalid.error_code();
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"AUTHENTICATION_ERROR\"");
    }
}
