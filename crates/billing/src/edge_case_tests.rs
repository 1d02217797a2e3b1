// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing
//!
//! Boundary conditions around checkout metadata and provider dispatch. The
//! metadata tag is the only thing standing between a token purchase and the
//! subscription reconciliation branches, so its parsing gets exhaustive
//! negative coverage here; happy paths live next to each module.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::BillingError;
use crate::provider::{CheckoutKind, CheckoutMetadata, ProviderKind};

fn subscription_meta() -> CheckoutMetadata {
    CheckoutMetadata {
        kind: CheckoutKind::Subscription,
        plan_id: Uuid::new_v4(),
        email: "buyer@example.com".to_string(),
        yearly: false,
    }
}

// =========================================================================
// Metadata map: unknown kind tag must be rejected, never defaulted
// =========================================================================
#[test]
fn test_unknown_kind_tag_rejected() {
    let mut map = subscription_meta().to_map();
    map.insert("kind".to_string(), "refund".to_string());

    let err = CheckoutMetadata::from_map(&map).unwrap_err();
    assert!(matches!(err, BillingError::InvalidMetadata(_)));
}

// =========================================================================
// Metadata map: kind tag absent entirely (foreign checkout session)
// =========================================================================
#[test]
fn test_missing_kind_tag_rejected() {
    let map = HashMap::from([
        ("plan_id".to_string(), Uuid::new_v4().to_string()),
        ("email".to_string(), "buyer@example.com".to_string()),
    ]);

    assert!(CheckoutMetadata::from_map(&map).is_err());
}

// =========================================================================
// Metadata map: kind tag is case sensitive
// =========================================================================
#[test]
fn test_kind_tag_case_sensitive() {
    let mut map = subscription_meta().to_map();
    map.insert("kind".to_string(), "Subscription".to_string());

    assert!(CheckoutMetadata::from_map(&map).is_err());
}

// =========================================================================
// Metadata map: plan_id must be a UUID
// =========================================================================
#[test]
fn test_malformed_plan_id_rejected() {
    let mut map = subscription_meta().to_map();
    map.insert("plan_id".to_string(), "plan_42".to_string());

    assert!(CheckoutMetadata::from_map(&map).is_err());
}

// =========================================================================
// Metadata map: empty email treated as missing
// =========================================================================
#[test]
fn test_empty_email_rejected() {
    let mut map = subscription_meta().to_map();
    map.insert("email".to_string(), String::new());

    assert!(CheckoutMetadata::from_map(&map).is_err());
}

// =========================================================================
// Metadata map: absent yearly key defaults to monthly
// =========================================================================
#[test]
fn test_missing_yearly_defaults_false() {
    let mut map = subscription_meta().to_map();
    map.remove("yearly");

    let meta = CheckoutMetadata::from_map(&map).unwrap();
    assert!(!meta.yearly);
}

// =========================================================================
// Metadata map: only the literal "true" enables yearly billing
// =========================================================================
#[test]
fn test_yearly_tag_strict() {
    let mut map = subscription_meta().to_map();
    map.insert("yearly".to_string(), "1".to_string());
    assert!(!CheckoutMetadata::from_map(&map).unwrap().yearly);

    map.insert("yearly".to_string(), "true".to_string());
    assert!(CheckoutMetadata::from_map(&map).unwrap().yearly);
}

// =========================================================================
// custom_id: non-JSON payload (PayPal order created outside this system)
// =========================================================================
#[test]
fn test_custom_id_garbage_rejected() {
    let err = CheckoutMetadata::from_custom_id("order#99181").unwrap_err();
    assert!(matches!(err, BillingError::InvalidMetadata(_)));
}

// =========================================================================
// custom_id: JSON with the wrong shape is rejected, not partially read
// =========================================================================
#[test]
fn test_custom_id_wrong_shape_rejected() {
    assert!(CheckoutMetadata::from_custom_id(r#"{"kind":"subscription"}"#).is_err());
    assert!(CheckoutMetadata::from_custom_id("[]").is_err());
    assert!(CheckoutMetadata::from_custom_id("null").is_err());
}

// =========================================================================
// custom_id: round trip preserves the kind tag for token packs
// =========================================================================
#[test]
fn test_custom_id_token_round_trip() {
    let meta = CheckoutMetadata {
        kind: CheckoutKind::Token,
        plan_id: Uuid::new_v4(),
        email: "buyer@example.com".to_string(),
        yearly: false,
    };

    let decoded = CheckoutMetadata::from_custom_id(&meta.to_custom_id().unwrap()).unwrap();
    assert_eq!(decoded, meta);
    assert_eq!(decoded.kind, CheckoutKind::Token);
}

// =========================================================================
// Provider tagging: the string forms pin the database CHECK constraints
// =========================================================================
#[test]
fn test_provider_kind_strings_stable() {
    assert_eq!(ProviderKind::Stripe.as_str(), "stripe");
    assert_eq!(ProviderKind::Paypal.as_str(), "paypal");
    assert_eq!(
        serde_json::to_string(&ProviderKind::Paypal).unwrap(),
        "\"paypal\""
    );
}
