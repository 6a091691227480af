//! Property-based tests for ledgerkey-core
//!
//! Uses proptest to verify key-format and operation-naming invariants

use ledgerkey_core::{
    strip_key_prefix, KeyScheme, Operation, OperationType, Secp256k1Scheme, Secret,
};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Strategies
// ============================================================================

/// Strings that cannot be a formatted private key
fn malformed_key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::string::string_regex("[1-46-9A-Za-z]{50,60}").unwrap(),
        prop::string::string_regex("5[1-9A-HJ-NP-Za-km-z]{0,48}").unwrap(),
    ]
}

/// Operation names in mixed case with optional suffix
fn op_name_strategy() -> impl Strategy<Value = String> {
    (
        prop::string::string_regex("[a-zA-Z][a-zA-Z_]{0,20}").unwrap(),
        any::<bool>(),
    )
        .prop_map(|(name, suffixed)| if suffixed { format!("{}_operation", name) } else { name })
}

// ============================================================================
// Key Properties
// ============================================================================

proptest! {
    /// Property: malformed keys are rejected before any signing
    #[test]
    fn prop_malformed_keys_rejected(raw in malformed_key_strategy()) {
        let scheme = Secp256k1Scheme::default();
        let secret = Secret::new(raw).unwrap();
        prop_assert!(scheme.validate(&secret).is_err());
        prop_assert!(scheme.public_key(&secret).is_err());
    }

    /// Property: network prefix does not change the key body
    #[test]
    fn prop_prefix_stripping(body in "[1-9A-HJ-NP-Za-km-z]{40,60}") {
        let stm = format!("STM{}", body);
        let tst = format!("TST{}", body);
        prop_assert_eq!(strip_key_prefix(&stm), body.as_str());
        prop_assert_eq!(strip_key_prefix(&tst), body.as_str());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: signatures over any challenge have the compact recoverable shape
    #[test]
    fn prop_signature_shape(challenge in prop::collection::vec(any::<u8>(), 0..256)) {
        let scheme = Secp256k1Scheme::default();
        let secret = Secp256k1Scheme::generate_secret();
        let signature = scheme.sign_message(&secret, &challenge).unwrap();
        prop_assert_eq!(signature.as_str().len(), 130);
    }
}

// ============================================================================
// Operation Type Properties
// ============================================================================

proptest! {
    /// Property: normalized types are lowercase and suffix-free
    #[test]
    fn prop_type_normalization(name in op_name_strategy()) {
        let op = Operation::new(name, json!({}));
        let ty = op.op_type();
        prop_assert_eq!(ty.as_str(), ty.as_str().to_ascii_lowercase());
        prop_assert!(!ty.as_str().ends_with("_operation"));
    }

    /// Property: custom messages are qualified by their id
    #[test]
    fn prop_custom_json_qualified(id in "[a-z_]{1,16}") {
        let op = Operation::new("custom_json", json!({"id": id.clone(), "json": "{}"}));
        let ty = OperationType::of(&op);
        prop_assert_eq!(ty.as_str(), format!("custom_json:{}", id));
    }

    /// Property: summaries never fail on arbitrary bodies
    #[test]
    fn prop_summary_total(name in op_name_strategy(), value in "[ -~]{0,80}") {
        let op = Operation::new(name, json!({"memo": value, "weight": "x"}));
        prop_assert!(!op.summary().is_empty());
    }
}
