//! Property-based tests for instance keys and bookmark scopes.
//!
//! Verifies identity invariants:
//! - InstanceKey: equality and hashing follow the value only, derive is
//!   deterministic and scope-sensitive, serde roundtrip keeps metadata
//! - BookmarkScope: binds once; the first id wins, repeats are no-ops, the
//!   nil id is rejected, clones share the binding
//! - Bookmark: in_scope picks up the scope id only once bound

use parley_core::bookmark::{Bookmark, BookmarkScope};
use parley_core::error::CorrelationError;
use parley_core::instance_key::{InstanceKey, InstanceValue};
use proptest::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_uuid() -> impl Strategy<Value = Uuid> {
    (1u128..=u128::MAX).prop_map(Uuid::from_u128)
}

fn arb_value() -> impl Strategy<Value = InstanceValue> {
    prop_oneof![
        Just(InstanceValue::Null),
        any::<bool>().prop_map(InstanceValue::Bool),
        any::<i64>().prop_map(InstanceValue::Int),
        "[a-z0-9 ]{0,12}".prop_map(InstanceValue::Text),
        arb_uuid().prop_map(InstanceValue::Id),
    ]
}

fn arb_metadata() -> impl Strategy<Value = BTreeMap<String, InstanceValue>> {
    prop::collection::btree_map("[a-z.]{1,10}", arb_value(), 0..4)
}

fn hash_of(key: &InstanceKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

// ────────────────────────────────────────────────────────────────────
// InstanceKey
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Metadata never affects equality or hashing.
    #[test]
    fn prop_key_identity_ignores_metadata(value in arb_uuid(), metadata in arb_metadata()) {
        let plain = InstanceKey::new(value);
        let rich = InstanceKey::with_metadata(value, metadata);
        prop_assert_eq!(&plain, &rich);
        prop_assert_eq!(hash_of(&plain), hash_of(&rich));
    }

    /// Same scope and data give the same key; a different scope does not.
    #[test]
    fn prop_derive_is_deterministic(
        scope in "[a-z]{1,8}",
        other in "[a-z]{1,8}",
        data in "[a-z0-9-]{0,16}",
    ) {
        prop_assert_eq!(InstanceKey::derive(&scope, &data), InstanceKey::derive(&scope, &data));
        prop_assert!(InstanceKey::derive(&scope, &data).is_valid());
        if scope != other {
            prop_assert_ne!(InstanceKey::derive(&scope, &data), InstanceKey::derive(&other, &data));
        }
    }

    /// JSON keeps both the value and the metadata.
    #[test]
    fn prop_key_serde_keeps_metadata(value in arb_uuid(), metadata in arb_metadata()) {
        let key = InstanceKey::with_metadata(value, metadata);
        let json = serde_json::to_string(&key).unwrap();
        let back: InstanceKey = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.value(), key.value());
        prop_assert_eq!(back.metadata(), key.metadata());
    }
}

// ────────────────────────────────────────────────────────────────────
// BookmarkScope
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The first id sticks; a repeat is fine, anything else conflicts.
    #[test]
    fn prop_scope_binds_once(ids in prop::collection::vec(arb_uuid(), 1..6)) {
        let scope = BookmarkScope::new();
        let shared = scope.clone();
        let first = ids[0];

        for id in &ids {
            let result = shared.initialize(*id);
            if *id == first {
                prop_assert!(result.is_ok());
            } else {
                let is_conflict = matches!(result, Err(CorrelationError::Conflict { .. }));
                prop_assert!(is_conflict);
            }
            prop_assert_eq!(scope.id(), Some(first));
        }
        prop_assert!(scope.same_scope(&shared));
    }

    /// The nil id is never accepted.
    #[test]
    fn prop_scope_rejects_nil(bind_first in any::<bool>(), id in arb_uuid()) {
        let scope = BookmarkScope::new();
        if bind_first {
            scope.initialize(id).unwrap();
        }
        let rejected = matches!(scope.initialize(Uuid::nil()), Err(CorrelationError::InvalidInstanceKey));
        prop_assert!(rejected);
        prop_assert_eq!(scope.id(), bind_first.then_some(id));
    }

    /// A bookmark created before binding is unscoped; after binding it carries the id.
    #[test]
    fn prop_bookmark_follows_scope(name in "[A-Za-z/]{1,16}", id in arb_uuid()) {
        let scope = BookmarkScope::new();
        let before = Bookmark::in_scope(name.clone(), &scope);
        scope.initialize(id).unwrap();
        let after = Bookmark::in_scope(name.clone(), &scope);

        prop_assert_eq!(before.scope_id(), None);
        prop_assert_eq!(after.scope_id(), Some(id));
        prop_assert_eq!(after.name(), name.as_str());
        prop_assert_ne!(before, after);
    }
}
