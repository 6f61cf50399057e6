//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use couchlite::blob::BlobStore;
use couchlite::collate::{collate, collate_json_str};
use couchlite::revision::{next_rev_id, parse_rev_id};
use couchlite::view::{group_key, group_together};
use couchlite::{compare_rev_ids, BlobKey, CheckpointSpec, Collation};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

fn rev_id() -> impl Strategy<Value = String> {
    (1u64..1_000, "[0-9a-f]{1,32}").prop_map(|(generation, suffix)| format!("{generation}-{suffix}"))
}

/// Scalars and shallow arrays, the shapes view keys usually take.
fn view_key() -> impl Strategy<Value = Value> {
    let scalar = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000i64..1_000_000).prop_map(|n| json!(n)),
        "[a-zA-Z]{0,8}".prop_map(Value::String),
    ];
    scalar.prop_recursive(2, 16, 4, |inner| prop::collection::vec(inner, 0..4).prop_map(Value::Array))
}

fn collation() -> impl Strategy<Value = Collation> {
    prop_oneof![Just(Collation::Unicode), Just(Collation::Ascii), Just(Collation::Raw)]
}

// =============================================================================
// Revision ID Properties
// =============================================================================

proptest! {
    /// Revision comparison is reflexive: a == a
    #[test]
    fn rev_id_comparison_reflexive(rev in rev_id()) {
        prop_assert_eq!(compare_rev_ids(&rev, &rev), Ordering::Equal);
    }

    /// Revision comparison is antisymmetric, even for malformed IDs
    #[test]
    fn rev_id_comparison_antisymmetric(a in ".{0,12}", b in ".{0,12}") {
        prop_assert_eq!(compare_rev_ids(&a, &b).reverse(), compare_rev_ids(&b, &a));
    }

    /// Well-formed revision comparison is transitive
    #[test]
    fn rev_id_comparison_transitive(a in rev_id(), b in rev_id(), c in rev_id()) {
        if compare_rev_ids(&a, &b) == Ordering::Less && compare_rev_ids(&b, &c) == Ordering::Less {
            prop_assert_eq!(compare_rev_ids(&a, &c), Ordering::Less);
        }
    }

    /// A higher generation always wins, whatever the suffixes
    #[test]
    fn rev_id_generation_dominates(
        g1 in 1u64..1_000,
        g2 in 1u64..1_000,
        s1 in "[0-9a-f]{1,8}",
        s2 in "[0-9a-f]{1,8}",
    ) {
        prop_assume!(g1 != g2);
        let a = format!("{g1}-{s1}");
        let b = format!("{g2}-{s2}");
        prop_assert_eq!(compare_rev_ids(&a, &b), g1.cmp(&g2));
    }

    /// A child revision is one generation above its parent and sorts after it
    #[test]
    fn next_rev_id_increments_generation(parent in rev_id(), n in any::<i64>(), deleted in any::<bool>()) {
        let mut body = Map::new();
        body.insert("n".into(), json!(n));
        let child = next_rev_id(Some(&parent), &body, deleted);

        let (parent_generation, _) = parse_rev_id(&parent).unwrap();
        let (child_generation, suffix) = parse_rev_id(&child).unwrap();
        prop_assert_eq!(child_generation, parent_generation + 1);
        prop_assert_eq!(suffix.len(), 40);
        prop_assert_eq!(compare_rev_ids(&child, &parent), Ordering::Greater);
        prop_assert_eq!(next_rev_id(Some(&parent), &body, deleted), child);
    }
}

// =============================================================================
// Collation Properties
// =============================================================================

proptest! {
    /// Every value collates equal to itself
    #[test]
    fn collate_reflexive(key in view_key(), mode in collation()) {
        prop_assert_eq!(collate(&key, &key, mode), Ordering::Equal);
    }

    /// Swapping the operands reverses the result
    #[test]
    fn collate_antisymmetric(a in view_key(), b in view_key(), mode in collation()) {
        prop_assert_eq!(collate(&a, &b, mode).reverse(), collate(&b, &a, mode));
    }

    /// Collating serialized values agrees with collating parsed ones
    #[test]
    fn collate_json_str_matches_values(a in view_key(), b in view_key(), mode in collation()) {
        let expected = collate(&a, &b, mode);
        prop_assert_eq!(collate_json_str(&a.to_string(), &b.to_string(), mode), expected);
    }

    /// Integers sort numerically under the type-aware modes
    #[test]
    fn collate_numbers_numerically(a in any::<i32>(), b in any::<i32>()) {
        prop_assert_eq!(collate(&json!(a), &json!(b), Collation::Unicode), a.cmp(&b));
        prop_assert_eq!(collate(&json!(a), &json!(b), Collation::Ascii), a.cmp(&b));
    }
}

// =============================================================================
// Grouping Properties
// =============================================================================

proptest! {
    /// Group level 0 groups only keys that collate equal
    #[test]
    fn group_level_zero_is_exact(a in view_key(), b in view_key()) {
        let equal = collate(&a, &b, Collation::Unicode) == Ordering::Equal;
        prop_assert_eq!(group_together(&a, &b, 0, Collation::Unicode), equal);
        prop_assert!(group_together(&a, &a, 0, Collation::Unicode));
    }

    /// Keys group together exactly when their prefixes collate equal
    #[test]
    fn group_together_matches_group_key(
        a in prop::collection::vec(0i64..3, 1..4),
        b in prop::collection::vec(0i64..3, 1..4),
        level in 1usize..4,
    ) {
        let (a, b) = (json!(a), json!(b));
        let same_prefix = collate(&group_key(&a, level), &group_key(&b, level), Collation::Unicode)
            == Ordering::Equal;
        prop_assert_eq!(group_together(&a, &b, level, Collation::Unicode), same_prefix);
    }

    /// A group key never has more than `level` elements
    #[test]
    fn group_key_truncates(key in prop::collection::vec(any::<i16>(), 0..8), level in 1usize..6) {
        let grouped = group_key(&json!(key), level);
        let len = grouped.as_array().map(Vec::len).unwrap_or(0);
        prop_assert_eq!(len, key.len().min(level));
    }
}

// =============================================================================
// Checkpoint ID Properties
// =============================================================================

proptest! {
    /// The checkpoint ID ignores the order doc IDs are given in
    #[test]
    fn checkpoint_id_ignores_doc_id_order(
        doc_ids in prop::collection::hash_set("[a-z]{1,6}", 0..6),
        params in prop::collection::btree_map("[a-z]{1,4}", any::<i32>(), 0..5),
        push in any::<bool>(),
    ) {
        let ids: Vec<String> = doc_ids.into_iter().collect();
        let mut reversed = ids.clone();
        reversed.reverse();
        let filter_params: BTreeMap<String, Value> = params.into_iter().map(|(k, v)| (k, json!(v))).collect();

        let spec = |doc_ids: Vec<String>| CheckpointSpec {
            local_uuid: "local".into(),
            remote_url: "http://remote/db".into(),
            push,
            filter: Some("app/by_type".into()),
            filter_params: Some(filter_params.clone()),
            doc_ids: Some(doc_ids),
            ..Default::default()
        };
        prop_assert_eq!(spec(ids).checkpoint_doc_id(), spec(reversed).checkpoint_doc_id());
    }

    /// Checkpoint IDs are 40 lowercase hex characters
    #[test]
    fn checkpoint_id_is_sha1_hex(url in "http://[a-z]{1,10}/[a-z]{1,6}", continuous in any::<bool>()) {
        let spec = CheckpointSpec {
            local_uuid: "local".into(),
            remote_url: url,
            continuous,
            ..Default::default()
        };
        let id = spec.checkpoint_doc_id();
        prop_assert_eq!(id.len(), 40);
        prop_assert!(id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }
}

// =============================================================================
// Blob Key Properties
// =============================================================================

proptest! {
    /// A blob's key depends only on its content
    #[test]
    fn blob_key_deterministic(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        prop_assert_eq!(BlobKey::for_bytes(&data), BlobStore::key_for(&data));
        prop_assert_eq!(BlobKey::for_bytes(&data), BlobKey::for_bytes(&data.clone()));
    }

    /// Different content gets different keys
    #[test]
    fn blob_key_collision_resistant(
        a in prop::collection::vec(any::<u8>(), 1..512),
        b in prop::collection::vec(any::<u8>(), 1..512),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(BlobKey::for_bytes(&a), BlobKey::for_bytes(&b));
    }

    /// Hex and digest-string forms parse back to the same key
    #[test]
    fn blob_key_text_forms(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let key = BlobKey::for_bytes(&data);
        prop_assert_eq!(key.to_hex().len(), 40);
        prop_assert_eq!(BlobKey::from_hex(&key.to_hex().to_lowercase()), Some(key));
        prop_assert_eq!(BlobKey::from_hex(&key.to_hex()), Some(key));
        prop_assert!(key.digest_string().starts_with("sha1-"));
        prop_assert_eq!(BlobKey::from_digest_string(&key.digest_string()), Some(key));
    }

    /// Stored blobs read back intact and are stored once
    #[test]
    fn blob_store_dedupes(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs"), None).unwrap();
        let first = store.store(&data).unwrap();
        let second = store.store(&data).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(store.count(), 1);
        prop_assert_eq!(store.fetch(&first).unwrap(), data);
    }
}
