//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use bucketlog_protocol::{FileState, ManifestUpdate, Provenance, ResolvedReference};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for generating object keys, including nested paths.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}(/[a-z0-9]{1,6}){0,2}").expect("Invalid regex")
}

/// Strategy for generating references into a small set of buckets.
pub fn reference_strategy() -> impl Strategy<Value = ResolvedReference> {
    (prop_oneof![Just("alpha"), Just("beta")], key_strategy())
        .prop_map(|(bucket, key)| ResolvedReference::new(bucket, key))
}

/// Strategy for generating JSON documents.
///
/// Object members are never `null`, so documents are fixed points of
/// applying a merge patch to themselves.
pub fn document_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-f]{1,3}", inner, 0..5)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// Strategy for generating provenance sets over the first 24 bits.
pub fn provenance_strategy() -> impl Strategy<Value = Provenance> {
    prop::collection::vec(0usize..24, 0..4).prop_map(|bits| {
        let mut set = Provenance::new();
        for bit in bits {
            set.insert(bit);
        }
        set
    })
}

/// Strategy for generating file states.
pub fn file_state_strategy() -> impl Strategy<Value = FileState> {
    ("[0-9a-f]{1,16}", provenance_strategy())
        .prop_map(|(version, provenance)| FileState::new(version).with_replication(provenance))
}

/// Strategy for generating manifest updates mixing sets and deletes.
pub fn update_strategy() -> impl Strategy<Value = ManifestUpdate> {
    prop::collection::vec(
        (reference_strategy(), prop::option::weighted(0.8, file_state_strategy())),
        0..6,
    )
    .prop_map(|changes| {
        let mut update = ManifestUpdate::new();
        for (reference, state) in changes {
            match state {
                Some(state) => update.set(&reference, state),
                None => update.delete(&reference),
            }
        }
        update
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketlog_protocol::{merge, ManifestFile, ManifestState};

    proptest! {
        #[test]
        fn generated_references_round_trip(reference in reference_strategy()) {
            let parsed = ResolvedReference::parse(&reference.to_string()).unwrap();
            prop_assert_eq!(parsed, reference);
        }

        #[test]
        fn documents_are_merge_fixed_points(doc in document_strategy()) {
            prop_assert_eq!(merge(&doc, Some(&doc)), doc);
        }

        #[test]
        fn generated_updates_are_valid_entries(update in update_strategy()) {
            let bytes = ManifestFile::delta(update.clone()).encode();
            let decoded = ManifestFile::decode(&bytes).unwrap();
            prop_assert_eq!(decoded.update, update.clone());

            let mut state = ManifestState::new();
            state.apply(&update).unwrap();
            prop_assert!(state.len() <= update.len());
        }
    }
}
