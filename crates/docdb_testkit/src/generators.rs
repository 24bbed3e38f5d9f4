//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random documents and operation
//! sequences, plus an in-memory model to check an engine against.

use ciborium::Value;
use docdb_core::DocumentOperation;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for generating document keys from a small key space, so that
/// sequences hit existing keys often.
pub fn key_strategy() -> impl Strategy<Value = String> {
    (0u8..16).prop_map(|i| format!("key-{i:02}"))
}

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_]{0,31}").expect("Invalid regex")
}

/// Strategy for generating document bodies.
pub fn body_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|v| Value::Integer(v.into())),
        "[a-z ]{0,24}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
    ];
    prop::collection::vec(("[a-z]{1,8}", leaf), 0..6).prop_map(|fields| {
        Value::Map(
            fields
                .into_iter()
                .map(|(name, value)| (Value::Text(name), value))
                .collect(),
        )
    })
}

/// Strategy for generating document operations.
pub fn document_operation_strategy() -> impl Strategy<Value = DocumentOperation> {
    prop_oneof![
        3 => (key_strategy(), body_strategy())
            .prop_map(|(key, body)| DocumentOperation::Upsert { key, body }),
        1 => (key_strategy(), body_strategy())
            .prop_map(|(key, body)| DocumentOperation::Insert { key, body }),
        1 => (key_strategy(), body_strategy())
            .prop_map(|(key, body)| DocumentOperation::Replace { key, body }),
        1 => key_strategy().prop_map(|key| DocumentOperation::Remove { key }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<DocumentOperation>> {
    prop::collection::vec(document_operation_strategy(), min_ops..max_ops)
}

/// Expected collection contents after a sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionModel {
    documents: BTreeMap<String, Value>,
}

impl CollectionModel {
    /// Applies `operation` and returns whether the engine should accept it.
    pub fn apply(&mut self, operation: &DocumentOperation) -> bool {
        match operation {
            DocumentOperation::Insert { key, body } => {
                if self.documents.contains_key(key) {
                    return false;
                }
                self.documents.insert(key.clone(), body.clone());
            }
            DocumentOperation::Replace { key, body } => {
                let Some(existing) = self.documents.get_mut(key) else {
                    return false;
                };
                *existing = body.clone();
            }
            DocumentOperation::Upsert { key, body } => {
                self.documents.insert(key.clone(), body.clone());
            }
            DocumentOperation::Remove { key } => {
                if self.documents.remove(key).is_none() {
                    return false;
                }
            }
        }
        true
    }

    /// Expected documents by key.
    pub fn documents(&self) -> &BTreeMap<String, Value> {
        &self.documents
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for tests that open engines.
    #[must_use]
    pub fn engine() -> Self {
        Self {
            cases: 8,
            max_shrink_iters: 20,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEngine;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn collection_name_is_valid(name in collection_name_strategy()) {
            let first = name.chars().next();
            prop_assert!(first.is_some_and(|c| c.is_ascii_alphabetic()));
        }

        #[test]
        fn bodies_are_maps(body in body_strategy()) {
            prop_assert!(matches!(body, Value::Map(_)));
        }
    }

    proptest! {
        #![proptest_config(PropTestConfig::engine().to_proptest_config())]

        #[test]
        fn crash_recovery_matches_model(ops in operation_sequence_strategy(1, 40)) {
            let mut engine = TestEngine::new();
            let mut model = CollectionModel::default();
            for op in &ops {
                let expected = model.apply(op);
                let mut trx = engine
                    .begin_transaction(engine.database, &[engine.collection], Default::default())
                    .unwrap();
                let accepted = trx.add_operation(engine.collection, op.clone()).is_ok();
                prop_assert_eq!(accepted, expected);
                if accepted {
                    trx.commit().unwrap();
                } else {
                    trx.abort().unwrap();
                }
            }

            engine.crash_and_recover().unwrap();
            for key in (0u8..16).map(|i| format!("key-{i:02}")) {
                let actual = engine.get(&key);
                prop_assert_eq!(actual.as_ref(), model.documents().get(&key));
            }
        }
    }
}
