//! Secondary indexes over document fields.

use crate::error::{CoreError, CoreResult};
use crate::types::IndexId;
use crate::wal::{encode_payload, IndexDefinition};
use ciborium::Value;
use std::collections::{HashMap, HashSet};

/// Hash index from encoded field values to document keys.
///
/// The index key of a document is the CBOR encoding of the array of its
/// indexed field values, with `null` standing in for missing fields.
///
/// # Example
///
/// ```rust,ignore
/// let mut index = SecondaryIndex::new(definition);
/// let key = index.key_for(&body)?;
/// index.insert("alice", key)?;
/// assert_eq!(index.lookup(&[Value::from("a@example.com")])?.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    definition: IndexDefinition,
    entries: HashMap<Vec<u8>, HashSet<String>>,
    by_document: HashMap<String, Vec<u8>>,
}

impl SecondaryIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            entries: HashMap::new(),
            by_document: HashMap::new(),
        }
    }

    /// Index id.
    #[must_use]
    pub fn id(&self) -> IndexId {
        self.definition.id
    }

    /// Whether the index rejects duplicate values.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.definition.unique
    }

    /// The definition the index was created from.
    #[must_use]
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Computes the index key of a document body.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the values cannot be encoded.
    pub fn key_for(&self, body: &Value) -> CoreResult<Vec<u8>> {
        let values: Vec<Value> = self
            .definition
            .fields
            .iter()
            .map(|field| field_value(body, field).cloned().unwrap_or(Value::Null))
            .collect();
        encode_payload(&values)
    }

    /// Returns true if inserting `key` for `document` would violate
    /// uniqueness.
    #[must_use]
    pub fn conflicts(&self, document: &str, key: &[u8]) -> bool {
        self.definition.unique
            && self
                .entries
                .get(key)
                .is_some_and(|docs| docs.iter().any(|d| d != document))
    }

    /// Adds `document` under `key`, replacing its previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UniqueConstraintViolated`] if a unique index
    /// already holds `key` for another document.
    pub fn insert(&mut self, document: &str, key: Vec<u8>) -> CoreResult<()> {
        if self.conflicts(document, &key) {
            return Err(CoreError::UniqueConstraintViolated {
                index: self.definition.id.as_u64(),
                key: document.to_string(),
            });
        }
        self.remove(document);
        self.entries
            .entry(key.clone())
            .or_default()
            .insert(document.to_string());
        self.by_document.insert(document.to_string(), key);
        Ok(())
    }

    /// Removes the entry of `document`, returning its key.
    pub fn remove(&mut self, document: &str) -> Option<Vec<u8>> {
        let key = self.by_document.remove(document)?;
        if let Some(docs) = self.entries.get_mut(&key) {
            docs.remove(document);
            if docs.is_empty() {
                self.entries.remove(&key);
            }
        }
        Some(key)
    }

    /// Current key of `document`.
    #[must_use]
    pub fn key_of(&self, document: &str) -> Option<&Vec<u8>> {
        self.by_document.get(document)
    }

    /// Documents whose indexed fields equal `values`.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the values cannot be encoded.
    pub fn lookup(&self, values: &[Value]) -> CoreResult<Vec<String>> {
        let key = encode_payload(&values)?;
        let mut docs: Vec<_> = self
            .entries
            .get(&key)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        docs.sort();
        Ok(docs)
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_document.len()
    }

    /// Returns true if no document is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_document.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_document.clear();
    }
}

/// Looks up a dotted field path in a CBOR map.
fn field_value<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(body, |value, part| {
        value
            .as_map()?
            .iter()
            .find(|(k, _)| k.as_text() == Some(part))
            .map(|(_, v)| v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(email: &str, city: &str) -> Value {
        Value::Map(vec![
            (Value::from("email"), Value::from(email)),
            (
                Value::from("address"),
                Value::Map(vec![(Value::from("city"), Value::from(city))]),
            ),
        ])
    }

    fn index(fields: &[&str], unique: bool) -> SecondaryIndex {
        SecondaryIndex::new(IndexDefinition {
            id: IndexId::new(7),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique,
        })
    }

    #[test]
    fn nested_fields_are_indexed() {
        let mut idx = index(&["address.city"], false);
        let key = idx.key_for(&body("a@x", "Oslo")).unwrap();
        idx.insert("a", key).unwrap();
        let key = idx.key_for(&body("b@x", "Oslo")).unwrap();
        idx.insert("b", key).unwrap();

        assert_eq!(idx.lookup(&[Value::from("Oslo")]).unwrap(), vec!["a", "b"]);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn missing_field_indexes_null() {
        let idx = index(&["phone"], false);
        let key = idx.key_for(&body("a@x", "Oslo")).unwrap();
        assert_eq!(key, encode_payload(&vec![Value::Null]).unwrap());
    }

    #[test]
    fn unique_rejects_second_document() {
        let mut idx = index(&["email"], true);
        let key = idx.key_for(&body("a@x", "Oslo")).unwrap();
        idx.insert("a", key.clone()).unwrap();
        // Same document may be reindexed
        idx.insert("a", key.clone()).unwrap();

        let err = idx.insert("b", key).unwrap_err();
        assert!(matches!(err, CoreError::UniqueConstraintViolated { index: 7, .. }));
    }

    #[test]
    fn replacing_moves_entry() {
        let mut idx = index(&["email"], true);
        idx.insert("a", idx.key_for(&body("old@x", "Oslo")).unwrap()).unwrap();
        idx.insert("a", idx.key_for(&body("new@x", "Oslo")).unwrap()).unwrap();

        assert!(idx.lookup(&[Value::from("old@x")]).unwrap().is_empty());
        assert_eq!(idx.lookup(&[Value::from("new@x")]).unwrap(), vec!["a"]);

        assert!(idx.remove("a").is_some());
        assert!(idx.is_empty());
    }
}
