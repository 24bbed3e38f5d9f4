//! CBOR payloads carried by markers.
//!
//! Payloads are self-delimiting, so the zero padding that aligns a marker
//! to 8 bytes is ignored when decoding.

use crate::error::{CoreError, CoreResult};
use crate::types::IndexId;
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encodes a payload as CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if serialization fails.
pub fn encode_payload<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR payload.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if the bytes are not a valid `T`.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

/// A document version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Primary key.
    #[serde(rename = "_key")]
    pub key: String,
    /// Revision assigned by the writer.
    #[serde(rename = "_rev")]
    pub rev: u64,
    /// Document body.
    pub body: Value,
}

/// A document removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovePayload {
    /// Primary key.
    #[serde(rename = "_key")]
    pub key: String,
    /// Revision of the removal.
    #[serde(rename = "_rev")]
    pub rev: u64,
}

/// Properties of a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDefinition {
    /// Unique database name.
    pub name: String,
}

/// Properties of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    /// Name, unique within the database.
    pub name: String,
    /// Whether every write waits for the synchronizer.
    #[serde(default)]
    pub wait_for_sync: bool,
    /// Journal size override; 0 uses the engine default.
    #[serde(default)]
    pub journal_size: u64,
}

/// Rename of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameDefinition {
    /// Name before the rename.
    pub old_name: String,
    /// Name after the rename.
    pub name: String,
}

/// A secondary index over document body fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index id.
    pub id: IndexId,
    /// Dotted field paths that form the index key.
    pub fields: Vec<String>,
    /// Whether the index rejects duplicate keys.
    #[serde(default)]
    pub unique: bool,
}

/// Removal of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropIndexDefinition {
    /// Index id.
    pub id: IndexId,
}

/// Properties of a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// Name, unique within the database.
    pub name: String,
    /// View implementation, opaque to the storage engine.
    pub kind: String,
    /// Implementation specific properties.
    #[serde(default = "empty_properties")]
    pub properties: Value,
}

fn empty_properties() -> Value {
    Value::Map(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ignores_alignment_padding() {
        let payload = RemovePayload {
            key: "k1".to_string(),
            rev: 9,
        };
        let mut bytes = encode_payload(&payload).unwrap();
        bytes.extend_from_slice(&[0u8; 7]);

        let decoded: RemovePayload = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn document_body_survives_encoding() {
        let payload = DocumentPayload {
            key: "alice".to_string(),
            rev: 3,
            body: Value::Map(vec![(
                Value::Text("age".to_string()),
                Value::Integer(41.into()),
            )]),
        };
        let decoded: DocumentPayload = decode_payload(&encode_payload(&payload).unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let result: CoreResult<DocumentPayload> = decode_payload(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CoreError::Codec { .. })));
    }

    #[test]
    fn collection_definition_defaults() {
        #[derive(Serialize)]
        struct NameOnly {
            name: String,
        }
        let bytes = encode_payload(&NameOnly {
            name: "users".to_string(),
        })
        .unwrap();
        let def: CollectionDefinition = decode_payload(&bytes).unwrap();
        assert!(!def.wait_for_sync);
        assert_eq!(def.journal_size, 0);
    }
}
