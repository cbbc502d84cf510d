//! Document ↔ JSON-line codec.
//!
//! A collection file holds one JSON text per line: the header record on
//! line 1, one document per subsequent line. This module translates
//! between in-memory documents and those lines, and provides the dotted
//! field-path helpers shared by the cipher, the update spec and schema
//! updates.
//!
//! The codec contract is round-trip identity: `decode_line(encode_line(d))`
//! yields `d` for every document, and fields the library does not know
//! about survive a decode/encode cycle verbatim (documents are generic
//! JSON objects end to end). Encoding is deterministic: object keys are
//! emitted in sorted order, so journaled lines are reproducible.

use crate::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The header record on line 1 of every collection file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaHeader {
    /// Schema version of the documents in the file.
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
}

impl SchemaHeader {
    /// Creates a header for the given version.
    #[must_use]
    pub fn new(schema_version: impl Into<String>) -> Self {
        Self {
            schema_version: schema_version.into(),
        }
    }

    /// Encodes the header as its file line.
    pub fn encode(&self) -> String {
        // A struct with one string field cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"schemaVersion\":\"\"}"))
    }

    /// Decodes a header from the first line of a file.
    ///
    /// Returns `None` if the line is not a header record.
    #[must_use]
    pub fn decode(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Encodes one document as one JSON line.
///
/// # Errors
///
/// Returns `InvalidDocument` if the value is not a JSON object.
pub fn encode_line(doc: &Value) -> DbResult<String> {
    if !doc.is_object() {
        return Err(DbError::invalid_document("document is not a JSON object"));
    }
    serde_json::to_string(doc).map_err(|e| DbError::invalid_document(e.to_string()))
}

/// Decodes one JSON line into a document.
///
/// # Errors
///
/// Returns `InvalidDocument` if the line is not valid JSON or not an
/// object.
pub fn decode_line(line: &str) -> DbResult<Value> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| DbError::invalid_document(e.to_string()))?;
    if !value.is_object() {
        return Err(DbError::invalid_document("line is not a JSON object"));
    }
    Ok(value)
}

/// Serializes a typed entity into a document value.
pub fn to_document<T: Serialize>(entity: &T) -> DbResult<Value> {
    let value = serde_json::to_value(entity).map_err(|e| DbError::invalid_document(e.to_string()))?;
    if !value.is_object() {
        return Err(DbError::invalid_document("entity did not serialize to a JSON object"));
    }
    Ok(value)
}

/// Deserializes a document value into a typed entity.
pub fn from_document<T: DeserializeOwned>(doc: Value) -> DbResult<T> {
    serde_json::from_value(doc).map_err(|e| DbError::invalid_document(e.to_string()))
}

/// Looks up a dotted field path within a document.
#[must_use]
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = doc;
    for segment in path.split('.') {
        node = node.get(segment)?;
    }
    Some(node)
}

/// Looks up a dotted field path mutably.
pub fn get_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut node = doc;
    for segment in path.split('.') {
        node = node.get_mut(segment)?;
    }
    Some(node)
}

/// Sets a dotted field path, creating intermediate objects as needed.
///
/// # Errors
///
/// Returns `InvalidDocument` if an intermediate segment exists but is not
/// an object.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> DbResult<()> {
    let mut node = doc;
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(DbError::invalid_document("empty field path"));
    };

    for segment in parents {
        let map = node.as_object_mut().ok_or_else(|| {
            DbError::invalid_document(format!("field {segment:?} in path {path:?} is not an object"))
        })?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }

    let map = node.as_object_mut().ok_or_else(|| {
        DbError::invalid_document(format!("parent of field {last:?} in path {path:?} is not an object"))
    })?;
    map.insert(last.to_string(), value);
    Ok(())
}

/// Removes a dotted field path. Returns the removed value, if any.
pub fn remove_path(doc: &mut Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last()?;

    let mut node = doc;
    for segment in parents {
        node = node.get_mut(segment)?;
    }
    node.as_object_mut()?.remove(*last)
}
