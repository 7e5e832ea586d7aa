//! Core data models used throughout Corpus Keeper.
//!
//! These types represent the documents, metadata values, and chunks that
//! flow through the normalization, chunking, and mutation pipeline.
//!
//! Metadata is a flat, ordered map of [`MetadataValue`]s. The value type
//! is closed: anything that is not a primitive the store understands is
//! converted at the boundary by [`MetadataValue::from_json`], so no
//! nested structure ever reaches the store unconverted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single metadata value accepted by the document store.
///
/// Serialized untagged, so a `Metadata` map round-trips through plain
/// JSON objects (`{"tags": ["a", "b"], "content_length": 12}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

/// Flat metadata map. Ordered so serialized output is deterministic.
pub type Metadata = BTreeMap<String, MetadataValue>;

impl MetadataValue {
    /// Convert an arbitrary JSON value into the closed value set.
    ///
    /// Scalars map directly; arrays made only of strings become
    /// [`MetadataValue::List`]; every other array or object is
    /// JSON-stringified. Non-finite floats collapse to `Null`.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => MetadataValue::Null,
            Value::Bool(b) => MetadataValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetadataValue::Int(i)
                } else {
                    match n.as_f64() {
                        Some(f) if f.is_finite() => MetadataValue::Float(f),
                        _ => MetadataValue::Null,
                    }
                }
            }
            Value::String(s) => MetadataValue::Str(s.clone()),
            Value::Array(items) => {
                let strings: Option<Vec<String>> = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect();
                match strings {
                    Some(list) => MetadataValue::List(list),
                    None => MetadataValue::Str(value.to_string()),
                }
            }
            Value::Object(_) => MetadataValue::Str(value.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetadataValue::Null => serde_json::Value::Null,
            MetadataValue::Bool(b) => serde_json::Value::Bool(*b),
            MetadataValue::Int(i) => serde_json::Value::from(*i),
            MetadataValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            MetadataValue::Str(s) => serde_json::Value::String(s.clone()),
            MetadataValue::List(items) => serde_json::Value::from(items.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Render a scalar as text, for legacy values that arrive with the
    /// wrong type (`"type": 3`). Lists and nulls have no text form.
    pub fn as_text(&self) -> Option<String> {
        match self {
            MetadataValue::Str(s) => Some(s.clone()),
            MetadataValue::Int(i) => Some(i.to_string()),
            MetadataValue::Float(f) => Some(f.to_string()),
            MetadataValue::Bool(b) => Some(b.to_string()),
            MetadataValue::Null | MetadataValue::List(_) => None,
        }
    }

    /// Null, or a string that is empty after trimming.
    pub fn is_blank(&self) -> bool {
        match self {
            MetadataValue::Null => true,
            MetadataValue::Str(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Convert a JSON object into [`Metadata`]. Non-object input yields an
/// empty map.
pub fn metadata_from_json(value: &serde_json::Value) -> Metadata {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| (k.clone(), MetadataValue::from_json(v)))
                .collect()
        })
        .unwrap_or_default()
}

pub fn metadata_to_json(metadata: &Metadata) -> serde_json::Value {
    serde_json::Value::Object(
        metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// A record in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata,
        }
    }

    /// A document with a freshly generated UUID.
    pub fn with_generated_id(content: impl Into<String>, metadata: Metadata) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), content, metadata)
    }
}

/// A bounded segment of a parent document's content.
///
/// `start`/`end` are character offsets into the parent content; adjacent
/// chunks may overlap, and [`crate::chunk::reconstruct`] uses the offsets
/// to rebuild the parent exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub parent_id: String,
    pub index: usize,
    pub total: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub metadata: Metadata,
}

impl Chunk {
    pub fn id(&self) -> String {
        format!("{}_chunk_{}", self.parent_id, self.index)
    }

    /// Convert into a storable document, keyed by [`Chunk::id`].
    pub fn into_document(self) -> Document {
        let id = self.id();
        Document::new(id, self.text, self.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(MetadataValue::from_json(&json!(null)), MetadataValue::Null);
        assert_eq!(MetadataValue::from_json(&json!(true)), MetadataValue::Bool(true));
        assert_eq!(MetadataValue::from_json(&json!(42)), MetadataValue::Int(42));
        assert_eq!(MetadataValue::from_json(&json!(1.5)), MetadataValue::Float(1.5));
        assert_eq!(MetadataValue::from_json(&json!("x")), MetadataValue::from("x"));
    }

    #[test]
    fn test_string_array_becomes_list() {
        let v = MetadataValue::from_json(&json!(["a", "b"]));
        assert_eq!(v, MetadataValue::List(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_nested_values_are_stringified() {
        let v = MetadataValue::from_json(&json!({"k": [1, 2]}));
        assert_eq!(v, MetadataValue::Str(r#"{"k":[1,2]}"#.to_string()));

        let mixed = MetadataValue::from_json(&json!(["a", 1]));
        assert_eq!(mixed, MetadataValue::Str(r#"["a",1]"#.to_string()));
    }

    #[test]
    fn test_untagged_serde_roundtrip_shape() {
        let mut m = Metadata::new();
        m.insert("n".into(), MetadataValue::Int(3));
        m.insert("tags".into(), MetadataValue::List(vec!["x".into()]));
        let s = serde_json::to_string(&m).unwrap();
        assert_eq!(s, r#"{"n":3,"tags":["x"]}"#);
        let back: Metadata = serde_json::from_str(&s).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_chunk_id_and_document() {
        let c = Chunk {
            parent_id: "doc".into(),
            index: 2,
            total: 3,
            start: 0,
            end: 4,
            text: "text".into(),
            metadata: Metadata::new(),
        };
        assert_eq!(c.id(), "doc_chunk_2");
        assert_eq!(c.into_document().id, "doc_chunk_2");
    }
}
