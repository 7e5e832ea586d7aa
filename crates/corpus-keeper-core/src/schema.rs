//! The unified metadata schema.
//!
//! Every document accepted into a collection carries the ten
//! [`REQUIRED_FIELDS`]. Optional fields come from a fixed, open-ended
//! list ([`OPTIONAL_FIELDS`]); everything else is dropped during
//! normalization. Keys in the store's reserved namespace are never
//! written (see [`ReservedKeys`]).

use serde::Serialize;

use crate::error::SchemaViolation;
use crate::models::{Metadata, MetadataValue};

/// Version literal written to every normalized document.
pub const SCHEMA_VERSION: &str = "1.0";

/// Default reserved-key sentinel.
pub const DEFAULT_RESERVED_SENTINEL: &str = "_sys";

pub const REQUIRED_FIELDS: [&str; 10] = [
    "document_id",
    "content_hash",
    "project",
    "source",
    "timestamp",
    "content_type",
    "category",
    "source_type",
    "content_length",
    "version",
];

pub const OPTIONAL_FIELDS: &[&str] = &[
    "language",
    "complexity_score",
    "importance_score",
    "chunk_info",
    "quality_score",
    "tags",
    "title",
    "author",
    "file_path",
    "file_name",
    "file_hash",
    "parent_id",
    "chunk_index",
    "total_chunks",
    "batch_index",
    "start_offset",
    "end_offset",
    "updated_timestamp",
    "merged_from",
];

/// Allowed values of `source_type`.
pub const SOURCE_TYPES: [&str; 3] = ["file", "document", "manual"];

/// Exact content-type → category table. Keys are lowercase tokens.
const CATEGORY_TABLE: &[(&str, &str)] = &[
    ("pdf", "document"),
    ("doc", "document"),
    ("docx", "document"),
    ("odt", "document"),
    ("md", "documentation"),
    ("markdown", "documentation"),
    ("rst", "documentation"),
    ("txt", "text"),
    ("text", "text"),
    ("plain", "text"),
    ("html", "web"),
    ("htm", "web"),
    ("json", "data"),
    ("csv", "data"),
    ("yaml", "data"),
    ("yml", "data"),
    ("toml", "data"),
    ("rs", "code"),
    ("py", "code"),
    ("js", "code"),
    ("ts", "code"),
    ("go", "code"),
    ("email", "communication"),
    ("eml", "communication"),
];

/// Substring fallbacks for ambiguous legacy values, checked in order.
const CATEGORY_SUBSTRINGS: &[(&str, &str)] = &[
    ("report", "system_data"),
    ("log", "system_data"),
    ("readme", "documentation"),
    ("manual", "documentation"),
    ("guide", "documentation"),
    ("note", "notes"),
];

pub const DEFAULT_CATEGORY: &str = "general";

pub fn is_required(key: &str) -> bool {
    REQUIRED_FIELDS.contains(&key)
}

pub fn is_optional(key: &str) -> bool {
    OPTIONAL_FIELDS.contains(&key)
}

/// Reduce a legacy content-type string to a bare lowercase token:
/// `application/pdf` → `pdf`, `.MD` → `md`, `text/x-markdown` → `markdown`.
/// The result is a fixed point: feeding it back returns it unchanged.
pub fn content_type_token(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let essence = lower.split(';').next().unwrap_or(&lower);
    let after_slash = essence.rsplit('/').next().unwrap_or(essence);
    let after_dot = after_slash.rsplit('.').next().unwrap_or(after_slash);
    let mut token = after_dot.trim();
    while let Some(rest) = token.strip_prefix("x-") {
        token = rest.trim_start();
    }
    token.trim_end().to_string()
}

/// Map a content type to its category. Case-normalized, tolerant of
/// MIME types and substrings.
pub fn category_for(content_type: &str) -> &'static str {
    let token = content_type_token(content_type);
    if let Some((_, cat)) = CATEGORY_TABLE.iter().find(|(k, _)| *k == token) {
        return cat;
    }
    let lower = content_type.to_lowercase();
    CATEGORY_SUBSTRINGS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, cat)| *cat)
        .unwrap_or(DEFAULT_CATEGORY)
}

/// The store's reserved key namespace: any key equal to, or starting
/// with, the sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedKeys {
    sentinel: String,
}

impl ReservedKeys {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn is_reserved(&self, key: &str) -> bool {
        !self.sentinel.is_empty() && key.starts_with(&self.sentinel)
    }

    /// Remove every reserved key, returning the names removed.
    pub fn strip(&self, metadata: &mut Metadata) -> Vec<String> {
        let removed: Vec<String> = metadata
            .keys()
            .filter(|k| self.is_reserved(k))
            .cloned()
            .collect();
        for key in &removed {
            metadata.remove(key);
        }
        removed
    }

    pub fn first_violation<'a>(&self, metadata: &'a Metadata) -> Option<&'a str> {
        metadata
            .keys()
            .map(String::as_str)
            .find(|k| self.is_reserved(k))
    }
}

impl Default for ReservedKeys {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVED_SENTINEL)
    }
}

/// Check that all required fields are present with usable values.
pub fn validate_required(document_id: &str, metadata: &Metadata) -> Result<(), SchemaViolation> {
    for field in REQUIRED_FIELDS {
        let value = metadata
            .get(field)
            .ok_or_else(|| SchemaViolation::new(document_id, format!("missing {}", field)))?;
        let ok = match field {
            "content_length" => matches!(value, MetadataValue::Int(n) if *n >= 0),
            "source_type" => value
                .as_str()
                .map(|s| SOURCE_TYPES.contains(&s))
                .unwrap_or(false),
            _ => value.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false),
        };
        if !ok {
            return Err(SchemaViolation::new(
                document_id,
                format!("invalid {}: {}", field, value),
            ));
        }
    }
    Ok(())
}

/// Whether a required field counts as "present" for completeness stats.
pub fn field_present(metadata: &Metadata, field: &str) -> bool {
    metadata.get(field).map(|v| !v.is_blank()).unwrap_or(false)
}

/// Serializable description of the schema, embedded in report artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaDefinition {
    pub version: &'static str,
    pub required_fields: Vec<&'static str>,
    pub optional_fields: Vec<&'static str>,
    pub source_types: Vec<&'static str>,
    pub reserved_sentinel: String,
}

impl SchemaDefinition {
    pub fn new(reserved: &ReservedKeys) -> Self {
        Self {
            version: SCHEMA_VERSION,
            required_fields: REQUIRED_FIELDS.to_vec(),
            optional_fields: OPTIONAL_FIELDS.to_vec(),
            source_types: SOURCE_TYPES.to_vec(),
            reserved_sentinel: reserved.sentinel().to_string(),
        }
    }
}
