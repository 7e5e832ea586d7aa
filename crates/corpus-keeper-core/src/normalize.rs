//! Schema normalization: legacy metadata → unified metadata.
//!
//! [`SchemaNormalizer::normalize`] never fails. Missing or malformed
//! legacy values degrade to defaults so a single bad record cannot stop a
//! batch. The output always carries every field in
//! [`REQUIRED_FIELDS`](crate::schema::REQUIRED_FIELDS) and never carries
//! a reserved key.
//!
//! # Field resolution
//!
//! | Field | Sources, in priority order |
//! |-------|----------------------------|
//! | `content_type` | `content_type`, `type`, `source_type`¹, `document_type`, `"unknown"` |
//! | `project` | `project`, `project_name`, `collection`, default project |
//! | `source` | `source`, `file_path`, `file_name`, `url`, `"unknown"` |
//! | `timestamp` | `timestamp`, `created_at`, `date`, `ingested_at`, now |
//! | `source_type` | existing valid value, else `file`/`document`/`manual` by hints |
//! | `category` | existing value, else lookup on `content_type` |
//!
//! ¹ only when it is not itself a source-type literal.
//!
//! Re-normalizing an already-normalized map yields the same map.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::SchemaViolation;
use crate::hash::ContentHash;
use crate::models::{Metadata, MetadataValue};
use crate::schema::{
    self, category_for, content_type_token, ReservedKeys, SCHEMA_VERSION, SOURCE_TYPES,
};

const CONTENT_TYPE_KEYS: [&str; 4] = ["content_type", "type", "source_type", "document_type"];
const PROJECT_KEYS: [&str; 3] = ["project", "project_name", "collection"];
const SOURCE_KEYS: [&str; 4] = ["source", "file_path", "file_name", "url"];
const TIMESTAMP_KEYS: [&str; 4] = ["timestamp", "created_at", "date", "ingested_at"];

/// Result of normalizing one metadata map.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub metadata: Metadata,
    /// Legacy keys that had no place in the unified schema.
    pub dropped_keys: Vec<String>,
    /// Reserved keys that were stripped.
    pub stripped_reserved: Vec<String>,
}

/// Maps arbitrary legacy metadata into the unified schema.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    reserved: ReservedKeys,
    default_project: String,
}

impl Default for SchemaNormalizer {
    fn default() -> Self {
        Self::new(ReservedKeys::default())
    }
}

impl SchemaNormalizer {
    pub fn new(reserved: ReservedKeys) -> Self {
        Self {
            reserved,
            default_project: "default".to_string(),
        }
    }

    pub fn with_default_project(mut self, project: impl Into<String>) -> Self {
        self.default_project = project.into();
        self
    }

    pub fn reserved(&self) -> &ReservedKeys {
        &self.reserved
    }

    /// Normalize using the current time for a missing timestamp.
    pub fn normalize(&self, raw: &Metadata, content: &str, assigned_id: &str) -> Normalized {
        self.normalize_at(raw, content, assigned_id, Utc::now())
    }

    /// Normalize with an explicit clock. Deterministic given its inputs.
    pub fn normalize_at(
        &self,
        raw: &Metadata,
        content: &str,
        assigned_id: &str,
        now: DateTime<Utc>,
    ) -> Normalized {
        let mut legacy = raw.clone();
        let stripped_reserved = self.reserved.strip(&mut legacy);

        let mut out = Metadata::new();

        let document_id = if !assigned_id.trim().is_empty() {
            assigned_id.to_string()
        } else {
            text_field(&legacy, &["document_id"]).unwrap_or_default()
        };
        out.insert("document_id".into(), document_id.into());
        out.insert(
            "content_hash".into(),
            ContentHash::of(content).as_str().into(),
        );

        let project =
            text_field(&legacy, &PROJECT_KEYS).unwrap_or_else(|| self.default_project.clone());
        out.insert("project".into(), project.into());

        let source = text_field(&legacy, &SOURCE_KEYS).unwrap_or_else(|| "unknown".to_string());
        out.insert("source".into(), source.into());

        out.insert("timestamp".into(), resolve_timestamp(&legacy, now).into());

        let content_type = resolve_content_type(&legacy);
        let category = text_field(&legacy, &["category"])
            .unwrap_or_else(|| category_for(&content_type).to_string());
        out.insert("content_type".into(), content_type.into());
        out.insert("category".into(), category.into());
        out.insert("source_type".into(), resolve_source_type(&legacy).into());

        out.insert(
            "content_length".into(),
            MetadataValue::Int(content.chars().count() as i64),
        );
        out.insert("version".into(), SCHEMA_VERSION.into());

        let mut dropped_keys = Vec::new();
        for (key, value) in legacy {
            if schema::is_required(&key) {
                continue;
            }
            if schema::is_optional(&key) {
                out.insert(key, value);
            } else {
                dropped_keys.push(key);
            }
        }

        Normalized {
            metadata: out,
            dropped_keys,
            stripped_reserved,
        }
    }

    /// Normalize and check the result, failing only when the document has
    /// no usable identity.
    pub fn normalize_checked(
        &self,
        raw: &Metadata,
        content: &str,
        assigned_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Normalized, SchemaViolation> {
        let normalized = self.normalize_at(raw, content, assigned_id, now);
        let label = if assigned_id.is_empty() {
            "<unassigned>"
        } else {
            assigned_id
        };
        schema::validate_required(label, &normalized.metadata).map_err(|v| {
            if v.reason.contains("document_id") {
                SchemaViolation::new(label, "missing_identity")
            } else {
                v
            }
        })?;
        Ok(normalized)
    }
}

/// First non-blank text value among `keys`.
fn text_field(metadata: &Metadata, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| metadata.get(*k))
        .filter_map(MetadataValue::as_text)
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

fn resolve_content_type(legacy: &Metadata) -> String {
    for key in CONTENT_TYPE_KEYS {
        let Some(text) = text_field(legacy, &[key]) else {
            continue;
        };
        if key == "source_type" && SOURCE_TYPES.contains(&text.as_str()) {
            continue;
        }
        let token = content_type_token(&text);
        if !token.is_empty() {
            return token;
        }
    }
    "unknown".to_string()
}

fn resolve_source_type(legacy: &Metadata) -> &'static str {
    if let Some(existing) = text_field(legacy, &["source_type"]) {
        if let Some(st) = SOURCE_TYPES.iter().find(|s| **s == existing) {
            return st;
        }
    }
    if text_field(legacy, &["file_path"]).is_some() {
        "file"
    } else if text_field(legacy, &["document_type"]).is_some() {
        "document"
    } else {
        "manual"
    }
}

fn resolve_timestamp(legacy: &Metadata, now: DateTime<Utc>) -> String {
    for key in TIMESTAMP_KEYS {
        match legacy.get(key) {
            Some(MetadataValue::Str(s)) if !s.trim().is_empty() => return s.trim().to_string(),
            Some(MetadataValue::Int(secs)) => {
                if let Some(dt) = Utc.timestamp_opt(*secs, 0).single() {
                    return dt.to_rfc3339_opts(SecondsFormat::Secs, true);
                }
            }
            Some(MetadataValue::Float(secs)) => {
                if let Some(dt) = Utc.timestamp_opt(*secs as i64, 0).single() {
                    return dt.to_rfc3339_opts(SecondsFormat::Secs, true);
                }
            }
            _ => {}
        }
    }
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}
