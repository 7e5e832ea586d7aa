//! Collection validation reports.
//!
//! [`ValidationReporter::report`] summarizes a snapshot of a collection:
//! how much duplicate content remains, how complete each required field
//! is, and whether the collection as a whole meets the schema.
//! An empty collection is trivially compliant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dedup::DuplicateDetector;
use crate::models::Document;
use crate::schema::{field_present, ReservedKeys, REQUIRED_FIELDS, SCHEMA_VERSION};

/// Average required-field completeness a collection must reach.
pub const COMPLIANCE_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub collection: String,
    pub generated_at: DateTime<Utc>,
    pub total_documents: usize,
    pub unique_content_count: usize,
    pub remaining_duplicate_groups: usize,
    /// Share of documents carrying each required field, in `[0, 1]`.
    pub field_completeness: BTreeMap<String, f64>,
    pub average_completeness: f64,
    pub schema_compliant: bool,
    /// Documents carrying a key from the reserved namespace.
    pub reserved_key_violations: usize,
    /// Documents whose stored `content_hash` no longer matches their content.
    pub stale_hashes: usize,
    pub schema_version_mismatches: usize,
}

impl ValidationReport {
    /// Fields below full completeness, lowest first.
    pub fn weakest_fields(&self) -> Vec<(&str, f64)> {
        let mut fields: Vec<(&str, f64)> = self
            .field_completeness
            .iter()
            .filter(|(_, ratio)| **ratio < 1.0)
            .map(|(f, r)| (f.as_str(), *r))
            .collect();
        fields.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(b.0)));
        fields
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReporter {
    detector: DuplicateDetector,
    reserved: ReservedKeys,
}

impl ValidationReporter {
    pub fn new(detector: DuplicateDetector, reserved: ReservedKeys) -> Self {
        Self { detector, reserved }
    }

    pub fn report(&self, collection: &str, documents: &[Document]) -> ValidationReport {
        self.report_at(collection, documents, Utc::now())
    }

    pub fn report_at(
        &self,
        collection: &str,
        documents: &[Document],
        now: DateTime<Utc>,
    ) -> ValidationReport {
        let analysis = self.detector.analyze(documents);
        let total = documents.len();

        let field_completeness: BTreeMap<String, f64> = REQUIRED_FIELDS
            .iter()
            .map(|field| {
                let ratio = if total == 0 {
                    1.0
                } else {
                    let present = documents
                        .iter()
                        .filter(|d| field_present(&d.metadata, field))
                        .count();
                    present as f64 / total as f64
                };
                (field.to_string(), ratio)
            })
            .collect();
        let average_completeness =
            field_completeness.values().sum::<f64>() / field_completeness.len() as f64;

        let mut reserved_key_violations = 0;
        let mut stale_hashes = 0;
        let mut schema_version_mismatches = 0;
        for doc in documents {
            if self.reserved.first_violation(&doc.metadata).is_some() {
                reserved_key_violations += 1;
            }
            if let Some(stored) = doc.metadata.get("content_hash").and_then(|v| v.as_str()) {
                if stored != self.detector.hash(&doc.content).as_str() {
                    stale_hashes += 1;
                }
            }
            if let Some(version) = doc.metadata.get("version").and_then(|v| v.as_str()) {
                if version != SCHEMA_VERSION {
                    schema_version_mismatches += 1;
                }
            }
        }

        ValidationReport {
            collection: collection.to_string(),
            generated_at: now,
            total_documents: total,
            unique_content_count: analysis.unique_content_count,
            remaining_duplicate_groups: analysis.duplicate_groups,
            field_completeness,
            average_completeness,
            schema_compliant: average_completeness >= COMPLIANCE_THRESHOLD,
            reserved_key_violations,
            stale_hashes,
            schema_version_mismatches,
        }
    }
}
