//! Mutation planning.
//!
//! A [`MutationPlan`] is computed read-only from a snapshot of a
//! collection. It lists every change a commit would make and the
//! expected outcome, so the caller can inspect (or discard) it before
//! anything is written. Plans start as dry runs; [`MutationPlan::confirm`]
//! is the only way to make one committable.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::chunk::{ExclusionReason, ExclusionReport};
use crate::dedup::DuplicateDetector;
use crate::hash::ContentHash;
use crate::models::{Document, Metadata, MetadataValue};
use crate::normalize::SchemaNormalizer;

/// What a mutation run does to a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationKind {
    /// Remove every non-representative member of each duplicate group.
    Deduplicate,
    /// Replace every document's metadata with its normalized form.
    NormalizeMetadata,
    /// Copy documents with unseen content in from another collection.
    Merge { source: String },
}

impl MutationKind {
    pub fn label(&self) -> &'static str {
        match self {
            MutationKind::Deduplicate => "dedup",
            MutationKind::NormalizeMetadata => "normalize",
            MutationKind::Merge { .. } => "merge",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Merge { source } => write!(f, "merge from '{}'", source),
            other => f.write_str(other.label()),
        }
    }
}

/// A single planned write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Remove {
        id: String,
        content_hash: ContentHash,
        representative: String,
    },
    Rewrite {
        id: String,
        metadata: Metadata,
    },
    Insert {
        document: Document,
    },
}

impl Change {
    pub fn id(&self) -> &str {
        match self {
            Change::Remove { id, .. } | Change::Rewrite { id, .. } => id,
            Change::Insert { document } => &document.id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationPlan {
    pub collection: String,
    pub kind: MutationKind,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub documents_before: usize,
    pub candidate_changes: Vec<Change>,
    pub estimated_removed: usize,
    pub estimated_kept: usize,
    /// Documents the plan had to leave out (schema violations, content
    /// already present in the target).
    pub excluded: ExclusionReport,
}

impl MutationPlan {
    fn new(collection: &str, kind: MutationKind, documents_before: usize, now: DateTime<Utc>) -> Self {
        Self {
            collection: collection.to_string(),
            kind,
            dry_run: true,
            created_at: now,
            documents_before,
            candidate_changes: Vec::new(),
            estimated_removed: 0,
            estimated_kept: documents_before,
            excluded: ExclusionReport::default(),
        }
    }

    /// Mark the plan as explicitly confirmed for commit.
    pub fn confirm(mut self) -> Self {
        self.dry_run = false;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.candidate_changes.is_empty()
    }

    /// Whether committing would delete or overwrite existing data.
    pub fn is_destructive(&self) -> bool {
        self.candidate_changes
            .iter()
            .any(|c| !matches!(c, Change::Insert { .. }))
    }

    pub fn removals(&self) -> usize {
        self.count(|c| matches!(c, Change::Remove { .. }))
    }

    pub fn rewrites(&self) -> usize {
        self.count(|c| matches!(c, Change::Rewrite { .. }))
    }

    pub fn inserts(&self) -> usize {
        self.count(|c| matches!(c, Change::Insert { .. }))
    }

    fn count(&self, pred: impl Fn(&Change) -> bool) -> usize {
        self.candidate_changes.iter().filter(|c| pred(c)).count()
    }
}

/// Plan removal of every duplicate except each group's representative.
pub fn plan_deduplicate(
    collection: &str,
    documents: &[Document],
    detector: &DuplicateDetector,
    now: DateTime<Utc>,
) -> MutationPlan {
    let mut plan = MutationPlan::new(collection, MutationKind::Deduplicate, documents.len(), now);
    let groups = detector.find_duplicates(documents);
    let doomed: HashSet<&str> = groups
        .values()
        .flat_map(|g| g.to_remove().iter().map(String::as_str))
        .collect();

    // Emit removals in store order so commits walk the collection front to back.
    for doc in documents.iter().filter(|d| doomed.contains(d.id.as_str())) {
        let hash = detector.hash(&doc.content);
        if let Some(group) = groups.get(&hash) {
            plan.candidate_changes.push(Change::Remove {
                id: doc.id.clone(),
                content_hash: hash.clone(),
                representative: group.representative().to_string(),
            });
        }
    }
    plan.estimated_removed = plan.candidate_changes.len();
    plan.estimated_kept = documents.len() - plan.estimated_removed;
    plan
}

/// Plan a metadata rewrite for every document whose metadata differs
/// from its normalized form. Rewrites carry a fresh `updated_timestamp`.
pub fn plan_normalize(
    collection: &str,
    documents: &[Document],
    normalizer: &SchemaNormalizer,
    now: DateTime<Utc>,
) -> MutationPlan {
    let mut plan = MutationPlan::new(collection, MutationKind::NormalizeMetadata, documents.len(), now);
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    for doc in documents {
        match normalizer.normalize_checked(&doc.metadata, &doc.content, &doc.id, now) {
            Ok(normalized) => {
                if without_stamp(&normalized.metadata) == without_stamp(&doc.metadata) {
                    continue;
                }
                let mut metadata = normalized.metadata;
                metadata.insert("updated_timestamp".into(), MetadataValue::Str(stamp.clone()));
                plan.candidate_changes.push(Change::Rewrite {
                    id: doc.id.clone(),
                    metadata,
                });
            }
            Err(violation) => {
                plan.excluded
                    .record(ExclusionReason::SchemaViolation, violation.document_id);
            }
        }
    }
    plan
}

/// Plan copying documents from `source` into `collection`. Content that
/// already exists in the target, or repeats inside the source, is
/// skipped (first seen wins). Ids that collide with target ids are
/// renamed to `{source}__{id}`.
pub fn plan_merge(
    collection: &str,
    source: &str,
    source_documents: &[Document],
    target_documents: &[Document],
    normalizer: &SchemaNormalizer,
    detector: &DuplicateDetector,
    now: DateTime<Utc>,
) -> MutationPlan {
    let kind = MutationKind::Merge {
        source: source.to_string(),
    };
    let mut plan = MutationPlan::new(collection, kind, target_documents.len(), now);

    let target_hashes: HashSet<ContentHash> = target_documents
        .iter()
        .map(|d| detector.hash(&d.content))
        .collect();
    let mut taken_ids: HashSet<String> = target_documents.iter().map(|d| d.id.clone()).collect();
    let mut admitted: HashSet<ContentHash> = HashSet::new();

    for doc in source_documents {
        let hash = detector.hash(&doc.content);
        if target_hashes.contains(&hash) {
            plan.excluded
                .record(ExclusionReason::DuplicateInCollection, doc.id.clone());
            continue;
        }
        if !admitted.insert(hash.clone()) {
            plan.excluded
                .record(ExclusionReason::DuplicateInBatch, doc.id.clone());
            continue;
        }

        let mut id = doc.id.clone();
        if taken_ids.contains(&id) {
            id = format!("{}__{}", source, doc.id);
            if taken_ids.contains(&id) {
                id = format!("{}__{}_{}", source, doc.id, hash.short());
            }
        }

        match normalizer.normalize_checked(&doc.metadata, &doc.content, &id, now) {
            Ok(normalized) => {
                let mut metadata = normalized.metadata;
                metadata.insert("merged_from".into(), source.into());
                taken_ids.insert(id.clone());
                plan.candidate_changes.push(Change::Insert {
                    document: Document::new(id, doc.content.clone(), metadata),
                });
            }
            Err(violation) => {
                plan.excluded
                    .record(ExclusionReason::SchemaViolation, violation.document_id);
            }
        }
    }
    plan.estimated_kept = target_documents.len() + plan.candidate_changes.len();
    plan
}

fn without_stamp(metadata: &Metadata) -> Metadata {
    let mut m = metadata.clone();
    m.remove("updated_timestamp");
    m
}
