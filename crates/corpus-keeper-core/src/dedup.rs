//! Exact-content duplicate detection.
//!
//! Documents are grouped by [`ContentHash`] in a single pass. Within a
//! group the first member in input order is the representative; every
//! later member is marked for removal. The choice is deliberately not
//! quality-aware, so the outcome only depends on input order.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::hash::{ContentHash, HashMode};
use crate::models::Document;

/// Documents sharing one content hash, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub content_hash: ContentHash,
    pub members: Vec<String>,
}

impl DuplicateGroup {
    /// The surviving member (first seen).
    pub fn representative(&self) -> &str {
        &self.members[0]
    }

    /// Members marked for removal.
    pub fn to_remove(&self) -> &[String] {
        &self.members[1..]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Totals for a duplicate scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateAnalysis {
    pub total_documents: usize,
    pub unique_content_count: usize,
    pub duplicate_groups: usize,
    pub documents_to_remove: usize,
    #[serde(skip)]
    pub groups: BTreeMap<ContentHash, DuplicateGroup>,
}

impl DuplicateAnalysis {
    /// Ids to delete, sorted.
    pub fn removal_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .groups
            .values()
            .flat_map(|g| g.to_remove().iter().map(String::as_str))
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateDetector {
    mode: HashMode,
}

impl DuplicateDetector {
    pub fn new(mode: HashMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> HashMode {
        self.mode
    }

    pub fn hash(&self, content: &str) -> ContentHash {
        ContentHash::with_mode(content, self.mode)
    }

    /// Groups of two or more documents with equal content hashes.
    pub fn find_duplicates(&self, documents: &[Document]) -> BTreeMap<ContentHash, DuplicateGroup> {
        self.group_all(documents)
            .into_iter()
            .filter(|(_, group)| group.len() > 1)
            .collect()
    }

    pub fn analyze(&self, documents: &[Document]) -> DuplicateAnalysis {
        let all = self.group_all(documents);
        let unique_content_count = all.len();
        let groups: BTreeMap<ContentHash, DuplicateGroup> =
            all.into_iter().filter(|(_, g)| g.len() > 1).collect();
        let documents_to_remove = groups.values().map(|g| g.len() - 1).sum();
        DuplicateAnalysis {
            total_documents: documents.len(),
            unique_content_count,
            duplicate_groups: groups.len(),
            documents_to_remove,
            groups,
        }
    }

    fn group_all(&self, documents: &[Document]) -> HashMap<ContentHash, DuplicateGroup> {
        let mut index: HashMap<ContentHash, DuplicateGroup> = HashMap::with_capacity(documents.len());
        for doc in documents {
            let hash = self.hash(&doc.content);
            index
                .entry(hash.clone())
                .or_insert_with(|| DuplicateGroup {
                    content_hash: hash,
                    members: Vec::new(),
                })
                .members
                .push(doc.id.clone());
        }
        index
    }
}

/// Streaming first-seen filter used while accumulating an ingestion
/// batch: `admit` returns `false` for content already seen in the batch
/// or already present in the collection.
#[derive(Debug, Default)]
pub struct SeenHashes {
    existing: HashSet<ContentHash>,
    batch: HashSet<ContentHash>,
}

/// Outcome of [`SeenHashes::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    New,
    DuplicateInBatch,
    DuplicateInCollection,
}

impl SeenHashes {
    pub fn with_existing(existing: impl IntoIterator<Item = ContentHash>) -> Self {
        Self {
            existing: existing.into_iter().collect(),
            batch: HashSet::new(),
        }
    }

    pub fn admit(&mut self, hash: &ContentHash) -> Admission {
        if self.existing.contains(hash) {
            Admission::DuplicateInCollection
        } else if !self.batch.insert(hash.clone()) {
            Admission::DuplicateInBatch
        } else {
            Admission::New
        }
    }
}
