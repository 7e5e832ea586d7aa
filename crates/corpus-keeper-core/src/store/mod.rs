//! Document store abstraction.
//!
//! The [`DocumentStore`] trait is the only seam between the pipeline and
//! the external, schema-less store. It offers per-document CRUD grouped
//! into named collections and nothing more: no multi-document
//! transactions and no unique-content constraint. Everything else in the
//! pipeline is built on top of these operations.
//!
//! Implementations must be `Send + Sync` to work with async runtimes and
//! must reject any write that carries a key from the reserved namespace.

pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Document, Metadata, MetadataValue};
use crate::schema::ReservedKeys;

/// Selection for [`DocumentStore::get`].
///
/// Results always come back in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetQuery {
    pub ids: Option<Vec<String>>,
    pub filter: Option<(String, MetadataValue)>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl GetQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ids(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Metadata equality filter.
    pub fn filter(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self {
            filter: Some((key.into(), value.into())),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether a document passes the id and metadata filters (paging is
    /// applied separately).
    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &doc.id) {
                return false;
            }
        }
        if let Some((key, value)) = &self.filter {
            if doc.metadata.get(key) != Some(value) {
                return false;
            }
        }
        true
    }
}

/// Abstract document store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`list_collections`](DocumentStore::list_collections) | Names of all collections |
/// | [`create_collection`](DocumentStore::create_collection) | Create an empty collection |
/// | [`delete_collection`](DocumentStore::delete_collection) | Drop a collection and its documents |
/// | [`get`](DocumentStore::get) | Read documents by id, filter, or all |
/// | [`add`](DocumentStore::add) | Insert new documents |
/// | [`update`](DocumentStore::update) | Replace metadata of existing documents |
/// | [`delete`](DocumentStore::delete) | Remove documents by id |
/// | [`count`](DocumentStore::count) | Number of documents in a collection |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    async fn create_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, query: &GetQuery) -> Result<Vec<Document>, StoreError>;

    /// Insert documents. Fails on an id that already exists.
    async fn add(&self, collection: &str, documents: &[Document]) -> Result<(), StoreError>;

    /// Replace the metadata of existing documents, pairwise by index.
    async fn update(
        &self,
        collection: &str,
        ids: &[String],
        metadatas: &[Metadata],
    ) -> Result<(), StoreError>;

    /// Remove documents. Unknown ids are ignored.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError>;

    async fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// Release underlying resources. The default does nothing.
    async fn close(&self) {}
}

/// Reject a write carrying a reserved key.
pub fn check_reserved<'a>(
    reserved: &ReservedKeys,
    writes: impl IntoIterator<Item = (&'a str, &'a Metadata)>,
) -> Result<(), StoreError> {
    for (id, metadata) in writes {
        if let Some(key) = reserved.first_violation(metadata) {
            return Err(StoreError::ReservedKey {
                document_id: id.to_string(),
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

/// Validate `update` arguments.
pub fn check_update_args(ids: &[String], metadatas: &[Metadata]) -> Result<(), StoreError> {
    if ids.len() != metadatas.len() {
        return Err(StoreError::InvalidRequest(format!(
            "update got {} ids but {} metadata maps",
            ids.len(),
            metadatas.len()
        )));
    }
    Ok(())
}
