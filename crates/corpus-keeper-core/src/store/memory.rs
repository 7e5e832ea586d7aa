//! In-memory [`DocumentStore`] implementation for tests and dry runs.
//!
//! Collections are insertion-ordered `Vec`s behind a `std::sync::RwLock`.
//! Enforces the same reserved-key protocol as the SQLite store.

use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Document, Metadata};
use crate::schema::ReservedKeys;

use super::{check_reserved, check_update_args, DocumentStore, GetQuery};

type Collections = BTreeMap<String, Vec<Document>>;

/// In-memory store for testing.
pub struct InMemoryStore {
    collections: RwLock<Collections>,
    reserved: ReservedKeys,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_reserved(ReservedKeys::default())
    }

    pub fn with_reserved(reserved: ReservedKeys) -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            reserved,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>, StoreError> {
        self.collections
            .read()
            .map_err(|_| StoreError::Backend("collection lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>, StoreError> {
        self.collections
            .write()
            .map_err(|_| StoreError::Backend("collection lock poisoned".into()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.read()?.keys().cloned().collect())
    }

    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        let mut collections = self.write()?;
        if collections.contains_key(name) {
            return Err(StoreError::CollectionExists(name.to_string()));
        }
        collections.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        self.write()?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    async fn get(&self, collection: &str, query: &GetQuery) -> Result<Vec<Document>, StoreError> {
        let collections = self.read()?;
        let docs = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        Ok(docs
            .iter()
            .filter(|d| query.matches(d))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn add(&self, collection: &str, documents: &[Document]) -> Result<(), StoreError> {
        check_reserved(
            &self.reserved,
            documents.iter().map(|d| (d.id.as_str(), &d.metadata)),
        )?;
        let mut collections = self.write()?;
        let docs = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;

        let mut ids: HashSet<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        for doc in documents {
            if !ids.insert(doc.id.as_str()) {
                return Err(StoreError::DuplicateId(doc.id.clone()));
            }
        }
        docs.extend(documents.iter().cloned());
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        ids: &[String],
        metadatas: &[Metadata],
    ) -> Result<(), StoreError> {
        check_update_args(ids, metadatas)?;
        check_reserved(
            &self.reserved,
            ids.iter().map(String::as_str).zip(metadatas.iter()),
        )?;
        let mut collections = self.write()?;
        let docs = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;

        let positions = ids
            .iter()
            .map(|id| {
                docs.iter()
                    .position(|d| &d.id == id)
                    .ok_or_else(|| StoreError::DocumentNotFound(id.clone()))
            })
            .collect::<Result<Vec<usize>, StoreError>>()?;
        for (pos, metadata) in positions.into_iter().zip(metadatas.iter()) {
            docs[pos].metadata = metadata.clone();
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut collections = self.write()?;
        let docs = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        let doomed: HashSet<&String> = ids.iter().collect();
        docs.retain(|d| !doomed.contains(&d.id));
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.read()?
            .get(collection)
            .map(Vec::len)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))
    }
}
