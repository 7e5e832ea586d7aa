//! The store client context object.
//!
//! A [`StoreClient`] owns one [`DocumentStore`] and the call policy for
//! it. It is opened explicitly, passed by reference to every pipeline
//! stage, and closed when the command finishes. There is no process-wide
//! connection cache.
//!
//! Every call runs under a bounded timeout. Transient errors
//! ([`StoreError::is_transient`]) are retried up to `max_retries` times
//! with linear backoff; a timeout is never retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use corpus_keeper_core::models::{Document, Metadata};
use corpus_keeper_core::store::{DocumentStore, GetQuery};
use corpus_keeper_core::StoreError;

use crate::config::{Config, MutationConfig};
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Timeout and retry settings applied to every store call.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl CallPolicy {
    pub fn from_config(config: &MutationConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_config(&MutationConfig::default())
    }
}

pub struct StoreClient {
    store: Arc<dyn DocumentStore>,
    policy: CallPolicy,
}

impl StoreClient {
    /// Connect to the configured SQLite store, creating the schema if
    /// needed.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        let store = SqliteStore::new(pool, config.reserved_keys());
        Ok(Self::new(
            Arc::new(store),
            CallPolicy::from_config(&config.mutation),
        ))
    }

    pub fn new(store: Arc<dyn DocumentStore>, policy: CallPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> CallPolicy {
        self.policy
    }

    pub async fn close(self) {
        self.store.close().await;
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> PipelineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(self.policy.timeout, f()).await {
                Err(_) => {
                    tracing::warn!(operation, secs = self.policy.timeout.as_secs(), "store call timed out");
                    return Err(PipelineError::Timeout {
                        operation: operation.to_string(),
                        secs: self.policy.timeout.as_secs(),
                        backup: None,
                    });
                }
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_transient() && attempt <= self.policy.max_retries => {
                    tracing::warn!(operation, attempt, error = %err, "transient store error, retrying");
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Ok(Err(err)) if err.is_transient() => {
                    return Err(PipelineError::TransientStore {
                        attempts: attempt,
                        source: err,
                    });
                }
                Ok(Err(err)) => return Err(PipelineError::Store(err)),
            }
        }
    }

    pub async fn list_collections(&self) -> PipelineResult<Vec<String>> {
        self.call("list_collections", || self.store.list_collections())
            .await
    }

    pub async fn create_collection(&self, name: &str) -> PipelineResult<()> {
        self.call("create_collection", || self.store.create_collection(name))
            .await
    }

    pub async fn delete_collection(&self, name: &str) -> PipelineResult<()> {
        self.call("delete_collection", || self.store.delete_collection(name))
            .await
    }

    pub async fn get(&self, collection: &str, query: &GetQuery) -> PipelineResult<Vec<Document>> {
        self.call("get", || self.store.get(collection, query)).await
    }

    /// Every document in store order.
    pub async fn get_all(&self, collection: &str) -> PipelineResult<Vec<Document>> {
        self.get(collection, &GetQuery::all()).await
    }

    pub async fn add(&self, collection: &str, documents: &[Document]) -> PipelineResult<()> {
        self.call("add", || self.store.add(collection, documents))
            .await
    }

    pub async fn update(
        &self,
        collection: &str,
        ids: &[String],
        metadatas: &[Metadata],
    ) -> PipelineResult<()> {
        self.call("update", || self.store.update(collection, ids, metadatas))
            .await
    }

    pub async fn delete(&self, collection: &str, ids: &[String]) -> PipelineResult<()> {
        self.call("delete", || self.store.delete(collection, ids))
            .await
    }

    pub async fn count(&self, collection: &str) -> PipelineResult<usize> {
        self.call("count", || self.store.count(collection)).await
    }

    /// Create the collection unless it already exists.
    pub async fn ensure_collection(&self, name: &str) -> PipelineResult<()> {
        match self.create_collection(name).await {
            Ok(()) | Err(PipelineError::Store(StoreError::CollectionExists(_))) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
