//! SQLite-backed [`DocumentStore`] implementation.
//!
//! Collections are rows in `collections`; documents live in one
//! `documents` table keyed by `(collection, id)`. The autoincrement `seq`
//! column is the store ordering every read returns, so duplicate
//! detection sees documents in the order they were added. Metadata is
//! stored as a JSON object in `metadata_json`.
//!
//! Multi-document writes run inside one SQLite transaction, so a
//! rejected `add` leaves no partial rows behind.

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use corpus_keeper_core::models::{Document, Metadata};
use corpus_keeper_core::schema::ReservedKeys;
use corpus_keeper_core::store::{check_reserved, check_update_args, DocumentStore, GetQuery};
use corpus_keeper_core::StoreError;

/// SQLite implementation of the [`DocumentStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    reserved: ReservedKeys,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, reserved: ReservedKeys) -> Self {
        Self { pool, reserved }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_collection(&self, name: &str) -> Result<(), StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::CollectionNotFound(name.to_string()))
        }
    }

    async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        self.pool.begin().await.map_err(map_sqlx)
    }
}

/// Classify a sqlx error: pool and I/O problems (and a busy database)
/// are transient, everything else is a backend failure.
fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            if msg.contains("locked") || msg.contains("busy") {
                StoreError::Unavailable(err.to_string())
            } else {
                StoreError::Backend(err.to_string())
            }
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document, StoreError> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json)?;
    Ok(Document {
        id: row.get("id"),
        content: row.get("content"),
        metadata,
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT name FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidRequest("collection name is empty".into()));
        }
        let result = sqlx::query("INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CollectionExists(name.to_string()));
        }
        tracing::debug!(collection = name, "created collection");
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let result = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CollectionNotFound(name.to_string()));
        }
        tx.commit().await.map_err(map_sqlx)?;
        tracing::debug!(collection = name, "deleted collection");
        Ok(())
    }

    async fn get(&self, collection: &str, query: &GetQuery) -> Result<Vec<Document>, StoreError> {
        self.ensure_collection(collection).await?;

        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
            "SELECT id, content, metadata_json FROM documents WHERE collection = ",
        );
        builder.push_bind(collection);
        if let Some(ids) = &query.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");
        }
        builder.push(" ORDER BY seq");

        // Metadata filters are evaluated in Rust, so paging has to follow them.
        let page_in_sql = query.filter.is_none();
        if page_in_sql {
            builder.push(" LIMIT ");
            builder.push_bind(query.limit.map(|l| l as i64).unwrap_or(-1));
            builder.push(" OFFSET ");
            builder.push_bind(query.offset as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let docs = rows
            .iter()
            .map(row_to_document)
            .collect::<Result<Vec<_>, _>>()?;

        if page_in_sql {
            return Ok(docs);
        }
        Ok(docs
            .into_iter()
            .filter(|d| query.matches(d))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn add(&self, collection: &str, documents: &[Document]) -> Result<(), StoreError> {
        check_reserved(
            &self.reserved,
            documents.iter().map(|d| (d.id.as_str(), &d.metadata)),
        )?;
        self.ensure_collection(collection).await?;

        let mut tx = self.begin().await?;
        for doc in documents {
            let metadata_json = serde_json::to_string(&doc.metadata)?;
            let result = sqlx::query(
                "INSERT INTO documents (collection, id, content, metadata_json) VALUES (?, ?, ?, ?)",
            )
            .bind(collection)
            .bind(&doc.id)
            .bind(&doc.content)
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await;
            match result {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => {
                    return Err(StoreError::DuplicateId(doc.id.clone()));
                }
                Err(err) => return Err(map_sqlx(err)),
            }
        }
        tx.commit().await.map_err(map_sqlx)?;
        tracing::debug!(collection, count = documents.len(), "added documents");
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
        self.ensure_collection(collection).await?;

        let mut tx = self.begin().await?;
        for (id, metadata) in ids.iter().zip(metadatas) {
            let result =
                sqlx::query("UPDATE documents SET metadata_json = ? WHERE collection = ? AND id = ?")
                    .bind(serde_json::to_string(metadata)?)
                    .bind(collection)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
            if result.rows_affected() == 0 {
                return Err(StoreError::DocumentNotFound(id.clone()));
            }
        }
        tx.commit().await.map_err(map_sqlx)?;
        tracing::debug!(collection, count = ids.len(), "updated metadata");
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError> {
        self.ensure_collection(collection).await?;
        if ids.is_empty() {
            return Ok(());
        }

        let mut builder =
            sqlx::QueryBuilder::<Sqlite>::new("DELETE FROM documents WHERE collection = ");
        builder.push_bind(collection);
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        tracing::debug!(
            collection,
            requested = ids.len(),
            deleted = result.rows_affected(),
            "deleted documents"
        );
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.ensure_collection(collection).await?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(n as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
