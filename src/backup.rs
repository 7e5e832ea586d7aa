//! Collection snapshots and restore.
//!
//! A backup is one JSON artifact per snapshot, named
//! `{collection}_{YYYYmmddTHHMMSSffffffZ}.json` inside the configured
//! backup directory:
//!
//! ```json
//! {
//!   "backup_info": {"collection_name": "...", "timestamp": "...",
//!                   "document_count": 2, "schema_version": "1.0"},
//!   "ids": ["a", "b"],
//!   "documents": ["content of a", "content of b"],
//!   "metadatas": [{...}, {...}]
//! }
//! ```
//!
//! The three arrays are parallel and in store order, so the file can be
//! restored without this crate. Artifacts are written to a temporary
//! file, renamed into place, marked read-only, then read back and
//! verified before the snapshot counts as taken.
//!
//! Restore checks the whole artifact (parallel arrays, unique ids, no
//! reserved keys) before it touches the target collection, and holds the
//! target's collection lock while it replaces the contents.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use corpus_keeper_core::models::{Document, Metadata};
use corpus_keeper_core::schema::{ReservedKeys, SCHEMA_VERSION};
use corpus_keeper_core::store::check_reserved;

use crate::client::StoreClient;
use crate::error::{PipelineError, PipelineResult};
use crate::mutation::CollectionLock;

const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub collection_name: String,
    pub timestamp: DateTime<Utc>,
    pub document_count: usize,
    pub schema_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub backup_info: BackupInfo,
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<Metadata>,
}

impl BackupArtifact {
    fn new(collection: &str, timestamp: DateTime<Utc>, docs: &[Document]) -> Self {
        Self {
            backup_info: BackupInfo {
                collection_name: collection.to_string(),
                timestamp,
                document_count: docs.len(),
                schema_version: SCHEMA_VERSION.to_string(),
            },
            ids: docs.iter().map(|d| d.id.clone()).collect(),
            documents: docs.iter().map(|d| d.content.clone()).collect(),
            metadatas: docs.iter().map(|d| d.metadata.clone()).collect(),
        }
    }

    /// Read and structurally check an artifact.
    pub fn read(path: &Path) -> PipelineResult<Self> {
        let raw = fs::read_to_string(path)?;
        let artifact: BackupArtifact = serde_json::from_str(&raw)?;
        let n = artifact.backup_info.document_count;
        if artifact.ids.len() != n || artifact.documents.len() != n || artifact.metadatas.len() != n
        {
            return Err(PipelineError::backup(
                &artifact.backup_info.collection_name,
                format!(
                    "{} is inconsistent: document_count {} but {} ids, {} documents, {} metadatas",
                    path.display(),
                    n,
                    artifact.ids.len(),
                    artifact.documents.len(),
                    artifact.metadatas.len()
                ),
            ));
        }
        Ok(artifact)
    }

    /// Check that the artifact can be written back as-is: every id is
    /// non-blank and unique, and no metadata map carries a reserved key.
    pub fn check_restorable(&self, reserved: &ReservedKeys) -> PipelineResult<()> {
        let collection = &self.backup_info.collection_name;
        let mut seen = HashSet::with_capacity(self.ids.len());
        for id in &self.ids {
            if id.trim().is_empty() {
                return Err(PipelineError::backup(collection, "artifact contains a blank id"));
            }
            if !seen.insert(id.as_str()) {
                return Err(PipelineError::backup(
                    collection,
                    format!("artifact contains duplicate id '{}'", id),
                ));
            }
        }
        check_reserved(
            reserved,
            self.ids.iter().map(String::as_str).zip(&self.metadatas),
        )
        .map_err(|err| PipelineError::backup(collection, format!("artifact rejected: {}", err)))
    }

    pub fn into_documents(self) -> Vec<Document> {
        self.ids
            .into_iter()
            .zip(self.documents)
            .zip(self.metadatas)
            .map(|((id, content), metadata)| Document::new(id, content, metadata))
            .collect()
    }
}

/// A verified snapshot on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    pub path: PathBuf,
    pub info: BackupInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreReport {
    pub collection: String,
    pub source: PathBuf,
    pub documents_restored: usize,
}

pub struct BackupCoordinator<'a> {
    client: &'a StoreClient,
    dir: PathBuf,
    batch_size: usize,
    reserved: ReservedKeys,
}

impl<'a> BackupCoordinator<'a> {
    pub fn new(client: &'a StoreClient, dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            dir: dir.into(),
            batch_size: 100,
            reserved: ReservedKeys::default(),
        }
    }

    pub fn with_reserved(mut self, reserved: ReservedKeys) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the full collection. Any failure other than a timeout is
    /// reported as [`PipelineError::BackupFailure`].
    pub async fn snapshot(&self, collection: &str) -> PipelineResult<Backup> {
        let docs = self
            .client
            .get_all(collection)
            .await
            .map_err(|err| err.into_backup_failure(collection))?;
        let timestamp = Utc::now();
        let artifact = BackupArtifact::new(collection, timestamp, &docs);
        let path = self
            .write_artifact(&artifact)
            .map_err(|err| err.into_backup_failure(collection))?;
        self.verify(&path, &docs)
            .map_err(|err| err.into_backup_failure(collection))?;

        tracing::info!(
            collection,
            documents = docs.len(),
            path = %path.display(),
            "backup written"
        );
        Ok(Backup {
            path,
            info: artifact.backup_info,
        })
    }

    fn write_artifact(&self, artifact: &BackupArtifact) -> PipelineResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let info = &artifact.backup_info;
        let name = format!(
            "{}_{}.json",
            file_safe(&info.collection_name),
            info.timestamp.format(FILE_TIMESTAMP_FORMAT)
        );
        let path = self.dir.join(&name);
        if path.exists() {
            return Err(PipelineError::backup(
                &info.collection_name,
                format!("{} already exists", path.display()),
            ));
        }

        let tmp = self.dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, serde_json::to_vec_pretty(artifact)?)?;
        fs::rename(&tmp, &path)?;

        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms)?;
        Ok(path)
    }

    fn verify(&self, path: &Path, docs: &[Document]) -> PipelineResult<()> {
        let artifact = BackupArtifact::read(path)?;
        if artifact.backup_info.document_count != docs.len() {
            return Err(PipelineError::backup(
                &artifact.backup_info.collection_name,
                format!(
                    "verification failed: wrote {} documents, read back {}",
                    docs.len(),
                    artifact.backup_info.document_count
                ),
            ));
        }
        if artifact.ids.iter().zip(docs).any(|(id, doc)| *id != doc.id) {
            return Err(PipelineError::backup(
                &artifact.backup_info.collection_name,
                "verification failed: ids differ from the collection",
            ));
        }
        Ok(())
    }

    /// Recreate `into` (default: the original collection) empty and
    /// insert the snapshot unchanged, in its original order. An artifact
    /// that fails [`BackupArtifact::check_restorable`] leaves the target
    /// untouched.
    pub async fn restore(&self, path: &Path, into: Option<&str>) -> PipelineResult<RestoreReport> {
        let artifact = BackupArtifact::read(path)?;
        artifact.check_restorable(&self.reserved)?;
        let collection = into
            .unwrap_or(&artifact.backup_info.collection_name)
            .to_string();
        let _lock = CollectionLock::acquire(&self.dir.join(".locks"), &collection)?;
        let docs = artifact.into_documents();

        if self.client.list_collections().await?.contains(&collection) {
            self.client.delete_collection(&collection).await?;
        }
        self.client.create_collection(&collection).await?;
        for batch in docs.chunks(self.batch_size) {
            self.client.add(&collection, batch).await?;
        }

        tracing::info!(
            collection = %collection,
            documents = docs.len(),
            source = %path.display(),
            "collection restored"
        );
        Ok(RestoreReport {
            collection,
            source: path.to_path_buf(),
            documents_restored: docs.len(),
        })
    }
}

/// A backup artifact found on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub info: BackupInfo,
}

#[derive(Deserialize)]
struct Header {
    backup_info: BackupInfo,
}

/// Artifacts in `dir`, newest first, optionally for one collection.
/// Files that are not backups are skipped.
pub fn list_backups(dir: &Path, collection: Option<&str>) -> PipelineResult<Vec<BackupEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") || !path.is_file() {
            continue;
        }
        let header: Header = match fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
        {
            Some(header) => header,
            None => {
                tracing::debug!(path = %path.display(), "skipping non-backup file");
                continue;
            }
        };
        if collection.is_some_and(|c| c != header.backup_info.collection_name) {
            continue;
        }
        entries.push(BackupEntry {
            path,
            info: header.backup_info,
        });
    }
    entries.sort_by(|a, b| {
        b.info
            .timestamp
            .cmp(&a.info.timestamp)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(entries)
}

pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CallPolicy;
    use corpus_keeper_core::models::MetadataValue;
    use corpus_keeper_core::store::memory::InMemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn seeded_client() -> StoreClient {
        let client = StoreClient::new(Arc::new(InMemoryStore::new()), CallPolicy::default());
        client.create_collection("notes").await.unwrap();
        let mut meta = Metadata::new();
        meta.insert("title".into(), MetadataValue::from("first"));
        client
            .add(
                "notes",
                &[
                    Document::new("b", "beta", meta),
                    Document::new("a", "alpha", Metadata::new()),
                ],
            )
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_snapshot_writes_readonly_verified_artifact() {
        let tmp = TempDir::new().unwrap();
        let client = seeded_client().await;
        let coordinator = BackupCoordinator::new(&client, tmp.path());

        let backup = coordinator.snapshot("notes").await.unwrap();
        assert_eq!(backup.info.document_count, 2);
        assert_eq!(backup.info.schema_version, "1.0");
        let name = backup.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("notes_") && name.ends_with("Z.json"), "{}", name);
        assert!(fs::metadata(&backup.path).unwrap().permissions().readonly());

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&backup.path).unwrap()).unwrap();
        assert_eq!(raw["ids"], serde_json::json!(["b", "a"]));
        assert_eq!(raw["documents"][1], "alpha");
        assert_eq!(raw["metadatas"][0]["title"], "first");
        assert_eq!(raw["backup_info"]["collection_name"], "notes");
    }

    #[tokio::test]
    async fn test_restore_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let client = seeded_client().await;
        let coordinator = BackupCoordinator::new(&client, tmp.path());
        let before = client.get_all("notes").await.unwrap();

        let backup = coordinator.snapshot("notes").await.unwrap();
        client.delete("notes", &["a".to_string()]).await.unwrap();
        client
            .add("notes", &[Document::new("c", "gamma", Metadata::new())])
            .await
            .unwrap();

        let report = coordinator.restore(&backup.path, None).await.unwrap();
        assert_eq!(report.documents_restored, 2);
        assert_eq!(client.get_all("notes").await.unwrap(), before);

        coordinator
            .restore(&backup.path, Some("notes_copy"))
            .await
            .unwrap();
        assert_eq!(client.get_all("notes_copy").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_snapshot_of_missing_collection_is_backup_failure() {
        let tmp = TempDir::new().unwrap();
        let client = seeded_client().await;
        let err = BackupCoordinator::new(&client, tmp.path())
            .snapshot("nope")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BackupFailure { .. }));
    }

    #[tokio::test]
    async fn test_list_backups_newest_first() {
        let tmp = TempDir::new().unwrap();
        let client = seeded_client().await;
        client.create_collection("other").await.unwrap();
        let coordinator = BackupCoordinator::new(&client, tmp.path());

        let first = coordinator.snapshot("notes").await.unwrap();
        coordinator.snapshot("other").await.unwrap();
        let second = coordinator.snapshot("notes").await.unwrap();
        fs::write(tmp.path().join("stray.json"), "{}").unwrap();

        let all = list_backups(tmp.path(), None).unwrap();
        assert_eq!(all.len(), 3);
        let notes = list_backups(tmp.path(), Some("notes")).unwrap();
        let paths: Vec<&PathBuf> = notes.iter().map(|e| &e.path).collect();
        assert_eq!(paths, vec![&second.path, &first.path]);
    }

    fn write_artifact_json(dir: &Path, ids: &str, metadatas: &str) -> PathBuf {
        let path = dir.join("handmade.json");
        fs::write(
            &path,
            format!(
                r#"{{"backup_info":{{"collection_name":"live","timestamp":"2024-01-01T00:00:00Z","document_count":2,"schema_version":"1.0"}},"ids":{},"documents":["x","y"],"metadatas":{}}}"#,
                ids, metadatas
            ),
        )
        .unwrap();
        path
    }

    async fn live_client() -> StoreClient {
        let client = StoreClient::new(Arc::new(InMemoryStore::new()), CallPolicy::default());
        client.create_collection("live").await.unwrap();
        client
            .add("live", &[Document::new("keep", "kept", Metadata::new())])
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_restore_with_duplicate_ids_leaves_target_intact() {
        let tmp = TempDir::new().unwrap();
        let client = live_client().await;
        let before = client.get_all("live").await.unwrap();
        let path = write_artifact_json(tmp.path(), r#"["a","a"]"#, "[{},{}]");

        let err = BackupCoordinator::new(&client, tmp.path())
            .restore(&path, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BackupFailure { .. }), "{}", err);
        assert!(err.to_string().contains("duplicate id 'a'"));
        assert_eq!(client.get_all("live").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_restore_with_reserved_key_leaves_target_intact() {
        let tmp = TempDir::new().unwrap();
        let client = live_client().await;
        let before = client.get_all("live").await.unwrap();
        let path = write_artifact_json(tmp.path(), r#"["a","b"]"#, r#"[{},{"_sys_owner":"x"}]"#);

        let err = BackupCoordinator::new(&client, tmp.path())
            .with_reserved(ReservedKeys::default())
            .restore(&path, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BackupFailure { .. }), "{}", err);
        assert_eq!(client.get_all("live").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_restore_refuses_locked_collection() {
        let tmp = TempDir::new().unwrap();
        let client = seeded_client().await;
        let coordinator = BackupCoordinator::new(&client, tmp.path());
        let backup = coordinator.snapshot("notes").await.unwrap();
        client.delete("notes", &["a".to_string()]).await.unwrap();

        let held = CollectionLock::acquire(&tmp.path().join(".locks"), "notes").unwrap();
        let err = coordinator.restore(&backup.path, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Locked { .. }));
        assert_eq!(client.count("notes").await.unwrap(), 1);

        drop(held);
        coordinator.restore(&backup.path, None).await.unwrap();
        assert_eq!(client.count("notes").await.unwrap(), 2);
    }

    #[test]
    fn test_inconsistent_artifact_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        fs::write(
            &path,
            r#"{"backup_info":{"collection_name":"x","timestamp":"2024-01-01T00:00:00Z","document_count":2,"schema_version":"1.0"},"ids":["a"],"documents":["x"],"metadatas":[{}]}"#,
        )
        .unwrap();
        assert!(matches!(
            BackupArtifact::read(&path).unwrap_err(),
            PipelineError::BackupFailure { .. }
        ));
    }
}
