//! Ingestion pipeline.
//!
//! Reads raw records, then runs them through
//! validate → split → normalize → screen → dedup → add.
//!
//! Records come from either a JSONL file (one `{"id"?, "content",
//! "metadata"?}` object per line) or a directory scanned with the
//! configured include/exclude globs. Preparation is CPU-only and fans out
//! over rayon; results are re-joined in arrival order before dedup so
//! the first-seen copy of repeated content always wins.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use walkdir::WalkDir;

use corpus_keeper_core::chunk::{ChunkValidator, Chunker, ExclusionReason, ExclusionReport};
use corpus_keeper_core::dedup::{Admission, DuplicateDetector, SeenHashes};
use corpus_keeper_core::models::Document;
use corpus_keeper_core::normalize::SchemaNormalizer;
use corpus_keeper_core::{ContentHash, StoreError};

use crate::client::StoreClient;
use crate::config::Config;
use crate::error::PipelineError;

/// One unprocessed input record.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Where the record came from (`file.jsonl:3`, `notes/a.md`).
    pub origin: String,
    pub id: Option<String>,
    pub content: Value,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub success: bool,
    pub dry_run: bool,
    pub records_read: usize,
    /// Documents written, or that would be written on a dry run.
    pub documents_added: usize,
    pub chunks_created: usize,
    pub duplicates_skipped: usize,
    pub excluded: ExclusionReport,
    pub failures: Vec<String>,
}

/// Output of preparing one record: zero or more storable documents.
#[derive(Debug, Default)]
struct Prepared {
    documents: Vec<Document>,
    chunks: usize,
    excluded: ExclusionReport,
}

/// Read records from `path`: a directory is scanned, anything else is
/// read as JSONL.
pub fn read_records(config: &Config, path: &Path) -> Result<Vec<RawRecord>> {
    if !path.exists() {
        bail!("Ingest path does not exist: {}", path.display());
    }
    if path.is_dir() {
        scan_directory(config, path)
    } else {
        read_jsonl(path)
    }
}

pub fn read_jsonl(path: &Path) -> Result<Vec<RawRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut records = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let origin = format!("{}:{}", name, n + 1);
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("{}: invalid JSON", origin))?;
        let Value::Object(mut obj) = value else {
            bail!("{}: expected a JSON object", origin);
        };
        let id = match obj.remove("id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        records.push(RawRecord {
            origin,
            id,
            content: obj.remove("content").unwrap_or(Value::Null),
            metadata: obj.remove("metadata"),
        });
    }
    Ok(records)
}

/// Walk `root` and turn every matching file into a record with
/// file-derived legacy metadata. Files that are not UTF-8 become records
/// with null content so they are reported as `not_text`.
pub fn scan_directory(config: &Config, root: &Path) -> Result<Vec<RawRecord>> {
    let include_set = build_globset(&config.ingest.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.ingest.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut records = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.ingest.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel_str = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        records.push(file_record(path, &rel_str)?);
    }

    records.sort_by(|a, b| a.origin.cmp(&b.origin));
    Ok(records)
}

fn file_record(path: &Path, relative_path: &str) -> Result<RawRecord> {
    let bytes = std::fs::read(path)?;
    let modified_secs = std::fs::metadata(path)?
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let metadata = json!({
        "file_path": relative_path,
        "file_name": file_name,
        "type": extension,
        "created_at": modified_secs,
        "file_hash": ContentHash::of_bytes(&bytes).as_str(),
    });
    let content = match String::from_utf8(bytes) {
        Ok(text) => Value::String(text),
        Err(_) => Value::Null,
    };

    Ok(RawRecord {
        origin: relative_path.to_string(),
        id: None,
        content,
        metadata: Some(metadata),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// CPU-side stages shared by every record.
struct Preparer {
    chunker: Chunker,
    validator: ChunkValidator,
    normalizer: SchemaNormalizer,
    now: DateTime<Utc>,
}

impl Preparer {
    fn prepare(&self, record: &RawRecord) -> Prepared {
        let mut out = Prepared::default();
        let label = record.id.clone().unwrap_or_else(|| record.origin.clone());

        let text = match self.validator.text_content(&record.content) {
            Ok(text) => text,
            Err(reason) => {
                out.excluded.record(reason, label);
                return out;
            }
        };
        let raw = match self.validator.flat_metadata(record.metadata.as_ref()) {
            Ok(raw) => raw,
            Err(reason) => {
                out.excluded.record(reason, label);
                return out;
            }
        };

        let id = record
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let normalized = match self.normalizer.normalize_checked(&raw, &text, &id, self.now) {
            Ok(n) => n,
            Err(violation) => {
                tracing::debug!(origin = %record.origin, reason = %violation.reason, "schema violation");
                out.excluded.record(ExclusionReason::SchemaViolation, label);
                return out;
            }
        };

        if !self.chunker.needs_split(&text) {
            out.documents.push(Document::new(id, text, normalized.metadata));
            return out;
        }

        let chunks = self.chunker.split(&id, &text, &normalized.metadata);
        let chunks = self.validator.screen(chunks, &mut out.excluded);
        out.chunks = chunks.len();
        for chunk in chunks {
            let doc = chunk.into_document();
            // Content fields describe the chunk, not the parent.
            let metadata = self
                .normalizer
                .normalize_at(&doc.metadata, &doc.content, &doc.id, self.now)
                .metadata;
            out.documents.push(Document::new(doc.id, doc.content, metadata));
        }
        out
    }
}

/// Ingest `records` into `collection`.
///
/// Per-document write failures are recorded in the report. A timeout or
/// an unreachable store is returned as an error.
pub async fn ingest_records(
    client: &StoreClient,
    config: &Config,
    collection: &str,
    records: Vec<RawRecord>,
    dry_run: bool,
) -> Result<IngestReport> {
    let preparer = Preparer {
        chunker: config.chunker()?,
        validator: ChunkValidator::new(config.chunking.max_length, config.reserved_keys()),
        normalizer: config.normalizer(),
        now: Utc::now(),
    };

    let mut report = IngestReport {
        dry_run,
        records_read: records.len(),
        ..IngestReport::default()
    };

    let prepared: Vec<Prepared> = records.par_iter().map(|r| preparer.prepare(r)).collect();

    let existing = match client.get_all(collection).await {
        Ok(docs) => docs,
        Err(PipelineError::Store(StoreError::CollectionNotFound(_))) => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    let detector = DuplicateDetector::default();
    let mut seen = SeenHashes::with_existing(existing.iter().map(|d| detector.hash(&d.content)));

    let mut to_add = Vec::new();
    for p in prepared {
        report.chunks_created += p.chunks;
        report.excluded.merge(p.excluded);
        for doc in p.documents {
            let reason = match seen.admit(&detector.hash(&doc.content)) {
                Admission::New => {
                    to_add.push(doc);
                    continue;
                }
                Admission::DuplicateInBatch => ExclusionReason::DuplicateInBatch,
                Admission::DuplicateInCollection => ExclusionReason::DuplicateInCollection,
            };
            report.duplicates_skipped += 1;
            report.excluded.record(reason, doc.id);
        }
    }

    tracing::info!(
        collection,
        records = report.records_read,
        documents = to_add.len(),
        duplicates = report.duplicates_skipped,
        excluded = report.excluded.total(),
        dry_run,
        "ingest prepared"
    );

    if dry_run {
        report.documents_added = to_add.len();
        report.success = true;
        return Ok(report);
    }

    client.ensure_collection(collection).await?;
    let batch_size = config.chunking.batch_size.max(1);
    for batch in to_add.chunks(batch_size) {
        match client.add(collection, batch).await {
            Ok(()) => report.documents_added += batch.len(),
            Err(err) if err.is_timeout() => return Err(err.into()),
            Err(err) => {
                tracing::warn!(collection, size = batch.len(), error = %err, "batch add failed, retrying per document");
                for doc in batch {
                    match client.add(collection, std::slice::from_ref(doc)).await {
                        Ok(()) => report.documents_added += 1,
                        Err(err) if err.is_timeout() => return Err(err.into()),
                        Err(err) => report.failures.push(format!("{}: {}", doc.id, err)),
                    }
                }
            }
        }
    }

    report.success = report.failures.is_empty();
    Ok(report)
}

/// Read `path` and ingest everything in it.
pub async fn run_ingest(
    client: &StoreClient,
    config: &Config,
    collection: &str,
    path: &Path,
    dry_run: bool,
) -> Result<IngestReport> {
    let records = read_records(config, path)?;
    ingest_records(client, config, collection, records, dry_run).await
}

pub fn print_report(collection: &str, report: &IngestReport) {
    if report.dry_run {
        println!("ingest {} (dry-run)", collection);
    } else {
        println!("ingest {}", collection);
    }
    println!("  records read: {}", report.records_read);
    if report.dry_run {
        println!("  documents to add: {}", report.documents_added);
    } else {
        println!("  documents added: {}", report.documents_added);
    }
    println!("  chunks created: {}", report.chunks_created);
    println!("  duplicates skipped: {}", report.duplicates_skipped);
    println!("  excluded: {}", report.excluded.total());
    for (reason, count) in &report.excluded.counts {
        println!("    {}: {}", reason.as_str(), count);
    }
    for failure in &report.failures {
        println!("  failed: {}", failure);
    }
    println!("{}", if report.success { "ok" } else { "completed with failures" });
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpus_keeper_core::store::memory::InMemoryStore;
    use corpus_keeper_core::MetadataValue;
    use std::sync::Arc;

    use crate::client::CallPolicy;

    fn setup() -> (Config, StoreClient) {
        let mut config = Config::with_store_path("unused.sqlite");
        config.chunking.max_length = 100;
        config.chunking.overlap = 20;
        config.chunking.min_length = 10;
        let client = StoreClient::new(Arc::new(InMemoryStore::new()), CallPolicy::default());
        (config, client)
    }

    fn record(id: &str, content: Value, metadata: Value) -> RawRecord {
        RawRecord {
            origin: id.to_string(),
            id: Some(id.to_string()),
            content,
            metadata: Some(metadata),
        }
    }

    #[tokio::test]
    async fn test_ingest_normalizes_and_dedups() {
        let (config, client) = setup();
        let records = vec![
            record("a", json!("alpha text"), json!({"type": "md", "project_name": "p"})),
            record("b", json!("alpha text"), json!({})),
            record("c", json!("beta text"), json!({"_sys_secret": 1})),
        ];
        let report = ingest_records(&client, &config, "docs", records, false)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.documents_added, 2);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(report.excluded.count(ExclusionReason::DuplicateInBatch), 1);

        let docs = client.get_all("docs").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "a");
        assert_eq!(docs[0].metadata.get("project"), Some(&MetadataValue::from("p")));
        assert_eq!(docs[0].metadata.get("content_type"), Some(&MetadataValue::from("md")));
        assert!(docs[1].metadata.keys().all(|k| !k.starts_with("_sys")));
    }

    #[tokio::test]
    async fn test_reingest_skips_collection_duplicates() {
        let (config, client) = setup();
        let first = vec![record("a", json!("same"), json!({}))];
        ingest_records(&client, &config, "docs", first, false).await.unwrap();

        let again = vec![record("z", json!("same"), json!({}))];
        let report = ingest_records(&client, &config, "docs", again, false)
            .await
            .unwrap();
        assert_eq!(report.documents_added, 0);
        assert_eq!(report.excluded.count(ExclusionReason::DuplicateInCollection), 1);
        assert_eq!(client.count("docs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_non_text_and_non_object_metadata() {
        let (config, client) = setup();
        let records = vec![
            record("n", json!(42), json!({})),
            record("m", json!("fine"), json!(["not", "a", "map"])),
            record("e", json!("   "), json!({})),
        ];
        let report = ingest_records(&client, &config, "docs", records, false)
            .await
            .unwrap();
        assert_eq!(report.documents_added, 0);
        assert_eq!(report.excluded.count(ExclusionReason::NotText), 1);
        assert_eq!(report.excluded.count(ExclusionReason::NestedMetadata), 1);
        assert_eq!(report.excluded.count(ExclusionReason::Empty), 1);
    }

    #[tokio::test]
    async fn test_nested_metadata_values_are_stringified() {
        let (config, client) = setup();
        let records = vec![record(
            "m",
            json!("fine"),
            json!({"author": {"name": "ada"}, "tags": ["x", 1]}),
        )];
        let report = ingest_records(&client, &config, "docs", records, false)
            .await
            .unwrap();
        assert_eq!(report.documents_added, 1);
        assert!(report.excluded.is_empty());
        let docs = client.get_all("docs").await.unwrap();
        assert_eq!(docs[0].metadata["author"], MetadataValue::Str(r#"{"name":"ada"}"#.into()));
        assert_eq!(docs[0].metadata["tags"], MetadataValue::Str(r#"["x",1]"#.into()));
    }

    #[tokio::test]
    async fn test_long_content_is_chunked_with_lineage() {
        let (config, client) = setup();
        let long: String = (0..60).map(|i| format!("w{:02} ", i)).collect();
        let records = vec![record("long", json!(long), json!({}))];
        let report = ingest_records(&client, &config, "docs", records, false)
            .await
            .unwrap();
        assert!(report.chunks_created > 1);
        assert_eq!(report.documents_added, report.chunks_created);

        let docs = client.get_all("docs").await.unwrap();
        assert_eq!(docs[0].id, "long_chunk_0");
        assert_eq!(docs[0].metadata.get("parent_id"), Some(&MetadataValue::from("long")));
        assert_eq!(
            docs[0].metadata.get("document_id"),
            Some(&MetadataValue::from("long_chunk_0"))
        );
        assert!(docs.iter().all(|d| d.content.chars().count() <= 100));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (config, client) = setup();
        let records = vec![record("a", json!("alpha"), json!({}))];
        let report = ingest_records(&client, &config, "docs", records, true)
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.documents_added, 1);
        assert!(client.list_collections().await.unwrap().is_empty());
    }

    #[test]
    fn test_read_jsonl_parses_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(
            &path,
            "{\"id\": \"a\", \"content\": \"x\", \"metadata\": {\"k\": 1}}\n\n{\"content\": \"y\"}\n",
        )
        .unwrap();
        let records = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_deref(), Some("a"));
        assert_eq!(records[1].id, None);
        assert_eq!(records[1].origin, "in.jsonl:3");
    }

    #[test]
    fn test_scan_directory_applies_globs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("docs/guide.md"), "# Guide").unwrap();
        std::fs::write(dir.path().join("docs/skip.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("node_modules/x.md"), "dep").unwrap();

        let config = Config::with_store_path("unused.sqlite");
        let records = scan_directory(&config, dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        let meta = records[0].metadata.as_ref().unwrap();
        assert_eq!(meta["file_name"], "guide.md");
        assert_eq!(meta["type"], "md");
        assert!(meta["file_hash"].as_str().unwrap().len() == 64);
    }
}
