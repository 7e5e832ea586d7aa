//! Safe-mutation runs against an instrumented in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use corpus_keeper::client::{CallPolicy, StoreClient};
use corpus_keeper::config::Config;
use corpus_keeper::error::PipelineError;
use corpus_keeper::mutation::{CollectionLock, MutationState, SafeMutationCoordinator};
use corpus_keeper_core::models::{Document, Metadata, MetadataValue};
use corpus_keeper_core::plan::MutationKind;
use corpus_keeper_core::store::memory::InMemoryStore;
use corpus_keeper_core::store::{DocumentStore, GetQuery};
use corpus_keeper_core::StoreError;

/// Wraps [`InMemoryStore`], counts writes and injects failures.
#[derive(Default)]
struct Instrumented {
    inner: InMemoryStore,
    gets: AtomicUsize,
    writes: AtomicUsize,
    /// `get` fails permanently once this many calls have succeeded.
    fail_get_after: Option<usize>,
    /// `delete` fails for any call that includes one of these ids.
    poison_ids: Vec<String>,
    delete_delay: Option<Duration>,
}

#[async_trait]
impl DocumentStore for Instrumented {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_collections().await
    }
    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        self.inner.create_collection(name).await
    }
    async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete_collection(name).await
    }
    async fn get(&self, c: &str, q: &GetQuery) -> Result<Vec<Document>, StoreError> {
        let n = self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get_after.is_some_and(|limit| n >= limit) {
            return Err(StoreError::Backend("read refused".into()));
        }
        self.inner.get(c, q).await
    }
    async fn add(&self, c: &str, d: &[Document]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.add(c, d).await
    }
    async fn update(&self, c: &str, i: &[String], m: &[Metadata]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(c, i, m).await
    }
    async fn delete(&self, c: &str, i: &[String]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delete_delay {
            tokio::time::sleep(delay).await;
        }
        if i.iter().any(|id| self.poison_ids.contains(id)) {
            return Err(StoreError::Backend("delete rejected".into()));
        }
        self.inner.delete(c, i).await
    }
    async fn count(&self, c: &str) -> Result<usize, StoreError> {
        self.inner.count(c).await
    }
}

fn meta(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), MetadataValue::from(*v)))
        .collect()
}

/// Three documents, two of which repeat the first one's content.
fn duplicated() -> Vec<Document> {
    vec![
        Document::new("a", "shared content", meta(&[("type", "md")])),
        Document::new("b", "shared content", meta(&[("type", "txt")])),
        Document::new("c", "shared content", Metadata::new()),
        Document::new("d", "unique content", meta(&[("project_name", "p")])),
    ]
}

fn policy() -> CallPolicy {
    CallPolicy {
        timeout: Duration::from_secs(5),
        max_retries: 0,
        backoff: Duration::from_millis(1),
    }
}

struct Fixture {
    tmp: TempDir,
    config: Config,
    store: Arc<Instrumented>,
    client: StoreClient,
}

async fn fixture(store: Instrumented, docs: Vec<Document>) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_store_path(tmp.path().join("unused.sqlite"));
    config.backup.dir = tmp.path().join("backups");
    config.mutation.batch_size = 10;

    store.inner.create_collection("docs").await.unwrap();
    store.inner.add("docs", &docs).await.unwrap();
    let store = Arc::new(store);
    let client = StoreClient::new(store.clone(), policy());
    Fixture {
        tmp,
        config,
        store,
        client,
    }
}

async fn ids(store: &Instrumented, collection: &str) -> Vec<String> {
    store
        .inner
        .get(collection, &GetQuery::all())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect()
}

#[tokio::test]
async fn test_confirmed_dedup_keeps_first_seen() {
    let fx = fixture(Instrumented::default(), duplicated()).await;
    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.state(), MutationState::Validated);
    assert_eq!(ids(&fx.store, "docs").await, vec!["a", "d"]);

    let commit = report.commit().unwrap();
    assert_eq!(commit.attempted, 2);
    assert_eq!(commit.succeeded, 2);
    assert!(commit.failures.is_empty());

    let after = report.after_validation.as_ref().unwrap();
    assert_eq!(after.remaining_duplicate_groups, 0);
    assert_eq!(report.before_analysis.duplicates.documents_to_remove, 2);

    let backup = report.report_info.backup_path.as_ref().unwrap();
    assert!(backup.exists());
    let artifact = report.report_path.as_ref().unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(artifact).unwrap()).unwrap();
    assert_eq!(written["report_info"]["state"], "VALIDATED");
    assert_eq!(written["mutation_result"]["planned"]["removals"], 2);
}

#[tokio::test]
async fn test_unconfirmed_run_writes_nothing() {
    let fx = fixture(Instrumented::default(), duplicated()).await;
    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::Deduplicate, false)
        .await
        .unwrap();

    assert!(report.report_info.dry_run);
    assert_eq!(report.state(), MutationState::Planned);
    assert_eq!(report.mutation_result.planned.removals, 2);
    assert!(report.commit().is_none());
    assert_eq!(fx.store.writes.load(Ordering::SeqCst), 0);
    assert_eq!(ids(&fx.store, "docs").await.len(), 4);
    assert!(!fx.config.backup.reports_dir().exists());
}

#[tokio::test]
async fn test_backup_failure_aborts_before_any_write() {
    // The plan's read succeeds; the snapshot's read is refused.
    let store = Instrumented {
        fail_get_after: Some(1),
        ..Instrumented::default()
    };
    let fx = fixture(store, duplicated()).await;
    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap();

    assert!(!report.success());
    assert_eq!(report.state(), MutationState::Aborted);
    assert!(report.report_info.error.as_deref().unwrap().contains("backup failed"));
    assert!(report.report_info.backup_path.is_none());
    assert_eq!(fx.store.writes.load(Ordering::SeqCst), 0);
    assert_eq!(ids(&fx.store, "docs").await, vec!["a", "b", "c", "d"]);
    assert!(report.report_path.as_ref().unwrap().exists());
}

#[tokio::test]
async fn test_failed_batch_falls_back_per_document() {
    let store = Instrumented {
        poison_ids: vec!["c".to_string()],
        ..Instrumented::default()
    };
    let fx = fixture(store, duplicated()).await;
    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.state(), MutationState::Validated);
    let commit = report.commit().unwrap();
    assert_eq!(commit.attempted, 2);
    assert_eq!(commit.succeeded, 1);
    assert_eq!(commit.failures.len(), 1);
    assert_eq!(commit.failures[0].id, "c");
    assert_eq!(report.report_info.cleanup_successful, Some(false));
    assert_eq!(ids(&fx.store, "docs").await, vec!["a", "c", "d"]);
}

#[tokio::test]
async fn test_commit_timeout_aborts_with_backup_hint() {
    let store = Instrumented {
        delete_delay: Some(Duration::from_millis(500)),
        ..Instrumented::default()
    };
    let mut fx = fixture(store, duplicated()).await;
    fx.client = StoreClient::new(
        fx.store.clone(),
        CallPolicy {
            timeout: Duration::from_millis(50),
            ..policy()
        },
    );
    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap();

    assert!(!report.success());
    assert_eq!(report.state(), MutationState::Aborted);
    let backup = report.report_info.backup_path.as_ref().unwrap();
    let error = report.report_info.error.as_deref().unwrap();
    assert!(error.contains("timed out"));
    assert!(error.contains(&backup.display().to_string()));
}

#[tokio::test]
async fn test_normalize_rewrites_to_canonical_schema() {
    let fx = fixture(Instrumented::default(), duplicated()).await;
    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::NormalizeMetadata, true)
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.mutation_result.planned.rewrites, 4);
    assert_eq!(report.report_info.cleanup_successful, Some(true));

    let docs = fx.store.inner.get("docs", &GetQuery::all()).await.unwrap();
    assert_eq!(
        docs[3].metadata.get("project"),
        Some(&MetadataValue::from("p"))
    );
    assert!(docs.iter().all(|d| d.metadata.contains_key("updated_timestamp")));

    // A second pass finds nothing to change.
    let again = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .plan("docs", &MutationKind::NormalizeMetadata)
        .await
        .unwrap();
    assert!(again.plan.is_empty());
}

#[tokio::test]
async fn test_merge_inserts_only_new_content() {
    let fx = fixture(Instrumented::default(), duplicated()).await;
    fx.store.inner.create_collection("incoming").await.unwrap();
    fx.store
        .inner
        .add(
            "incoming",
            &[
                Document::new("a", "fresh content", Metadata::new()),
                Document::new("x", "shared content", Metadata::new()),
                Document::new("y", "fresh content", Metadata::new()),
            ],
        )
        .await
        .unwrap();

    let kind = MutationKind::Merge {
        source: "incoming".into(),
    };
    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", kind, true)
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.mutation_result.planned.inserts, 1);
    assert_eq!(
        ids(&fx.store, "docs").await,
        vec!["a", "b", "c", "d", "incoming__a"]
    );
    assert_eq!(ids(&fx.store, "incoming").await.len(), 3);
}

#[tokio::test]
async fn test_held_lock_is_reported() {
    let fx = fixture(Instrumented::default(), duplicated()).await;
    let _held = CollectionLock::acquire(&fx.config.backup.locks_dir(), "docs").unwrap();

    let err = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Locked { .. }));
    assert_eq!(fx.store.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_lock_is_released_after_run() {
    let fx = fixture(Instrumented::default(), duplicated()).await;
    let coordinator = SafeMutationCoordinator::new(&fx.client, &fx.config);
    coordinator
        .run("docs", MutationKind::Deduplicate, false)
        .await
        .unwrap();
    coordinator
        .run("docs", MutationKind::Deduplicate, false)
        .await
        .unwrap();
    assert!(!fx.tmp.path().join("backups/.locks/docs.lock").exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_lock_of_dead_process_is_reclaimed() {
    let fx = fixture(Instrumented::default(), duplicated()).await;
    let locks = fx.config.backup.locks_dir();
    std::fs::create_dir_all(&locks).unwrap();
    // Far above any kernel's pid_max.
    std::fs::write(locks.join("docs.lock"), format!("pid={} acquired=then\n", u32::MAX)).unwrap();

    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap();
    assert!(report.success());
    assert!(!locks.join("docs.lock").exists());
}

#[tokio::test]
async fn test_unreadable_lock_is_not_reclaimed_but_can_be_released() {
    let fx = fixture(Instrumented::default(), duplicated()).await;
    let locks = fx.config.backup.locks_dir();
    std::fs::create_dir_all(&locks).unwrap();
    std::fs::write(locks.join("docs.lock"), "garbage").unwrap();

    let coordinator = SafeMutationCoordinator::new(&fx.client, &fx.config);
    let err = coordinator
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Locked { .. }));
    assert!(err.to_string().contains("ck unlock docs"));

    assert!(CollectionLock::force_release(&locks, "docs").unwrap());
    assert!(!CollectionLock::force_release(&locks, "docs").unwrap());
    let report = coordinator
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap();
    assert!(report.success());
}

#[tokio::test]
async fn test_lock_directory_failure_aborts_with_report() {
    let mut fx = fixture(Instrumented::default(), duplicated()).await;
    let blocker = fx.tmp.path().join("not_a_dir");
    std::fs::write(&blocker, "").unwrap();
    fx.config.backup.dir = blocker;

    let report = SafeMutationCoordinator::new(&fx.client, &fx.config)
        .run("docs", MutationKind::Deduplicate, true)
        .await
        .unwrap();
    assert!(!report.success());
    assert_eq!(report.state(), MutationState::Aborted);
    assert!(report.report_info.error.is_some());
    assert!(report.commit().is_none());
    assert_eq!(fx.store.writes.load(Ordering::SeqCst), 0);
    assert_eq!(ids(&fx.store, "docs").await.len(), 4);
}
