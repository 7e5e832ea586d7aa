//! Safe corpus-wide mutations.
//!
//! Every dedup, metadata rewrite, or merge goes through one state machine:
//!
//! ```text
//! PLANNED ──▶ BACKED_UP ──▶ COMMITTED ──▶ VALIDATED
//!    │            │             │
//!    └────────────┴─────────────┴──▶ ABORTED
//! ```
//!
//! - **PLANNED**: the plan is computed read-only. Without confirmation the
//!   run stops here and nothing is written.
//! - **BACKED_UP**: a verified snapshot taken after the plan exists. A
//!   backup failure aborts before any write.
//! - **COMMITTED**: changes are applied in bounded batches. A failed batch
//!   is retried one document at a time; per-document failures are recorded
//!   and skipped. A timeout aborts the run.
//! - **VALIDATED**: the collection is re-scanned. Residual problems are
//!   reported via `cleanup_successful`, never rolled back automatically.
//!
//! Runs on one collection are serialized by a lock file held from
//! planning to the end of validation. A lock whose recorded pid no longer
//! names a live process is reclaimed; anything else is removed only by
//! `ck unlock`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use corpus_keeper_core::chunk::ExclusionReport;
use corpus_keeper_core::dedup::{DuplicateAnalysis, DuplicateDetector};
use corpus_keeper_core::models::{Document, Metadata};
use corpus_keeper_core::plan::{
    plan_deduplicate, plan_merge, plan_normalize, Change, MutationKind, MutationPlan,
};
use corpus_keeper_core::schema::SchemaDefinition;
use corpus_keeper_core::validate::{ValidationReport, ValidationReporter};

use crate::backup::{file_safe, Backup, BackupCoordinator};
use crate::client::StoreClient;
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationState {
    Planned,
    BackedUp,
    Committed,
    Validated,
    Aborted,
}

/// Exclusive per-collection lock, released on drop.
#[derive(Debug)]
pub struct CollectionLock {
    path: PathBuf,
}

impl CollectionLock {
    pub fn acquire(dir: &Path, collection: &str) -> PipelineResult<Self> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, collection);
        match Self::create(&path) {
            Err(PipelineError::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if !holder_is_gone(&path) {
                    return Err(PipelineError::Locked {
                        collection: collection.to_string(),
                        path,
                    });
                }
                tracing::warn!(collection, path = %path.display(), "reclaiming stale lock");
                fs::remove_file(&path)?;
                Self::create(&path).map_err(|err| match err {
                    PipelineError::Io(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
                        PipelineError::Locked {
                            collection: collection.to_string(),
                            path: path.clone(),
                        }
                    }
                    other => other,
                })
            }
            other => other,
        }
    }

    /// Remove a collection's lock file regardless of who holds it.
    /// Returns whether there was one.
    pub fn force_release(dir: &Path, collection: &str) -> PipelineResult<bool> {
        let path = Self::path_for(dir, collection);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::warn!(collection, path = %path.display(), "lock removed by hand");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn path_for(dir: &Path, collection: &str) -> PathBuf {
        dir.join(format!("{}.lock", file_safe(collection)))
    }

    fn create(path: &Path) -> PipelineResult<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "pid={} acquired={}", std::process::id(), Utc::now().to_rfc3339())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// True only when the lock names a pid other than ours and the process
/// table says that pid is not running. Unreadable locks and systems
/// without `/proc` count as held.
fn holder_is_gone(path: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(path) else {
        return false;
    };
    let pid = raw
        .split_whitespace()
        .find_map(|field| field.strip_prefix("pid="))
        .and_then(|pid| pid.parse::<u32>().ok());
    let proc_root = Path::new("/proc");
    match pid {
        Some(pid) if pid != std::process::id() && proc_root.is_dir() => {
            !proc_root.join(pid.to_string()).exists()
        }
        _ => false,
    }
}

impl Drop for CollectionLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<CommitFailure>,
}

/// Counts from the plan, kept in the report next to what actually
/// happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub removals: usize,
    pub rewrites: usize,
    pub inserts: usize,
    pub estimated_removed: usize,
    pub estimated_kept: usize,
    pub excluded: ExclusionReport,
}

impl PlanSummary {
    fn of(plan: &MutationPlan) -> Self {
        Self {
            removals: plan.removals(),
            rewrites: plan.rewrites(),
            inserts: plan.inserts(),
            estimated_removed: plan.estimated_removed,
            estimated_kept: plan.estimated_kept,
            excluded: plan.excluded.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportInfo {
    pub collection: String,
    pub kind: MutationKind,
    pub state: MutationState,
    pub success: bool,
    pub dry_run: bool,
    pub plan_created_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub backup_path: Option<PathBuf>,
    pub cleanup_successful: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BeforeAnalysis {
    pub duplicates: DuplicateAnalysis,
    pub validation: ValidationReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationResult {
    pub planned: PlanSummary,
    pub commit: Option<CommitResult>,
}

/// Outcome of one run. Serialized as the audit report artifact.
#[derive(Debug, Clone, Serialize)]
pub struct MutationReport {
    pub report_info: ReportInfo,
    pub before_analysis: BeforeAnalysis,
    pub mutation_result: MutationResult,
    pub after_validation: Option<ValidationReport>,
    pub schema_definition: SchemaDefinition,
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
    #[serde(skip)]
    pub plan: MutationPlan,
}

impl MutationReport {
    pub fn success(&self) -> bool {
        self.report_info.success
    }

    pub fn state(&self) -> MutationState {
        self.report_info.state
    }

    pub fn commit(&self) -> Option<&CommitResult> {
        self.mutation_result.commit.as_ref()
    }
}

/// A computed plan plus the collection analysis it was built from.
#[derive(Debug, Clone)]
pub struct Planned {
    pub plan: MutationPlan,
    pub before: BeforeAnalysis,
}

pub struct SafeMutationCoordinator<'a> {
    client: &'a StoreClient,
    config: &'a Config,
    detector: DuplicateDetector,
    reporter: ValidationReporter,
}

impl<'a> SafeMutationCoordinator<'a> {
    pub fn new(client: &'a StoreClient, config: &'a Config) -> Self {
        let detector = DuplicateDetector::default();
        Self {
            client,
            config,
            detector,
            reporter: ValidationReporter::new(detector, config.reserved_keys()),
        }
    }

    /// Compute the plan read-only. Safe to call at any time.
    pub async fn plan(&self, collection: &str, kind: &MutationKind) -> PipelineResult<Planned> {
        let docs = self.client.get_all(collection).await?;
        let now = Utc::now();
        let plan = match kind {
            MutationKind::Deduplicate => plan_deduplicate(collection, &docs, &self.detector, now),
            MutationKind::NormalizeMetadata => {
                plan_normalize(collection, &docs, &self.config.normalizer(), now)
            }
            MutationKind::Merge { source } => {
                let source_docs = self.client.get_all(source).await?;
                plan_merge(
                    collection,
                    source,
                    &source_docs,
                    &docs,
                    &self.config.normalizer(),
                    &self.detector,
                    now,
                )
            }
        };
        let before = BeforeAnalysis {
            duplicates: self.detector.analyze(&docs),
            validation: self.reporter.report(collection, &docs),
        };
        tracing::info!(
            collection,
            kind = %kind,
            changes = plan.candidate_changes.len(),
            "mutation planned"
        );
        Ok(Planned { plan, before })
    }

    /// Run a mutation. Without `confirm` this is a dry run that stops at
    /// PLANNED. A lock held by another run and a store that is unreachable
    /// while planning are returned as `Err`. Everything else, including a
    /// lock directory that cannot be created, is an `Ok` report with
    /// `success == false` in state ABORTED.
    pub async fn run(
        &self,
        collection: &str,
        kind: MutationKind,
        confirm: bool,
    ) -> PipelineResult<MutationReport> {
        let lock = match CollectionLock::acquire(&self.config.backup.locks_dir(), collection) {
            Ok(lock) => Ok(lock),
            Err(err @ PipelineError::Locked { .. }) => return Err(err),
            Err(err) => Err(err),
        };

        let Planned { plan, before } = self.plan(collection, &kind).await?;
        let plan = if confirm { plan.confirm() } else { plan };
        let schema = SchemaDefinition::new(&self.config.reserved_keys());
        let mut run = Run::new(collection, kind, plan, before, schema);

        let _lock = match lock {
            Ok(lock) => lock,
            Err(err) => {
                run.abort(&err);
                return Ok(if run.plan.dry_run {
                    run.finish(None)
                } else {
                    self.finish_confirmed(run)
                });
            }
        };

        if run.plan.dry_run {
            run.report_info.success = true;
            return Ok(run.finish(None));
        }

        // BACKED_UP
        let backup = match self.backup(&run.plan).await {
            Ok(backup) => backup,
            Err(err) => {
                run.abort(&err);
                return Ok(self.finish_confirmed(run));
            }
        };
        run.report_info.backup_path = Some(backup.path.clone());
        run.transition(MutationState::BackedUp);

        // COMMITTED
        let (commit, aborted) = self.commit(&run.plan, &backup.path).await;
        run.mutation_result.commit = Some(commit);
        if let Some(err) = aborted {
            run.abort(&err);
            return Ok(self.finish_confirmed(run));
        }
        run.transition(MutationState::Committed);

        // VALIDATED
        match self.client.get_all(collection).await {
            Ok(docs) => {
                let report = self.reporter.report(collection, &docs);
                let cleanup = match run.report_info.kind {
                    MutationKind::Deduplicate => {
                        report.remaining_duplicate_groups == 0 && report.schema_compliant
                    }
                    _ => report.schema_compliant,
                };
                run.report_info.cleanup_successful = Some(cleanup);
                run.after_validation = Some(report);
                run.report_info.success = true;
                run.transition(MutationState::Validated);
            }
            Err(err) => {
                tracing::warn!(collection, error = %err, "post-mutation validation failed");
                run.report_info.error = Some(format!("validation read failed: {}", err));
            }
        }
        Ok(self.finish_confirmed(run))
    }

    async fn backup(&self, plan: &MutationPlan) -> PipelineResult<Backup> {
        let coordinator = BackupCoordinator::new(self.client, self.config.backup.dir.clone())
            .with_batch_size(self.config.mutation.batch_size);
        let backup = coordinator.snapshot(&plan.collection).await?;
        if backup.info.timestamp < plan.created_at {
            return Err(PipelineError::backup(
                &plan.collection,
                "snapshot predates the plan",
            ));
        }
        Ok(backup)
    }

    /// Apply the plan. Returns the tally and, when the run must abort,
    /// the error that caused it.
    async fn commit(
        &self,
        plan: &MutationPlan,
        backup: &Path,
    ) -> (CommitResult, Option<PipelineError>) {
        let batch_size = self.config.mutation.batch_size.max(1);
        let mut result = CommitResult::default();

        let mut removals = Vec::new();
        let mut rewrites = Vec::new();
        let mut inserts = Vec::new();
        for change in &plan.candidate_changes {
            match change {
                Change::Remove { id, .. } => removals.push(id.clone()),
                Change::Rewrite { id, metadata } => rewrites.push((id.clone(), metadata.clone())),
                Change::Insert { document } => inserts.push(document.clone()),
            }
        }

        for batch in removals.chunks(batch_size) {
            if let Err(err) = self.apply(&plan.collection, Op::Delete(batch), &mut result).await {
                return (result, Some(err.with_backup(backup)));
            }
        }
        for batch in rewrites.chunks(batch_size) {
            if let Err(err) = self.apply(&plan.collection, Op::Update(batch), &mut result).await {
                return (result, Some(err.with_backup(backup)));
            }
        }
        for batch in inserts.chunks(batch_size) {
            if let Err(err) = self.apply(&plan.collection, Op::Add(batch), &mut result).await {
                return (result, Some(err.with_backup(backup)));
            }
        }

        tracing::info!(
            collection = %plan.collection,
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failures.len(),
            "commit finished"
        );
        (result, None)
    }

    /// One batch, falling back to per-document calls when the batch call
    /// fails. Only a timeout is returned as an error.
    async fn apply(
        &self,
        collection: &str,
        op: Op<'_>,
        result: &mut CommitResult,
    ) -> PipelineResult<()> {
        let n = op.len();
        result.attempted += n;
        match self.send(collection, &op).await {
            Ok(()) => {
                result.succeeded += n;
                return Ok(());
            }
            Err(err) if err.is_timeout() => return Err(err),
            Err(err) => {
                tracing::warn!(collection, size = n, error = %err, "batch failed, retrying per document");
            }
        }

        for single in op.singles() {
            match self.send(collection, &single).await {
                Ok(()) => result.succeeded += 1,
                Err(err) if err.is_timeout() => return Err(err),
                Err(err) => {
                    let id = single.first_id().to_string();
                    tracing::warn!(collection, id = %id, error = %err, "document commit failed");
                    result.failures.push(CommitFailure {
                        id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn send(&self, collection: &str, op: &Op<'_>) -> PipelineResult<()> {
        match op {
            Op::Delete(ids) => self.client.delete(collection, ids).await,
            Op::Update(pairs) => {
                let (ids, metadatas): (Vec<String>, Vec<Metadata>) = pairs.iter().cloned().unzip();
                self.client.update(collection, &ids, &metadatas).await
            }
            Op::Add(docs) => self.client.add(collection, docs).await,
        }
    }

    fn finish_confirmed(&self, run: Run) -> MutationReport {
        let dir = self.config.backup.reports_dir();
        let path = dir.join(format!(
            "{}_{}_{}.json",
            file_safe(&run.report_info.collection),
            run.report_info.kind.label(),
            Utc::now().format("%Y%m%dT%H%M%S%6fZ")
        ));
        let mut report = run.finish(Some(path.clone()));
        let written = fs::create_dir_all(&dir)
            .map_err(PipelineError::from)
            .and_then(|()| Ok(serde_json::to_vec_pretty(&report)?))
            .and_then(|bytes| Ok(fs::write(&path, bytes)?));
        match written {
            Ok(()) => tracing::info!(path = %path.display(), "mutation report written"),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to write mutation report");
                report.report_path = None;
            }
        }
        report
    }
}

/// Human-readable run summary for the CLI.
pub fn print_report(report: &MutationReport) {
    let info = &report.report_info;
    let planned = &report.mutation_result.planned;
    if info.dry_run {
        println!("{} {} (dry-run)", info.kind.label(), info.collection);
    } else {
        println!("{} {}", info.kind.label(), info.collection);
    }
    println!("  state: {:?}", info.state);
    println!(
        "  planned: {} removal(s), {} rewrite(s), {} insert(s)",
        planned.removals, planned.rewrites, planned.inserts
    );
    println!(
        "  estimated: {} removed, {} kept",
        planned.estimated_removed, planned.estimated_kept
    );
    if planned.excluded.total() > 0 {
        println!("  excluded: {}", planned.excluded.total());
    }
    if let Some(path) = &info.backup_path {
        println!("  backup: {}", path.display());
    }
    if let Some(commit) = &report.mutation_result.commit {
        println!(
            "  committed: {} / {} ({} failed)",
            commit.succeeded,
            commit.attempted,
            commit.failures.len()
        );
        for failure in &commit.failures {
            println!("    {}: {}", failure.id, failure.reason);
        }
    }
    if let Some(after) = &report.after_validation {
        println!(
            "  after: {} document(s), {} duplicate group(s), {:.1}% complete",
            after.total_documents,
            after.remaining_duplicate_groups,
            after.average_completeness * 100.0
        );
    }
    if let Some(clean) = info.cleanup_successful {
        println!("  cleanup successful: {}", if clean { "yes" } else { "no" });
    }
    if let Some(path) = &report.report_path {
        println!("  report: {}", path.display());
    }
    if let Some(err) = &info.error {
        println!("  error: {}", err);
    }
    if info.dry_run && !report.plan.is_empty() {
        println!("  re-run with --confirm to apply");
    }
}

/// A single store write, batched or not.
enum Op<'b> {
    Delete(&'b [String]),
    Update(&'b [(String, Metadata)]),
    Add(&'b [Document]),
}

impl<'b> Op<'b> {
    fn len(&self) -> usize {
        match self {
            Op::Delete(ids) => ids.len(),
            Op::Update(pairs) => pairs.len(),
            Op::Add(docs) => docs.len(),
        }
    }

    fn singles(&self) -> Vec<Op<'b>> {
        match *self {
            Op::Delete(ids) => ids.chunks(1).map(Op::Delete).collect(),
            Op::Update(pairs) => pairs.chunks(1).map(Op::Update).collect(),
            Op::Add(docs) => docs.chunks(1).map(Op::Add).collect(),
        }
    }

    fn first_id(&self) -> &str {
        match self {
            Op::Delete(ids) => ids.first().map(String::as_str),
            Op::Update(pairs) => pairs.first().map(|(id, _)| id.as_str()),
            Op::Add(docs) => docs.first().map(|d| d.id.as_str()),
        }
        .unwrap_or("")
    }
}

/// In-flight run state.
struct Run {
    report_info: ReportInfo,
    before: BeforeAnalysis,
    mutation_result: MutationResult,
    after_validation: Option<ValidationReport>,
    plan: MutationPlan,
    schema: SchemaDefinition,
}

impl Run {
    fn new(
        collection: &str,
        kind: MutationKind,
        plan: MutationPlan,
        before: BeforeAnalysis,
        schema: SchemaDefinition,
    ) -> Self {
        Self {
            report_info: ReportInfo {
                collection: collection.to_string(),
                kind,
                state: MutationState::Planned,
                success: false,
                dry_run: plan.dry_run,
                plan_created_at: plan.created_at,
                generated_at: plan.created_at,
                backup_path: None,
                cleanup_successful: None,
                error: None,
            },
            before,
            mutation_result: MutationResult {
                planned: PlanSummary::of(&plan),
                commit: None,
            },
            after_validation: None,
            plan,
            schema,
        }
    }

    fn transition(&mut self, state: MutationState) {
        tracing::info!(
            collection = %self.report_info.collection,
            from = ?self.report_info.state,
            to = ?state,
            "mutation state"
        );
        self.report_info.state = state;
    }

    fn abort(&mut self, err: &PipelineError) {
        tracing::error!(collection = %self.report_info.collection, error = %err, "mutation aborted");
        self.report_info.error = Some(err.to_string());
        self.report_info.success = false;
        self.transition(MutationState::Aborted);
    }

    fn finish(self, report_path: Option<PathBuf>) -> MutationReport {
        let mut report_info = self.report_info;
        report_info.generated_at = Utc::now();
        MutationReport {
            report_info,
            before_analysis: self.before,
            mutation_result: self.mutation_result,
            after_validation: self.after_validation,
            schema_definition: self.schema,
            report_path,
            plan: self.plan,
        }
    }
}
