//! Collection statistics and health overview.
//!
//! Read-only summaries used by `ck collections list`, `ck analyze`,
//! `ck validate` and `ck backups`: document counts, duplicate groups,
//! per-field completeness and schema compliance.

use anyhow::Result;

use corpus_keeper_core::dedup::DuplicateDetector;
use corpus_keeper_core::validate::{ValidationReport, ValidationReporter, COMPLIANCE_THRESHOLD};

use crate::backup::BackupEntry;
use crate::client::StoreClient;
use crate::config::Config;

/// Per-collection document counts, plus the store file size.
pub async fn run_collections(client: &StoreClient, config: &Config) -> Result<()> {
    let names = client.list_collections().await?;
    let db_size = std::fs::metadata(&config.store.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Corpus Keeper — Collections");
    println!("===========================");
    println!();
    println!("  Store:       {}", config.store.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    if names.is_empty() {
        println!("  No collections.");
        println!();
        return Ok(());
    }

    println!("  {:<32} {:>8}", "COLLECTION", "DOCS");
    println!("  {}", "-".repeat(42));
    for name in &names {
        let count = client.count(name).await?;
        println!("  {:<32} {:>8}", name, count);
    }
    println!();
    Ok(())
}

/// Duplicate analysis and field completeness for one collection.
pub async fn run_analyze(client: &StoreClient, config: &Config, collection: &str) -> Result<()> {
    let docs = client.get_all(collection).await?;
    let detector = DuplicateDetector::default();
    let analysis = detector.analyze(&docs);
    let report = ValidationReporter::new(detector, config.reserved_keys()).report(collection, &docs);

    println!("Collection: {}", collection);
    println!();
    println!("  Documents:        {}", analysis.total_documents);
    println!("  Unique content:   {}", analysis.unique_content_count);
    println!("  Duplicate groups: {}", analysis.duplicate_groups);
    println!("  To remove:        {}", analysis.documents_to_remove);

    if !analysis.groups.is_empty() {
        println!();
        println!("  {:<16} {:>6}   {}", "HASH", "COPIES", "KEEP");
        println!("  {}", "-".repeat(60));
        for (hash, group) in &analysis.groups {
            println!(
                "  {:<16} {:>6}   {}",
                hash.short(),
                group.len(),
                group.representative()
            );
        }
    }

    println!();
    print_completeness(&report);
    println!();
    Ok(())
}

/// Print a validation report, or emit it as JSON.
pub async fn run_validate(
    client: &StoreClient,
    config: &Config,
    collection: &str,
    json: bool,
) -> Result<ValidationReport> {
    let docs = client.get_all(collection).await?;
    let report = ValidationReporter::new(DuplicateDetector::default(), config.reserved_keys())
        .report(collection, &docs);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report);
    }

    println!("Validation: {}", collection);
    println!();
    println!("  Documents:          {}", report.total_documents);
    println!("  Unique content:     {}", report.unique_content_count);
    println!("  Duplicate groups:   {}", report.remaining_duplicate_groups);
    println!("  Reserved keys:      {}", report.reserved_key_violations);
    println!("  Stale hashes:       {}", report.stale_hashes);
    println!("  Version mismatches: {}", report.schema_version_mismatches);
    println!();
    print_completeness(&report);
    println!();
    println!(
        "  Schema compliant:   {}",
        if report.schema_compliant { "yes" } else { "no" }
    );
    println!();
    Ok(report)
}

fn print_completeness(report: &ValidationReport) {
    println!(
        "  Completeness: {:.1}% average (threshold {:.0}%)",
        report.average_completeness * 100.0,
        COMPLIANCE_THRESHOLD * 100.0
    );
    println!("  {:<20} {:>8}", "FIELD", "PRESENT");
    println!("  {}", "-".repeat(30));
    for (field, ratio) in &report.field_completeness {
        let marker = if *ratio < COMPLIANCE_THRESHOLD { "  !" } else { "" };
        println!("  {:<20} {:>7.1}%{}", field, ratio * 100.0, marker);
    }
}

/// Table of backup artifacts, newest first.
pub fn print_backups(entries: &[BackupEntry]) {
    if entries.is_empty() {
        println!("No backups found.");
        return;
    }
    println!(
        "  {:<24} {:>6}   {:<16}   {}",
        "COLLECTION", "DOCS", "TAKEN", "PATH"
    );
    println!("  {}", "-".repeat(76));
    for entry in entries {
        let size = std::fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
        println!(
            "  {:<24} {:>6}   {:<16}   {} ({})",
            entry.info.collection_name,
            entry.info.document_count,
            format_ts_relative(entry.info.timestamp.timestamp()),
            entry.path.display(),
            format_bytes(size)
        );
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
