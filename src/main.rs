//! # Corpus Keeper CLI (`ck`)
//!
//! The `ck` binary drives ingestion and the safe-mutation pipeline over a
//! local document store.
//!
//! ## Usage
//!
//! ```bash
//! ck --config ./config/ck.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ck init` | Create the SQLite store and run schema migrations |
//! | `ck collections list\|create\|delete` | Manage collections |
//! | `ck ingest <collection> <path>` | Ingest a JSONL file or a directory |
//! | `ck analyze <collection>` | Duplicate groups and field completeness |
//! | `ck dedup <collection>` | Remove duplicate content |
//! | `ck normalize <collection>` | Rewrite metadata to the canonical schema |
//! | `ck merge <collection> --source <other>` | Merge another collection in |
//! | `ck backup <collection>` | Take a snapshot |
//! | `ck backups [collection]` | List snapshots |
//! | `ck restore <path>` | Restore a snapshot |
//! | `ck validate <collection>` | Schema and duplicate validation report |
//! | `ck unlock <collection>` | Remove a lock left behind by a crashed run |
//!
//! `dedup`, `normalize` and `merge` only print their plan unless
//! `--confirm` is given.
//!
//! Logs go to stderr and are controlled by `RUST_LOG`
//! (default `corpus_keeper=info`).

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use corpus_keeper::backup::{self, BackupCoordinator};
use corpus_keeper::client::StoreClient;
use corpus_keeper::config::{self, Config};
use corpus_keeper::mutation::{self, CollectionLock, SafeMutationCoordinator};
use corpus_keeper::{ingest, migrate, stats};
use corpus_keeper_core::plan::MutationKind;

/// Corpus Keeper — normalization, dedup, chunking and safe mutation for a
/// schema-less document store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ck.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ck",
    about = "Corpus Keeper — keep a schema-less document corpus canonical and duplicate-free",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ck.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema. Idempotent.
    Init,

    /// Manage collections.
    Collections {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Ingest a JSONL file or a directory into a collection.
    ///
    /// Records are validated, split when longer than `chunking.max_length`,
    /// normalized, and deduplicated against the batch and the collection.
    Ingest {
        collection: String,
        /// JSONL file, or a directory scanned with the `[ingest]` globs.
        path: PathBuf,
        /// Report what would be added without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show duplicate groups and field completeness.
    Analyze { collection: String },

    /// Remove documents whose content duplicates an earlier document.
    Dedup {
        collection: String,
        /// Apply the plan (backup, commit, validate).
        #[arg(long)]
        confirm: bool,
    },

    /// Rewrite every document's metadata to the canonical schema.
    Normalize {
        collection: String,
        #[arg(long)]
        confirm: bool,
    },

    /// Copy documents from `--source` whose content the collection lacks.
    Merge {
        collection: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        confirm: bool,
    },

    /// Take a verified snapshot of a collection.
    Backup { collection: String },

    /// List snapshots, newest first.
    Backups { collection: Option<String> },

    /// Recreate a collection from a snapshot.
    Restore {
        path: PathBuf,
        /// Restore into this collection instead of the original.
        #[arg(long)]
        into: Option<String>,
    },

    /// Validate a collection against the canonical schema.
    Validate {
        collection: String,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove a collection's mutation lock. Only for locks left behind by
    /// a run that no longer exists.
    Unlock { collection: String },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// List collections with document counts.
    List,
    /// Create an empty collection.
    Create { name: String },
    /// Delete a collection and all its documents.
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("corpus_keeper=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match &cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Store initialized successfully.");
            return Ok(());
        }
        Commands::Unlock { collection } => {
            if CollectionLock::force_release(&cfg.backup.locks_dir(), collection)? {
                println!("Removed lock on '{}'.", collection);
            } else {
                println!("'{}' is not locked.", collection);
            }
            return Ok(());
        }
        _ => {}
    }

    let client = StoreClient::open(&cfg).await?;
    let result = run(&cli.command, &cfg, &client).await;
    client.close().await;
    result
}

async fn run(command: &Commands, cfg: &Config, client: &StoreClient) -> anyhow::Result<()> {
    match command {
        Commands::Init | Commands::Unlock { .. } => {}
        Commands::Collections { action } => match action {
            CollectionAction::List => stats::run_collections(client, cfg).await?,
            CollectionAction::Create { name } => {
                client.create_collection(name).await?;
                println!("Created collection '{}'.", name);
            }
            CollectionAction::Delete { name } => {
                client.delete_collection(name).await?;
                println!("Deleted collection '{}'.", name);
            }
        },
        Commands::Ingest {
            collection,
            path,
            dry_run,
        } => {
            let report = ingest::run_ingest(client, cfg, collection, path, *dry_run).await?;
            ingest::print_report(collection, &report);
            if !report.success {
                bail!("ingest finished with {} failure(s)", report.failures.len());
            }
        }
        Commands::Analyze { collection } => stats::run_analyze(client, cfg, collection).await?,
        Commands::Dedup {
            collection,
            confirm,
        } => run_mutation(client, cfg, collection, MutationKind::Deduplicate, *confirm).await?,
        Commands::Normalize {
            collection,
            confirm,
        } => {
            run_mutation(
                client,
                cfg,
                collection,
                MutationKind::NormalizeMetadata,
                *confirm,
            )
            .await?
        }
        Commands::Merge {
            collection,
            source,
            confirm,
        } => {
            let kind = MutationKind::Merge {
                source: source.clone(),
            };
            run_mutation(client, cfg, collection, kind, *confirm).await?
        }
        Commands::Backup { collection } => {
            let snapshot = BackupCoordinator::new(client, cfg.backup.dir.clone())
                .with_batch_size(cfg.mutation.batch_size)
                .snapshot(collection)
                .await?;
            println!(
                "Backed up {} document(s) to {}",
                snapshot.info.document_count,
                snapshot.path.display()
            );
        }
        Commands::Backups { collection } => {
            let entries = backup::list_backups(&cfg.backup.dir, collection.as_deref())?;
            stats::print_backups(&entries);
        }
        Commands::Restore { path, into } => {
            let restored = BackupCoordinator::new(client, cfg.backup.dir.clone())
                .with_batch_size(cfg.mutation.batch_size)
                .with_reserved(cfg.reserved_keys())
                .restore(path, into.as_deref())
                .await?;
            println!(
                "Restored {} document(s) into '{}'",
                restored.documents_restored, restored.collection
            );
        }
        Commands::Validate { collection, json } => {
            let report = stats::run_validate(client, cfg, collection, *json).await?;
            if !report.schema_compliant {
                bail!("collection '{}' is not schema compliant", collection);
            }
        }
    }
    Ok(())
}

async fn run_mutation(
    client: &StoreClient,
    cfg: &Config,
    collection: &str,
    kind: MutationKind,
    confirm: bool,
) -> anyhow::Result<()> {
    let report = SafeMutationCoordinator::new(client, cfg)
        .run(collection, kind, confirm)
        .await?;
    mutation::print_report(&report);
    if !report.success() {
        bail!(
            "{} did not complete: {}",
            report.report_info.kind.label(),
            report.report_info.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
