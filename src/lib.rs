//! # Corpus Keeper
//!
//! Keeps a schema-less document corpus canonical, duplicate-free and
//! bounded in chunk size, and changes it only through backed-up,
//! confirmed, validated mutations.
//!
//! The pure pieces (hashing, normalization, chunking, dedup, plans,
//! validation, the store trait) live in `corpus_keeper_core`. This crate
//! adds the SQLite store, configuration, backups, the mutation state
//! machine, ingestion and the `ck` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────┐   ┌──────────┐
//! │ JSONL/dir  │──▶│ validate→split→      │──▶│  SQLite   │
//! │  records   │   │ normalize→dedup      │   │  store    │
//! └────────────┘   └──────────────────────┘   └────┬─────┘
//!                                                  │
//!            ┌─────────────────────────────────────┤
//!            ▼                                     ▼
//!      ┌───────────┐  PLANNED→BACKED_UP→     ┌──────────┐
//!      │ mutation  │──COMMITTED→VALIDATED───▶│ reports  │
//!      └───────────┘                         └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite `DocumentStore` |
//! | [`client`] | Store client with timeouts and retries |
//! | [`error`] | Pipeline error taxonomy |
//! | [`backup`] | Snapshots and restore |
//! | [`mutation`] | Safe mutation state machine |
//! | [`ingest`] | Ingestion pipeline |
//! | [`stats`] | Collection summaries |

pub mod backup;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod mutation;
pub mod sqlite_store;
pub mod stats;
