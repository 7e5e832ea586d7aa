//! TOML configuration.
//!
//! Every section except `[store]` is optional and falls back to the
//! defaults below. [`load_config`] validates eagerly so a bad value is
//! reported before any store I/O happens.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use corpus_keeper_core::chunk::{Chunker, DEFAULT_BATCH_SIZE, DEFAULT_MIN_LENGTH};
use corpus_keeper_core::normalize::SchemaNormalizer;
use corpus_keeper_core::schema::{ReservedKeys, DEFAULT_RESERVED_SENTINEL};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default = "default_reserved_prefix")]
    pub reserved_prefix: String,
}

fn default_reserved_prefix() -> String {
    DEFAULT_RESERVED_SENTINEL.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_chunk_batch_size")]
    pub batch_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            overlap: default_overlap(),
            min_length: default_min_length(),
            batch_size: default_chunk_batch_size(),
        }
    }
}

fn default_max_length() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_min_length() -> usize {
    DEFAULT_MIN_LENGTH
}
fn default_chunk_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizeConfig {
    #[serde(default = "default_project")]
    pub default_project: String,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            default_project: default_project(),
        }
    }
}

fn default_project() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MutationConfig {
    #[serde(default = "default_mutation_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_mutation_batch_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl MutationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_mutation_batch_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
        }
    }
}

impl BackupConfig {
    pub fn reports_dir(&self) -> PathBuf {
        self.dir.join("reports")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.dir.join(".locks")
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./data/backups")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

impl Config {
    /// Config with every default and the given store path. Used by tests
    /// and by `ck` commands run before a config file exists.
    pub fn with_store_path(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                path: path.into(),
                reserved_prefix: default_reserved_prefix(),
            },
            chunking: ChunkingConfig::default(),
            normalize: NormalizeConfig::default(),
            mutation: MutationConfig::default(),
            backup: BackupConfig::default(),
            ingest: IngestConfig::default(),
        }
    }

    pub fn reserved_keys(&self) -> ReservedKeys {
        ReservedKeys::new(&self.store.reserved_prefix)
    }

    pub fn normalizer(&self) -> SchemaNormalizer {
        SchemaNormalizer::new(self.reserved_keys())
            .with_default_project(&self.normalize.default_project)
    }

    pub fn chunker(&self) -> Result<Chunker> {
        let chunker = Chunker::new(self.chunking.max_length, self.chunking.overlap)?
            .with_min_length(self.chunking.min_length)
            .with_batch_size(self.chunking.batch_size)?;
        Ok(chunker)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.store.reserved_prefix.trim().is_empty() {
        anyhow::bail!("store.reserved_prefix must not be empty");
    }

    // Chunking: reuse the constructor's checks so the messages match.
    config.chunker().context("invalid [chunking] section")?;

    if config.mutation.batch_size == 0 {
        anyhow::bail!("mutation.batch_size must be > 0");
    }
    if config.mutation.timeout_secs == 0 {
        anyhow::bail!("mutation.timeout_secs must be > 0");
    }

    if config.normalize.default_project.trim().is_empty() {
        anyhow::bail!("normalize.default_project must not be empty");
    }

    if config.ingest.include_globs.is_empty() {
        anyhow::bail!("ingest.include_globs must list at least one pattern");
    }

    Ok(())
}
