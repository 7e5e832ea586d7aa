//! Pipeline error taxonomy.
//!
//! Hard failures only. Per-document commit failures and soft validation
//! findings are data in the mutation and ingest reports, not errors.

use std::path::PathBuf;

use thiserror::Error;

use corpus_keeper_core::{ConfigError, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A transient store error that survived every retry.
    #[error("store unavailable after {attempts} attempt(s): {source}")]
    TransientStore {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(StoreError),

    /// The snapshot could not be written or verified. Nothing was changed.
    #[error("backup failed for '{collection}': {reason}")]
    BackupFailure { collection: String, reason: String },

    /// A store call exceeded its deadline.
    #[error("{operation} timed out after {secs}s{}", backup_hint(.backup))]
    Timeout {
        operation: String,
        secs: u64,
        backup: Option<PathBuf>,
    },

    #[error(
        "collection '{collection}' is locked by another run ({path}); \
         if no run is active, clear it with `ck unlock {collection}`"
    )]
    Locked { collection: String, path: PathBuf },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn backup_hint(backup: &Option<PathBuf>) -> String {
    match backup {
        Some(path) => format!("; restore from {} or retry", path.display()),
        None => String::new(),
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store(err)
    }
}

impl PipelineError {
    pub fn backup(collection: &str, reason: impl std::fmt::Display) -> Self {
        PipelineError::BackupFailure {
            collection: collection.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Reclassify a snapshot-stage error. Timeouts keep their own kind.
    pub fn into_backup_failure(self, collection: &str) -> Self {
        match self {
            PipelineError::BackupFailure { .. } | PipelineError::Timeout { .. } => self,
            other => PipelineError::backup(collection, other),
        }
    }

    /// Attach the backup path to a timeout raised after the snapshot.
    pub fn with_backup(self, path: &std::path::Path) -> Self {
        match self {
            PipelineError::Timeout {
                operation, secs, ..
            } => PipelineError::Timeout {
                operation,
                secs,
                backup: Some(path.to_path_buf()),
            },
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::Timeout { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
