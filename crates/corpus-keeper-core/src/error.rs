//! Error types shared by the core components.

use thiserror::Error;

/// Rejected component configuration. Raised synchronously at
/// construction time, never mid-pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_length must be > 0")]
    ZeroMaxLength,

    #[error("overlap ({overlap}) must be smaller than max_length ({max_length})")]
    OverlapTooLarge { overlap: usize, max_length: usize },

    #[error("batch_size must be > 0")]
    ZeroBatchSize,

    #[error("delimiter list must not be empty")]
    NoDelimiters,
}

/// A single document whose metadata cannot be brought into the unified
/// schema. The document is skipped; the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema violation for '{document_id}': {reason}")]
pub struct SchemaViolation {
    pub document_id: String,
    pub reason: String,
}

impl SchemaViolation {
    pub fn new(document_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O or availability problem; safe to retry with bounded attempts.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("document already exists: {0}")]
    DuplicateId(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// Writing a key from the store's reserved namespace.
    #[error("reserved metadata key '{key}' on document '{document_id}'")]
    ReservedKey { document_id: String, key: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("metadata serialization: {}", err))
    }
}
