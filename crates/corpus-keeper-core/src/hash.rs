//! Content hashing.
//!
//! A document's identity for deduplication is the SHA-256 of its content.
//! The digest is rendered as lowercase hex, so it is stable across
//! processes and platforms.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of a document's content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

/// Which content representation duplicate detection hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashMode {
    /// Byte-exact content.
    #[default]
    Exact,
    /// Whitespace runs collapsed before hashing.
    Normalized,
}

impl ContentHash {
    /// Hash content byte-for-byte. Empty content hashes to the digest of
    /// the empty string.
    pub fn of(content: &str) -> Self {
        Self::of_bytes(content.as_bytes())
    }

    /// Whitespace-insensitive hash: runs of whitespace collapse to one
    /// space and the ends are trimmed.
    pub fn of_normalized(content: &str) -> Self {
        let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
        Self::of(&collapsed)
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ContentHash(format!("{:x}", hasher.finalize()))
    }

    pub fn with_mode(content: &str, mode: HashMode) -> Self {
        match mode {
            HashMode::Exact => Self::of(content),
            HashMode::Normalized => Self::of_normalized(content),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and renamed ids. Values
    /// shorter than that (e.g. read back from a hand-edited artifact) are
    /// returned whole.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
