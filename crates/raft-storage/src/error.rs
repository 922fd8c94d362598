//! # error
//!
//! why: give every storage failure a typed, matchable shape
//! relations: returned by log.rs, segment.rs, meta.rs and compactor.rs; wrapped by raft-core
//! what: StorageError and the crate Result alias

use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by the durable log and its metadata.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An entry or metadata record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A segment file does not match its descriptor or is unreadable.
    #[error("corrupted segment {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// An append did not land on the next free index.
    #[error("index {index} out of order, next index is {next}")]
    OutOfOrder { index: u64, next: u64 },

    /// Truncation would drop committed entries.
    #[error("cannot truncate to {index}, entries up to {commit} are committed")]
    TruncateCommitted { index: u64, commit: u64 },

    /// A single segment could not be rewritten. The original is left untouched.
    #[error("compaction of segment {segment} failed: {reason}")]
    Compaction { segment: u64, reason: String },
}

impl StorageError {
    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
