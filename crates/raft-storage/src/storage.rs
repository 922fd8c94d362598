//! # storage
//!
//! why: one place that knows where logs live and how they are tuned
//! relations: opens log.rs instances backed by meta.rs FileMetaStorage
//! what: StorageConfig, Storage builder

use crate::compactor::{DEFAULT_MAJOR_INTERVAL, DEFAULT_MINOR_INTERVAL};
use crate::error::Result;
use crate::log::Log;
use crate::meta::FileMetaStorage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage tuning. Intervals are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// root directory; every log gets a subdirectory named after it
    pub directory: PathBuf,
    pub max_entries_per_segment: u64,
    pub minor_compaction_interval: u64,
    pub major_compaction_interval: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            max_entries_per_segment: 1024,
            minor_compaction_interval: DEFAULT_MINOR_INTERVAL.as_millis() as u64,
            major_compaction_interval: DEFAULT_MAJOR_INTERVAL.as_millis() as u64,
        }
    }
}

impl StorageConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn with_max_entries_per_segment(mut self, max_entries: u64) -> Self {
        self.max_entries_per_segment = max_entries;
        self
    }

    pub fn with_minor_compaction_interval(mut self, interval: Duration) -> Self {
        self.minor_compaction_interval = interval.as_millis() as u64;
        self
    }

    pub fn with_major_compaction_interval(mut self, interval: Duration) -> Self {
        self.major_compaction_interval = interval.as_millis() as u64;
        self
    }
}

/// Opens durable logs under a configured root directory.
#[derive(Debug, Clone)]
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Opens (or creates) the log called `name`. Metadata is reloaded before
    /// any segment.
    pub fn open(&self, name: &str) -> Result<Log> {
        let dir = self.config.directory.join(name);
        let meta = FileMetaStorage::open(&dir)?;

        tracing::debug!(log = name, dir = %dir.display(), "opening log");
        Log::open_with_intervals(
            dir,
            name,
            self.config.max_entries_per_segment,
            Box::new(meta),
            Duration::from_millis(self.config.minor_compaction_interval),
            Duration::from_millis(self.config.major_compaction_interval),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: StorageConfig = serde_json::from_str(r#"{"directory":"/var/lib/raft"}"#).unwrap();

        assert_eq!(config.directory, PathBuf::from("/var/lib/raft"));
        assert_eq!(config.max_entries_per_segment, 1024);
        assert_eq!(config.minor_compaction_interval, 60_000);
    }

    #[test]
    fn each_log_gets_its_own_directory() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(StorageConfig::new(dir.path()).with_max_entries_per_segment(8));

        let log = storage.open("raft").unwrap();
        log.save_term_and_vote(2, Some(1)).unwrap();

        assert_eq!(log.directory(), dir.path().join("raft"));
        assert_eq!(log.max_entries_per_segment(), 8);
        assert!(dir.path().join("raft").join(FileMetaStorage::FILE_NAME).exists());
    }

    #[test]
    fn term_and_vote_survive_reopen() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(StorageConfig::new(dir.path()));
        storage.open("raft").unwrap().save_term_and_vote(4, Some(3)).unwrap();

        let log = storage.open("raft").unwrap();

        assert_eq!(log.load_term_and_vote(), (4, Some(3)));
    }
}
