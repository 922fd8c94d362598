//! # meta
//!
//! why: persist the small records that must survive a crash before anything else is reloaded
//! relations: owned by log.rs; term/vote written by raft-core, watermarks by compactor.rs
//! what: MetaStorage trait, FileMetaStorage implementation, InMemoryMetaStorage for testing

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Compaction progress recorded alongside the vote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub minor_index: u64,
    pub major_index: u64,
}

/// trait for durable storage of raft metadata
///
/// this abstraction allows the same log to work with:
/// - real filesystem (native)
/// - in-memory (testing)
pub trait MetaStorage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> (u64, Option<u64>);

    /// persist the compaction watermarks
    fn save_watermarks(&mut self, watermarks: Watermarks) -> Result<()>;

    /// load the persisted compaction watermarks
    fn load_watermarks(&self) -> Watermarks;

    /// persist the highest index known to be committed
    fn save_commit_index(&mut self, index: u64) -> Result<()>;

    /// load the persisted commit index, 0 if none was recorded
    fn load_commit_index(&self) -> u64;

    /// clear all persisted state
    fn clear(&mut self) -> Result<()>;
}

/// metadata structure for term, vote and watermarks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaData {
    term: u64,
    voted_for: Option<u64>,
    #[serde(default)]
    watermarks: Watermarks,
    #[serde(default)]
    commit_index: u64,
}

// -- file storage implementation --

/// file-based metadata storage
///
/// stores everything in a single `meta.json` inside the log directory. the
/// file is read once on open and rewritten atomically on every change.
pub struct FileMetaStorage {
    dir: PathBuf,
    current: MetaData,
}

impl FileMetaStorage {
    /// open (or create) the metadata file in the given directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let current = Self::read(&dir.join(Self::FILE_NAME))?;
        Ok(Self { dir, current })
    }

    pub const FILE_NAME: &'static str = "meta.json";

    fn meta_path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }

    fn read(path: &Path) -> Result<MetaData> {
        if !path.exists() {
            return Ok(MetaData::default()); // default for new logs
        }

        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.current)?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join("meta.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.meta_path())?;

        Ok(())
    }
}

impl MetaStorage for FileMetaStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<()> {
        self.current.term = term;
        self.current.voted_for = voted_for;
        self.persist()
    }

    fn load_term_and_vote(&self) -> (u64, Option<u64>) {
        (self.current.term, self.current.voted_for)
    }

    fn save_watermarks(&mut self, watermarks: Watermarks) -> Result<()> {
        if self.current.watermarks == watermarks {
            return Ok(());
        }
        self.current.watermarks = watermarks;
        self.persist()
    }

    fn load_watermarks(&self) -> Watermarks {
        self.current.watermarks
    }

    fn save_commit_index(&mut self, index: u64) -> Result<()> {
        if self.current.commit_index == index {
            return Ok(());
        }
        self.current.commit_index = index;
        self.persist()
    }

    fn load_commit_index(&self) -> u64 {
        self.current.commit_index
    }

    fn clear(&mut self) -> Result<()> {
        self.current = MetaData::default();
        let _ = fs::remove_file(self.meta_path());
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory metadata storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default)]
pub struct InMemoryMetaStorage {
    current: MetaData,
}

impl InMemoryMetaStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStorage for InMemoryMetaStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<()> {
        self.current.term = term;
        self.current.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> (u64, Option<u64>) {
        (self.current.term, self.current.voted_for)
    }

    fn save_watermarks(&mut self, watermarks: Watermarks) -> Result<()> {
        self.current.watermarks = watermarks;
        Ok(())
    }

    fn load_watermarks(&self) -> Watermarks {
        self.current.watermarks
    }

    fn save_commit_index(&mut self, index: u64) -> Result<()> {
        self.current.commit_index = index;
        Ok(())
    }

    fn load_commit_index(&self) -> u64 {
        self.current.commit_index
    }

    fn clear(&mut self) -> Result<()> {
        self.current = MetaData::default();
        Ok(())
    }
}
