//! # log
//!
//! why: the durable, index-addressed sequence of entries that raft replicates
//! relations: built from segment.rs files, persists metadata via meta.rs, compacted by compactor.rs
//! what: Log (append/get/contains/truncate/commit/clean/skip), reload on open
//!
//! the log is shared between the raft task and the background compactor, so
//! the segment table sits behind a read/write lock. appends and truncation
//! take the write lock; reads share the read lock and therefore never observe
//! a half swapped segment.

use crate::compactor::Compactor;
use crate::entry::Entry;
use crate::error::{Result, StorageError};
use crate::meta::{MetaStorage, Watermarks};
use crate::segment::{self, Segment, SegmentDescriptor};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) struct LogInner {
    /// segments keyed by first index
    pub segments: BTreeMap<u64, Segment>,
    pub next_segment_id: u64,
    pub commit_index: u64,
}

impl LogInner {
    fn segment(&self, index: u64) -> Option<&Segment> {
        self.segments
            .range(..=index)
            .next_back()
            .map(|(_, segment)| segment)
            .filter(|segment| index < segment.next_index())
    }

    fn segment_mut(&mut self, index: u64) -> Option<&mut Segment> {
        self.segments
            .range_mut(..=index)
            .next_back()
            .map(|(_, segment)| segment)
            .filter(|segment| index < segment.next_index())
    }

    fn tail(&self) -> Option<&Segment> {
        self.segments.values().next_back()
    }

    fn tail_mut(&mut self) -> Option<&mut Segment> {
        self.segments.values_mut().next_back()
    }

    fn next_index(&self) -> u64 {
        self.tail().map(Segment::next_index).unwrap_or(1)
    }
}

/// A segmented, append-only log of raft entries.
pub struct Log {
    name: String,
    dir: PathBuf,
    max_entries: u64,
    inner: RwLock<LogInner>,
    meta: Mutex<Box<dyn MetaStorage>>,
    compactor: Compactor,
}

impl Log {
    /// Opens the log stored in `dir`, creating it if missing.
    ///
    /// metadata is loaded first; segments are then reloaded in index order,
    /// keeping only the newest version of every segment id.
    pub fn open(
        dir: impl Into<PathBuf>,
        name: &str,
        max_entries_per_segment: u64,
        meta: Box<dyn MetaStorage>,
    ) -> Result<Self> {
        Self::open_with_intervals(
            dir,
            name,
            max_entries_per_segment,
            meta,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        )
    }

    pub(crate) fn open_with_intervals(
        dir: impl Into<PathBuf>,
        name: &str,
        max_entries_per_segment: u64,
        meta: Box<dyn MetaStorage>,
        minor_interval: Duration,
        major_interval: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let max_entries = max_entries_per_segment.max(1);

        let watermarks = meta.load_watermarks();
        let compactor = Compactor::new(watermarks, minor_interval, major_interval);
        let mut inner = Self::load(&dir, name, max_entries)?;
        // the recorded commit cannot exceed what survived on disk
        inner.commit_index = meta.load_commit_index().min(inner.next_index() - 1);

        tracing::debug!(
            log = name,
            segments = inner.segments.len(),
            next_index = inner.next_index(),
            commit_index = inner.commit_index,
            "opened log",
        );

        Ok(Self {
            name: name.to_string(),
            dir,
            max_entries,
            inner: RwLock::new(inner),
            meta: Mutex::new(meta),
            compactor,
        })
    }

    fn load(dir: &Path, name: &str, max_entries: u64) -> Result<LogInner> {
        // newest version per segment id; everything else is stale
        let mut newest: HashMap<u64, (u64, PathBuf)> = HashMap::new();
        let mut stale = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(file) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };

            if file.ends_with(".tmp") {
                stale.push(path);
                continue;
            }

            let Some((id, version)) = segment::parse_file_name(name, file) else {
                continue;
            };

            match newest.get(&id) {
                Some((current, _)) if *current >= version => stale.push(path),
                _ => {
                    if let Some((_, previous)) = newest.insert(id, (version, path)) {
                        stale.push(previous);
                    }
                }
            }
        }

        for path in stale {
            tracing::debug!(path = %path.display(), "removing stale segment file");
            let _ = fs::remove_file(segment::index_path_for(&path));
            let _ = fs::remove_file(&path);
        }

        // orphaned offset indexes whose log file was never renamed into place
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "index") && !path.with_extension("log").exists() {
                let _ = fs::remove_file(&path);
            }
        }

        let mut opened = newest
            .into_values()
            .map(|(_, path)| Segment::open(&path))
            .collect::<Result<Vec<_>>>()?;
        opened.sort_by_key(|segment| (segment.first_index(), std::cmp::Reverse(segment.range())));

        let next_segment_id = opened
            .iter()
            .map(|segment| segment.descriptor().id)
            .max()
            .unwrap_or(0)
            + 1;

        // drop sources of a combined segment that were not deleted before a crash
        let mut segments: Vec<Segment> = Vec::with_capacity(opened.len());
        for segment in opened {
            if let Some(previous) = segments.last() {
                if segment.first_index() < previous.next_index() {
                    tracing::debug!(
                        path = %segment.path().display(),
                        "removing segment covered by a compacted segment",
                    );
                    segment.delete();
                    continue;
                }
                if previous.is_sealed() && segment.first_index() > previous.next_index() {
                    return Err(StorageError::corrupted(
                        segment.path(),
                        format!(
                            "gap between index {} and segment start {}",
                            previous.next_index(),
                            segment.first_index()
                        ),
                    ));
                }
            }
            segments.push(segment);
        }

        // every segment except the last one is sealed and spans up to its successor
        let count = segments.len();
        for i in 0..count.saturating_sub(1) {
            let next_first = segments[i + 1].first_index();
            let segment = &mut segments[i];
            if !segment.is_sealed() {
                segment.set_range(next_first - segment.first_index());
                segment.seal()?;
            }
        }

        let mut inner = LogInner {
            segments: segments
                .into_iter()
                .map(|segment| (segment.first_index(), segment))
                .collect(),
            next_segment_id,
            commit_index: 0,
        };

        let (full, sealed) = inner
            .tail()
            .map(|tail| (tail.is_full(), tail.is_sealed()))
            .unwrap_or((true, true));
        if full {
            Self::roll(&mut inner, dir, name, max_entries)?;
        } else if sealed {
            // a sealed but partially filled tail becomes writable again
            if let Some(tail) = inner.tail_mut() {
                let last = tail.last_index();
                tail.truncate(last)?;
            }
        }

        Ok(inner)
    }

    /// Starts a new tail segment after the current one.
    fn roll(inner: &mut LogInner, dir: &Path, name: &str, max_entries: u64) -> Result<()> {
        let first_index = inner.next_index();
        if let Some(tail) = inner.tail_mut() {
            if !tail.is_sealed() {
                tail.seal()?;
            }
        }

        let descriptor = SegmentDescriptor {
            id: inner.next_segment_id,
            version: 1,
            first_index,
            max_entries,
        };
        inner.next_segment_id += 1;

        tracing::trace!(segment = descriptor.id, first_index, "starting new segment");
        let segment = Segment::create(dir, name, descriptor)?;
        inner.segments.insert(first_index, segment);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn max_entries_per_segment(&self) -> u64 {
        self.max_entries
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    pub(crate) fn read_inner(&self) -> RwLockReadGuard<'_, LogInner> {
        self.inner.read()
    }

    pub(crate) fn write_inner(&self) -> RwLockWriteGuard<'_, LogInner> {
        self.inner.write()
    }

    /// Appends an entry at the next index and returns that index.
    pub fn append(&self, entry: Entry) -> Result<u64> {
        let mut inner = self.inner.write();
        let index = entry.index;

        let tail = inner
            .tail_mut()
            .ok_or_else(|| StorageError::corrupted(&self.dir, "log has no tail segment"))?;
        tail.append(&entry)?;

        if tail.is_full() {
            Self::roll(&mut inner, &self.dir, &self.name, self.max_entries)?;
        }
        Ok(index)
    }

    /// Leaves `count` indices empty, for entries the leader already compacted.
    pub fn skip(&self, count: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let mut remaining = count;

        while remaining > 0 {
            let tail = inner
                .tail_mut()
                .ok_or_else(|| StorageError::corrupted(&self.dir, "log has no tail segment"))?;
            let room = tail.descriptor().max_entries.saturating_sub(tail.range()).max(1);
            let step = remaining.min(room);
            tail.skip(step);
            remaining -= step;

            if tail.is_full() {
                Self::roll(&mut inner, &self.dir, &self.name, self.max_entries)?;
            }
        }
        Ok(())
    }

    /// Returns the entry at `index`, or `None` if it was never written or has
    /// been compacted away.
    pub fn get(&self, index: u64) -> Result<Option<Entry>> {
        let inner = self.inner.read();
        match inner.segment(index) {
            Some(segment) => segment.get(index),
            None => Ok(None),
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        let inner = self.inner.read();
        inner
            .segment(index)
            .is_some_and(|segment| segment.contains(index))
    }

    /// Term of the entry at `index` without reading it from disk.
    pub fn term(&self, index: u64) -> Option<u64> {
        let inner = self.inner.read();
        inner.segment(index).and_then(|segment| segment.term(index))
    }

    pub fn first_index(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .segments
            .values()
            .next()
            .map(Segment::first_index)
            .unwrap_or(1)
    }

    /// Index of the last slot, 0 when nothing has been written.
    pub fn last_index(&self) -> u64 {
        self.inner.read().next_index() - 1
    }

    pub fn next_index(&self) -> u64 {
        self.inner.read().next_index()
    }

    /// Number of index slots, counting compacted ones.
    pub fn length(&self) -> u64 {
        let first = self.first_index();
        (self.last_index() + 1).saturating_sub(first)
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Drops every entry after `index`. Committed entries are never dropped.
    pub fn truncate(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if index < inner.commit_index {
            return Err(StorageError::TruncateCommitted {
                index,
                commit: inner.commit_index,
            });
        }
        if index >= inner.next_index() - 1 {
            return Ok(());
        }

        tracing::debug!(log = %self.name, index, "truncating log");

        // the first segment always survives, possibly as an empty tail
        let head = inner.segments.keys().next().copied();
        let removed: Vec<u64> = inner
            .segments
            .range(index.saturating_add(1)..)
            .map(|(&first, _)| first)
            .filter(|&first| Some(first) != head)
            .collect();
        for first in removed {
            if let Some(segment) = inner.segments.remove(&first) {
                segment.delete();
            }
        }

        let Some(tail) = inner.tail_mut() else {
            return Err(StorageError::corrupted(&self.dir, "log has no tail segment"));
        };
        tail.truncate(index)?;
        if tail.is_full() {
            Self::roll(&mut inner, &self.dir, &self.name, self.max_entries)?;
        }
        Ok(())
    }

    /// Records `index` as committed. The commit index never moves backwards.
    pub fn commit(&self, index: u64) -> u64 {
        let mut inner = self.inner.write();
        let last = inner.next_index() - 1;
        inner.commit_index = inner.commit_index.max(index.min(last));
        inner.commit_index
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.read().commit_index
    }

    /// Marks the entry at `index` as no longer needed by the state machine.
    /// Returns false if the entry does not exist.
    pub fn clean(&self, index: u64) -> bool {
        let mut inner = self.inner.write();
        inner
            .segment_mut(index)
            .is_some_and(|segment| segment.clean(index))
    }

    pub fn is_clean(&self, index: u64) -> bool {
        let inner = self.inner.read();
        inner
            .segment(index)
            .is_some_and(|segment| segment.is_clean(index))
    }

    /// Forces appended entries to disk, then records the commit index so a
    /// reopened log knows which of them are committed.
    pub fn flush(&self) -> Result<()> {
        let commit_index = {
            let mut inner = self.inner.write();
            if let Some(tail) = inner.tail_mut() {
                tail.flush()?;
            }
            inner.commit_index
        };
        self.meta.lock().save_commit_index(commit_index)
    }

    /// Number of segment files currently backing the log.
    pub fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    pub fn save_term_and_vote(&self, term: u64, voted_for: Option<u64>) -> Result<()> {
        self.meta.lock().save_term_and_vote(term, voted_for)
    }

    pub fn load_term_and_vote(&self) -> (u64, Option<u64>) {
        self.meta.lock().load_term_and_vote()
    }

    pub(crate) fn save_watermarks(&self, watermarks: Watermarks) -> Result<()> {
        self.meta.lock().save_watermarks(watermarks)
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}
