//! # compactor
//!
//! why: cleaned entries must eventually leave the disk without ever shifting an index
//! relations: rewrites segment.rs files owned by log.rs, persists watermarks through meta.rs
//! what: Compaction kinds, Compactor (watermarks + intervals), Log::compact, background task
//!
//! minor compaction drops cleaned entries that are not tombstones from sealed
//! segments below the minor watermark. major compaction also drops cleaned
//! tombstones below the major watermark and combines neighbouring segments
//! whose surviving entries fit in one segment.
//!
//! segments are planned under the read lock, rewritten without any lock and
//! swapped in under the write lock only if the log did not replace or truncate
//! them in the meantime.

use crate::error::{Result, StorageError};
use crate::log::Log;
use crate::meta::Watermarks;
use crate::segment::{self, Position, SegmentSnapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_MINOR_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAJOR_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compaction {
    Minor,
    Major,
}

impl std::fmt::Display for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compaction::Minor => write!(f, "minor"),
            Compaction::Major => write!(f, "major"),
        }
    }
}

/// Outcome of a single compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub segments_rewritten: usize,
    pub segments_combined: usize,
    pub entries_removed: usize,
    /// segments whose rewrite failed and were left untouched
    pub failures: usize,
}

impl CompactionReport {
    pub fn is_noop(&self) -> bool {
        self.segments_rewritten == 0 && self.failures == 0
    }
}

/// Compaction watermarks and scheduling for one log.
#[derive(Debug)]
pub struct Compactor {
    minor_index: AtomicU64,
    major_index: AtomicU64,
    minor_interval: Duration,
    major_interval: Duration,
    // one pass at a time
    running: Mutex<()>,
}

impl Compactor {
    pub(crate) fn new(watermarks: Watermarks, minor_interval: Duration, major_interval: Duration) -> Self {
        Self {
            minor_index: AtomicU64::new(watermarks.minor_index),
            major_index: AtomicU64::new(watermarks.major_index),
            minor_interval,
            major_interval,
            running: Mutex::new(()),
        }
    }

    /// Highest index minor compaction may touch. Never moves backwards.
    pub fn set_minor_index(&self, index: u64) {
        self.minor_index.fetch_max(index, Ordering::AcqRel);
    }

    pub fn minor_index(&self) -> u64 {
        self.minor_index.load(Ordering::Acquire)
    }

    /// Highest index major compaction may touch. Never moves backwards.
    pub fn set_major_index(&self, index: u64) {
        self.major_index.fetch_max(index, Ordering::AcqRel);
    }

    pub fn major_index(&self) -> u64 {
        self.major_index.load(Ordering::Acquire)
    }

    pub fn minor_interval(&self) -> Duration {
        self.minor_interval
    }

    pub fn major_interval(&self) -> Duration {
        self.major_interval
    }

    fn watermarks(&self) -> Watermarks {
        Watermarks {
            minor_index: self.minor_index(),
            major_index: self.major_index(),
        }
    }

    /// Runs minor and major compaction of `log` on their intervals until the
    /// returned handle is cancelled or dropped. Needs a tokio runtime.
    pub fn spawn(log: Arc<Log>) -> CompactorHandle {
        let minor = log.compactor().minor_interval();
        let major = log.compactor().major_interval();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut minor_tick = tokio::time::interval_at(start + minor, minor);
            let mut major_tick = tokio::time::interval_at(start + major, major);

            loop {
                let kind = tokio::select! {
                    _ = major_tick.tick() => Compaction::Major,
                    _ = minor_tick.tick() => Compaction::Minor,
                };

                let target = Arc::clone(&log);
                match tokio::task::spawn_blocking(move || target.compact(kind)).await {
                    Ok(Ok(report)) if report.is_noop() => {
                        tracing::trace!(log = log.name(), compaction = %kind, "nothing to compact");
                    }
                    Ok(Ok(report)) => {
                        tracing::debug!(
                            log = log.name(),
                            compaction = %kind,
                            rewritten = report.segments_rewritten,
                            removed = report.entries_removed,
                            "compaction finished",
                        );
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(log = log.name(), compaction = %kind, error = %error, "compaction failed");
                    }
                    Err(error) => {
                        tracing::error!(log = log.name(), error = %error, "compaction task panicked");
                        break;
                    }
                }
            }
        });

        CompactorHandle { task }
    }
}

/// Handle to a running background compactor. Dropping it stops the task.
#[derive(Debug)]
pub struct CompactorHandle {
    task: JoinHandle<()>,
}

impl CompactorHandle {
    /// Stops the background task. Calling it again is a no-op.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// -- compaction pass --

struct Plan {
    sources: Vec<SegmentSnapshot>,
    removed: usize,
}

fn removable(kind: Compaction, position: &Position, clean: bool) -> bool {
    match kind {
        Compaction::Minor => clean && !position.tombstone,
        Compaction::Major => clean,
    }
}

fn plan(kind: Compaction, candidates: Vec<SegmentSnapshot>, max_entries: u64) -> Vec<Plan> {
    let removed_in = |snapshot: &SegmentSnapshot| {
        snapshot
            .positions
            .iter()
            .filter(|(index, position)| removable(kind, position, snapshot.cleaned.contains(*index)))
            .count()
    };

    let mut plans: Vec<Plan> = Vec::new();
    match kind {
        Compaction::Minor => {
            for snapshot in candidates {
                let removed = removed_in(&snapshot);
                if removed > 0 {
                    plans.push(Plan {
                        sources: vec![snapshot],
                        removed,
                    });
                }
            }
        }
        Compaction::Major => {
            let mut current: Option<(Plan, u64)> = None;
            for snapshot in candidates {
                let removed = removed_in(&snapshot);
                let live = (snapshot.positions.len() - removed) as u64;

                if let Some((group, group_live)) = current.as_mut() {
                    let adjacent = group
                        .sources
                        .last()
                        .is_some_and(|last| last.descriptor.first_index + last.range == snapshot.descriptor.first_index);
                    if adjacent && *group_live + live <= max_entries {
                        group.sources.push(snapshot);
                        group.removed += removed;
                        *group_live += live;
                        continue;
                    }
                }

                if let Some((group, _)) = current.take() {
                    plans.push(group);
                }
                current = Some((
                    Plan {
                        sources: vec![snapshot],
                        removed,
                    },
                    live,
                ));
            }
            plans.extend(current.map(|(group, _)| group));
            plans.retain(|group| group.removed > 0 || group.sources.len() > 1);
        }
    }
    plans
}

impl Log {
    /// Runs one compaction pass up to the current watermark.
    ///
    /// a segment whose rewrite fails is logged and left as it was; the other
    /// segments are still compacted. running the same pass twice without new
    /// cleaned entries rewrites nothing.
    pub fn compact(&self, kind: Compaction) -> Result<CompactionReport> {
        let compactor = self.compactor();
        let _running = compactor.running.lock();
        self.save_watermarks(compactor.watermarks())?;

        let watermark = match kind {
            Compaction::Minor => compactor.minor_index(),
            Compaction::Major => compactor.major_index(),
        };

        let plans = {
            let inner = self.read_inner();
            let watermark = watermark.min(inner.commit_index);
            let tail = inner.segments.keys().next_back().copied();
            // the last entry always stays readable so the log never ends in a gap
            let last = inner.segments.values().next_back().map(|s| s.next_index() - 1).unwrap_or(0);
            let candidates = inner
                .segments
                .values()
                .filter(|segment| segment.is_sealed() && Some(segment.first_index()) != tail)
                .filter(|segment| segment.last_index() <= watermark && segment.last_index() < last)
                .map(|segment| segment.snapshot())
                .collect();
            plan(kind, candidates, self.max_entries_per_segment())
        };

        let mut report = CompactionReport::default();
        for group in plans {
            let id = group.sources[0].descriptor.id;
            let rewritten = segment::rewrite(self.directory(), self.name(), &group.sources, |_, position, clean| {
                !removable(kind, position, clean)
            });

            let mut rewritten = match rewritten {
                Ok(rewritten) => rewritten,
                Err(error) => {
                    let error = StorageError::Compaction {
                        segment: id,
                        reason: error.to_string(),
                    };
                    tracing::warn!(log = self.name(), compaction = %kind, error = %error, "segment left uncompacted");
                    report.failures += 1;
                    continue;
                }
            };

            let replaced = {
                let mut inner = self.write_inner();
                let unchanged = group.sources.iter().all(|source| {
                    inner
                        .segments
                        .get(&source.descriptor.first_index)
                        .is_some_and(|current| current.descriptor() == source.descriptor && current.is_sealed())
                });

                if unchanged {
                    let mut replaced = Vec::with_capacity(group.sources.len());
                    for source in &group.sources {
                        if let Some(old) = inner.segments.remove(&source.descriptor.first_index) {
                            rewritten.merge_cleaned(old.cleaned().iter().copied());
                            replaced.push(old);
                        }
                    }
                    inner.segments.insert(rewritten.first_index(), rewritten);
                    Ok(replaced)
                } else {
                    Err(rewritten)
                }
            };

            match replaced {
                Ok(replaced) => {
                    for old in &replaced {
                        old.delete();
                    }
                    report.segments_rewritten += 1;
                    report.segments_combined += replaced.len().saturating_sub(1);
                    report.entries_removed += group.removed;
                }
                Err(discarded) => {
                    tracing::debug!(log = self.name(), segment = id, "segment changed during compaction, discarding rewrite");
                    discarded.delete();
                }
            }
        }

        if !report.is_noop() {
            tracing::info!(
                log = self.name(),
                compaction = %kind,
                watermark,
                rewritten = report.segments_rewritten,
                combined = report.segments_combined,
                removed = report.entries_removed,
                "compacted log",
            );
        }
        Ok(report)
    }
}
