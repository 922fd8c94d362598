//! # comprehensive storage tests
//!
//! why: verify the segmented log behaves across restarts, truncation and compaction
//! relations: tests raft-storage crate
//! what: segmented log basics, crash recovery, compaction scenarios, background compactor

use raft_storage::{
    Compaction, Entry, EntryKind, InMemoryMetaStorage, Log, Storage, StorageConfig, StorageError,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn command(index: u64) -> Entry {
    Entry::new(1, index, EntryKind::Command {
        session: 1,
        sequence: index,
        operation: format!("cmd{index}").into_bytes(),
    })
}

fn tombstone(index: u64) -> Entry {
    Entry::new(1, index, EntryKind::Tombstone {
        session: 1,
        sequence: index,
        operation: format!("del{index}").into_bytes(),
    })
}

/// even indices are tombstones, odd indices commands
fn mixed(index: u64) -> Entry {
    if index % 2 == 0 {
        tombstone(index)
    } else {
        command(index)
    }
}

fn memory_log(dir: &Path, per_segment: u64) -> Log {
    Log::open(dir, "raft", per_segment, Box::new(InMemoryMetaStorage::new())).unwrap()
}

fn file_storage(dir: &Path, per_segment: u64) -> Storage {
    Storage::new(StorageConfig::new(dir).with_max_entries_per_segment(per_segment))
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    files
}

// =============================================================================
// SECTION 1: SEGMENTED LOG BASICS
// =============================================================================

mod log_basics {
    use super::*;

    #[test]
    fn append_returns_index() {
        let dir = tempdir().unwrap();
        let log = memory_log(dir.path(), 10);

        assert_eq!(log.append(command(1)).unwrap(), 1);
        assert_eq!(log.append(command(2)).unwrap(), 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn append_at_wrong_index_is_rejected() {
        let dir = tempdir().unwrap();
        let log = memory_log(dir.path(), 10);
        log.append(command(1)).unwrap();

        let error = log.append(command(3)).unwrap_err();

        assert!(matches!(error, StorageError::OutOfOrder { index: 3, next: 2 }));
    }

    #[test]
    fn get_and_contains() {
        let dir = tempdir().unwrap();
        let log = memory_log(dir.path(), 4);
        for index in 1..=9 {
            log.append(mixed(index)).unwrap();
        }

        assert_eq!(log.get(6).unwrap(), Some(tombstone(6)));
        assert!(log.contains(9));
        assert!(!log.contains(10));
        assert!(!log.contains(0));
        assert_eq!(log.get(10).unwrap(), None);
    }

    #[test]
    fn commit_is_capped_and_monotonic() {
        let dir = tempdir().unwrap();
        let log = memory_log(dir.path(), 4);
        for index in 1..=5 {
            log.append(command(index)).unwrap();
        }

        assert_eq!(log.commit(3), 3);
        assert_eq!(log.commit(2), 3);
        assert_eq!(log.commit(100), 5);
        assert_eq!(log.commit_index(), 5);
    }

    #[test]
    fn truncate_below_commit_is_rejected() {
        let dir = tempdir().unwrap();
        let log = memory_log(dir.path(), 4);
        for index in 1..=5 {
            log.append(command(index)).unwrap();
        }
        log.commit(4);

        let error = log.truncate(2).unwrap_err();

        assert!(matches!(error, StorageError::TruncateCommitted { index: 2, commit: 4 }));
        assert_eq!(log.last_index(), 5);
    }

    #[test]
    fn truncate_then_append_replaces_suffix() {
        let dir = tempdir().unwrap();
        let log = memory_log(dir.path(), 4);
        for index in 1..=10 {
            log.append(command(index)).unwrap();
        }

        log.truncate(6).unwrap();
        log.append(Entry::new(2, 7, EntryKind::NoOp)).unwrap();

        assert_eq!(log.last_index(), 7);
        assert_eq!(log.term(7), Some(2));
        assert_eq!(log.term(6), Some(1));
        assert!(!log.contains(8));
    }

    #[test]
    fn skip_spans_several_segments() {
        let dir = tempdir().unwrap();
        let log = memory_log(dir.path(), 4);
        log.append(command(1)).unwrap();

        log.skip(9).unwrap();
        log.append(command(11)).unwrap();

        assert_eq!(log.last_index(), 11);
        assert_eq!(log.length(), 11);
        assert!((2..=10).all(|index| !log.contains(index)));
        assert_eq!(log.get(11).unwrap(), Some(command(11)));
    }
}

// =============================================================================
// SECTION 2: CRASH RECOVERY
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn entries_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let log = file_storage(dir.path(), 4).open("raft").unwrap();
            for index in 1..=11 {
                log.append(mixed(index)).unwrap();
            }
            log.flush().unwrap();
        }

        let log = file_storage(dir.path(), 4).open("raft").unwrap();

        assert_eq!(log.last_index(), 11);
        assert_eq!(log.get(4).unwrap(), Some(tombstone(4)));
        assert_eq!(log.get(11).unwrap(), Some(command(11)));
        assert_eq!(log.append(command(12)).unwrap(), 12);
    }

    #[test]
    fn restart_after_truncate() {
        let dir = tempdir().unwrap();
        {
            let log = file_storage(dir.path(), 4).open("raft").unwrap();
            for index in 1..=10 {
                log.append(command(index)).unwrap();
            }
            log.truncate(3).unwrap();
        }

        let log = file_storage(dir.path(), 4).open("raft").unwrap();

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.append(command(4)).unwrap(), 4);
    }

    #[test]
    fn term_vote_and_watermarks_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let log = file_storage(dir.path(), 4).open("raft").unwrap();
            for index in 1..=5 {
                log.append(command(index)).unwrap();
            }
            log.commit(5);
            log.save_term_and_vote(3, Some(2)).unwrap();
            log.compactor().set_minor_index(5);
            log.compactor().set_major_index(4);
            log.compact(Compaction::Minor).unwrap();
        }

        let log = file_storage(dir.path(), 4).open("raft").unwrap();

        assert_eq!(log.load_term_and_vote(), (3, Some(2)));
        assert_eq!(log.compactor().minor_index(), 5);
        assert_eq!(log.compactor().major_index(), 4);
    }

    #[test]
    fn flushed_commit_index_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let log = file_storage(dir.path(), 4).open("raft").unwrap();
            for index in 1..=6 {
                log.append(command(index)).unwrap();
            }
            log.commit(4);
            log.flush().unwrap();
        }

        let log = file_storage(dir.path(), 4).open("raft").unwrap();

        assert_eq!(log.commit_index(), 4);
        assert!(log.truncate(3).is_err());
        log.truncate(4).unwrap();
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn leftover_temp_files_are_removed() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("raft");
        {
            let log = file_storage(dir.path(), 4).open("raft").unwrap();
            log.append(command(1)).unwrap();
        }
        fs::write(log_dir.join("raft-1-2.log.tmp"), b"partial").unwrap();

        let log = file_storage(dir.path(), 4).open("raft").unwrap();

        assert!(!log_dir.join("raft-1-2.log.tmp").exists());
        assert_eq!(log.get(1).unwrap(), Some(command(1)));
    }
}

// =============================================================================
// SECTION 3: COMPACTION SCENARIOS
// =============================================================================

mod compaction {
    use super::*;

    /// 31 entries, 10 per segment, entries 21 to 27 cleaned.
    fn prepared(dir: &Path) -> Log {
        let log = file_storage(dir, 10).open("raft").unwrap();
        for index in 1..=31 {
            assert_eq!(log.append(mixed(index)).unwrap(), index);
        }
        for index in 21..=27 {
            assert!(log.clean(index));
        }
        log.commit(31);
        log.compactor().set_minor_index(31);
        log.compactor().set_major_index(31);
        log
    }

    #[test]
    fn major_compaction_removes_cleaned_entries() {
        let dir = tempdir().unwrap();
        let log = prepared(dir.path());

        log.compact(Compaction::Major).unwrap();

        assert_eq!(log.length(), 31);
        assert_eq!(log.last_index(), 31);
        for index in 21..=27 {
            assert!(!log.contains(index), "index {index} should be compacted");
            assert_eq!(log.get(index).unwrap(), None);
        }
        for index in (1..=20).chain(28..=31) {
            assert_eq!(log.get(index).unwrap(), Some(mixed(index)));
        }
    }

    #[test]
    fn minor_compaction_keeps_tombstones() {
        let dir = tempdir().unwrap();
        let log = prepared(dir.path());

        log.compact(Compaction::Minor).unwrap();

        for index in 21..=27 {
            assert_eq!(log.contains(index), index % 2 == 0, "index {index}");
        }
        assert_eq!(log.length(), 31);

        log.compact(Compaction::Major).unwrap();
        assert!((21..=27).all(|index| !log.contains(index)));
    }

    #[test]
    fn compaction_is_idempotent() {
        let dir = tempdir().unwrap();
        let log = prepared(dir.path());
        log.compact(Compaction::Major).unwrap();
        let files = files_in(log.directory());

        let report = log.compact(Compaction::Major).unwrap();
        let minor = log.compact(Compaction::Minor).unwrap();

        assert!(report.is_noop());
        assert!(minor.is_noop());
        assert_eq!(files_in(log.directory()), files);
        assert_eq!(log.length(), 31);
    }

    #[test]
    fn compacted_log_reloads() {
        let dir = tempdir().unwrap();
        {
            let log = prepared(dir.path());
            log.compact(Compaction::Major).unwrap();
        }

        let log = file_storage(dir.path(), 10).open("raft").unwrap();

        assert_eq!(log.last_index(), 31);
        assert_eq!(log.length(), 31);
        assert!(!log.contains(24));
        assert_eq!(log.get(28).unwrap(), Some(mixed(28)));
        assert_eq!(log.append(command(32)).unwrap(), 32);
    }

    #[test]
    fn stale_segment_version_loses_on_reload() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("raft");
        let saved = {
            let log = prepared(dir.path());
            // segment 3 covers 21..=30
            let saved = fs::read(log_dir.join("raft-3-1.log")).unwrap();
            log.compact(Compaction::Major).unwrap();
            saved
        };
        // crash before the old version was deleted
        fs::write(log_dir.join("raft-3-1.log"), saved).unwrap();

        let log = file_storage(dir.path(), 10).open("raft").unwrap();

        assert!(!log_dir.join("raft-3-1.log").exists());
        assert!(log_dir.join("raft-3-2.log").exists());
        assert!(!log.contains(21));
        assert_eq!(log.get(29).unwrap(), Some(mixed(29)));
    }

    #[test]
    fn uncommitted_entries_are_not_compacted() {
        let dir = tempdir().unwrap();
        let log = memory_log(dir.path(), 10);
        for index in 1..=31 {
            log.append(command(index)).unwrap();
        }
        log.clean(5);
        log.clean(15);
        log.commit(12);
        log.compactor().set_minor_index(31);

        log.compact(Compaction::Minor).unwrap();

        assert!(!log.contains(5));
        assert!(log.contains(15));
    }

    #[test]
    fn reads_during_compaction_see_entry_or_absent() {
        let dir = tempdir().unwrap();
        let log = Arc::new(prepared(dir.path()));

        let reader = {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    for index in 20..=28 {
                        match log.get(index).unwrap() {
                            Some(entry) => assert_eq!(entry, mixed(index)),
                            None => assert!((21..=27).contains(&index)),
                        }
                    }
                }
            })
        };

        log.compact(Compaction::Major).unwrap();
        reader.join().unwrap();
    }
}

// =============================================================================
// SECTION 4: BACKGROUND COMPACTOR
// =============================================================================

mod background {
    use super::*;
    use raft_storage::Compactor;

    #[tokio::test]
    async fn spawned_compactor_runs_on_interval() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(
            StorageConfig::new(dir.path())
                .with_max_entries_per_segment(4)
                .with_minor_compaction_interval(Duration::from_millis(10))
                .with_major_compaction_interval(Duration::from_secs(3600)),
        );
        let log = Arc::new(storage.open("raft").unwrap());
        for index in 1..=9 {
            log.append(command(index)).unwrap();
        }
        log.clean(2);
        log.commit(9);
        log.compactor().set_minor_index(9);

        let handle = Compactor::spawn(Arc::clone(&log));
        let mut compacted = false;
        for _ in 0..200 {
            if !log.contains(2) {
                compacted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.cancel();
        handle.cancel();
        assert!(compacted);
        assert_eq!(log.get(3).unwrap(), Some(command(3)));
    }
}
