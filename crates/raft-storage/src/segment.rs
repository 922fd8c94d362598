//! # segment
//!
//! why: bound the unit of on-disk storage so appends stay cheap and compaction stays local
//! relations: owned by log.rs, rewritten by compactor.rs
//! what: SegmentDescriptor, Segment (append/read/truncate/seal), versioned rewrites
//!
//! a segment is a newline-delimited json file. the first line is the
//! descriptor, every further line is one entry in strictly increasing index
//! order. once a segment is sealed an offset index is written next to it:
//!
//! ```text
//! <dir>/
//! ├── meta.json
//! ├── raft-1-1.log     # descriptor + entries 1..=1024 (sealed)
//! ├── raft-1-1.index   # offsets and index range of the sealed segment
//! └── raft-2-1.log     # entries 1025.. (tail, accepts appends)
//! ```
//!
//! compaction never edits a file in place. it writes `<name>-<id>-<version+1>`
//! and the log swaps it in; the highest version of an id wins on reload.

use crate::entry::Entry;
use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Identity and placement of a segment, stored as the first line of its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub id: u64,
    pub version: u64,
    pub first_index: u64,
    pub max_entries: u64,
}

/// Location of one entry inside a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Position {
    pub offset: u64,
    pub length: u64,
    pub term: u64,
    pub tombstone: bool,
}

/// Contents of the `.index` file written when a segment is sealed.
#[derive(Debug, Serialize, Deserialize)]
struct OffsetIndex {
    range: u64,
    positions: Vec<(u64, Position)>,
}

pub(crate) fn file_name(name: &str, id: u64, version: u64) -> String {
    format!("{name}-{id}-{version}.log")
}

fn index_name(name: &str, id: u64, version: u64) -> String {
    format!("{name}-{id}-{version}.index")
}

/// Parses `<name>-<id>-<version>.log` into `(id, version)`.
pub(crate) fn parse_file_name(name: &str, file: &str) -> Option<(u64, u64)> {
    let rest = file.strip_prefix(name)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".log")?;
    let (id, version) = rest.split_once('-')?;
    Some((id.parse().ok()?, version.parse().ok()?))
}

pub(crate) fn index_path_for(log_path: &Path) -> PathBuf {
    log_path.with_extension("index")
}

/// A bounded run of log entries backed by one file.
#[derive(Debug)]
pub(crate) struct Segment {
    descriptor: SegmentDescriptor,
    path: PathBuf,
    /// number of index slots covered, including compacted and skipped ones
    range: u64,
    positions: BTreeMap<u64, Position>,
    cleaned: BTreeSet<u64>,
    /// byte length of the descriptor line
    header: u64,
    size: u64,
    /// present while this is the tail segment
    writer: Option<File>,
}

impl Segment {
    /// Creates an empty, writable segment.
    pub fn create(dir: &Path, name: &str, descriptor: SegmentDescriptor) -> Result<Self> {
        let path = dir.join(file_name(name, descriptor.id, descriptor.version));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut header = serde_json::to_vec(&descriptor)?;
        header.push(b'\n');
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Self {
            descriptor,
            path,
            range: 0,
            positions: BTreeMap::new(),
            cleaned: BTreeSet::new(),
            header: header.len() as u64,
            size: header.len() as u64,
            writer: Some(file),
        })
    }

    /// Opens an existing segment file. Sealed segments load their offsets from
    /// the `.index` file, everything else is rebuilt by scanning.
    pub fn open(path: &Path) -> Result<Self> {
        let index_path = index_path_for(path);
        if index_path.exists() {
            match Self::open_sealed(path, &index_path) {
                Ok(segment) => return Ok(segment),
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "offset index unusable, rescanning segment",
                    );
                    let _ = fs::remove_file(&index_path);
                }
            }
        }
        Self::scan(path)
    }

    fn open_sealed(path: &Path, index_path: &Path) -> Result<Self> {
        let (descriptor, header) = Self::read_header(path)?;
        let index: OffsetIndex = serde_json::from_reader(BufReader::new(File::open(index_path)?))?;
        let size = fs::metadata(path)?.len();

        let end = index
            .positions
            .last()
            .map(|(_, position)| position.offset + position.length + 1)
            .unwrap_or(header);
        if end > size {
            return Err(StorageError::corrupted(path, "offset index points past end of file"));
        }

        Ok(Self {
            descriptor,
            path: path.to_path_buf(),
            range: index.range,
            positions: index.positions.into_iter().collect(),
            cleaned: BTreeSet::new(),
            header,
            size,
            writer: None,
        })
    }

    fn read_header(path: &Path) -> Result<(SegmentDescriptor, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 || !line.ends_with('\n') {
            return Err(StorageError::corrupted(path, "missing segment descriptor"));
        }
        let descriptor = serde_json::from_str(line.trim_end())?;
        Ok((descriptor, read as u64))
    }

    /// Rebuilds positions from the file contents. A torn final line left by a
    /// crash mid-append is cut off.
    fn scan(path: &Path) -> Result<Self> {
        let (descriptor, header) = Self::read_header(path)?;
        let mut reader = BufReader::new(File::open(path)?);
        reader.seek(SeekFrom::Start(header))?;

        let mut positions = BTreeMap::new();
        let mut offset = header;
        let mut last_index = None;
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line)? as u64;
            if read == 0 {
                break;
            }

            let decoded = line
                .ends_with('\n')
                .then(|| serde_json::from_str::<Entry>(line.trim_end()).ok())
                .flatten();
            let Some(entry) = decoded else {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    "dropping torn entry at end of segment",
                );
                OpenOptions::new().write(true).open(path)?.set_len(offset)?;
                break;
            };

            if entry.index < descriptor.first_index || last_index.is_some_and(|last| entry.index <= last) {
                return Err(StorageError::corrupted(
                    path,
                    format!("entry {} out of order", entry.index),
                ));
            }

            positions.insert(entry.index, Position {
                offset,
                length: read - 1,
                term: entry.term,
                tombstone: entry.is_tombstone(),
            });
            last_index = Some(entry.index);
            offset += read;
        }

        let range = last_index
            .map(|last| last - descriptor.first_index + 1)
            .unwrap_or(0);

        let mut writer = OpenOptions::new().write(true).open(path)?;
        writer.seek(SeekFrom::End(0))?;

        Ok(Self {
            descriptor,
            path: path.to_path_buf(),
            range,
            positions,
            cleaned: BTreeSet::new(),
            header,
            size: offset,
            writer: Some(writer),
        })
    }

    pub fn descriptor(&self) -> SegmentDescriptor {
        self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_index(&self) -> u64 {
        self.descriptor.first_index
    }

    pub fn next_index(&self) -> u64 {
        self.descriptor.first_index + self.range
    }

    pub fn last_index(&self) -> u64 {
        self.next_index() - 1
    }

    pub fn range(&self) -> u64 {
        self.range
    }

    pub fn set_range(&mut self, range: u64) {
        self.range = range;
    }

    pub fn is_full(&self) -> bool {
        self.range >= self.descriptor.max_entries
    }

    pub fn is_sealed(&self) -> bool {
        self.writer.is_none()
    }

    pub fn live_entries(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &BTreeMap<u64, Position> {
        &self.positions
    }

    pub fn cleaned(&self) -> &BTreeSet<u64> {
        &self.cleaned
    }

    pub fn contains(&self, index: u64) -> bool {
        self.positions.contains_key(&index)
    }

    pub fn term(&self, index: u64) -> Option<u64> {
        self.positions.get(&index).map(|position| position.term)
    }

    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        let next = self.next_index();
        if entry.index != next {
            return Err(StorageError::OutOfOrder {
                index: entry.index,
                next,
            });
        }

        let Some(writer) = self.writer.as_mut() else {
            return Err(StorageError::corrupted(&self.path, "append to sealed segment"));
        };

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        writer.write_all(&line)?;

        self.positions.insert(entry.index, Position {
            offset: self.size,
            length: line.len() as u64 - 1,
            term: entry.term,
            tombstone: entry.is_tombstone(),
        });
        self.size += line.len() as u64;
        self.range += 1;
        Ok(())
    }

    /// Advances the tail over `count` indices that have no entry.
    pub fn skip(&mut self, count: u64) {
        self.range += count;
    }

    pub fn get(&self, index: u64) -> Result<Option<Entry>> {
        let Some(position) = self.positions.get(&index) else {
            return Ok(None);
        };

        let bytes = read_at(&self.path, position)?;
        let entry: Entry = serde_json::from_slice(&bytes)?;
        if entry.index != index {
            return Err(StorageError::corrupted(
                &self.path,
                format!("expected entry {index}, found {}", entry.index),
            ));
        }
        Ok(Some(entry))
    }

    pub fn clean(&mut self, index: u64) -> bool {
        self.positions.contains_key(&index) && self.cleaned.insert(index)
    }

    pub fn is_clean(&self, index: u64) -> bool {
        self.cleaned.contains(&index)
    }

    /// Drops every entry after `index`. A sealed segment becomes writable again.
    pub fn truncate(&mut self, index: u64) -> Result<()> {
        let cut = self
            .positions
            .range(index.saturating_add(1)..)
            .next()
            .map(|(_, position)| position.offset)
            .unwrap_or(self.size);

        self.positions.retain(|&i, _| i <= index);
        self.cleaned.retain(|&i| i <= index);
        self.range = (index + 1).saturating_sub(self.descriptor.first_index).min(self.range);

        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let _ = fs::remove_file(index_path_for(&self.path));
                OpenOptions::new().write(true).open(&self.path)?
            }
        };
        writer.set_len(cut)?;
        writer.seek(SeekFrom::End(0))?;
        self.size = cut;
        self.writer = Some(writer);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.sync_data()?;
        }
        Ok(())
    }

    /// Makes the segment read-only and writes its offset index.
    pub fn seal(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.sync_all()?;
        }
        write_index(&self.path, self.range, &self.positions)
    }

    pub fn delete(&self) {
        for path in [self.path.clone(), index_path_for(&self.path)] {
            if let Err(error) = fs::remove_file(&path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %error, "failed to delete segment file");
                }
            }
        }
    }

    pub fn snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot {
            descriptor: self.descriptor,
            path: self.path.clone(),
            range: self.range,
            positions: self.positions.clone(),
            cleaned: self.cleaned.clone(),
        }
    }

    /// Carries cleaned marks recorded after a snapshot over to a rewrite.
    pub fn merge_cleaned(&mut self, cleaned: impl IntoIterator<Item = u64>) {
        for index in cleaned {
            self.clean(index);
        }
    }
}

/// Immutable view of a sealed segment taken under the log's read lock.
#[derive(Debug, Clone)]
pub(crate) struct SegmentSnapshot {
    pub descriptor: SegmentDescriptor,
    pub path: PathBuf,
    pub range: u64,
    pub positions: BTreeMap<u64, Position>,
    pub cleaned: BTreeSet<u64>,
}

/// Writes the kept entries of `sources` into one new sealed segment that
/// takes over the first source's id with a higher version.
pub(crate) fn rewrite(
    dir: &Path,
    name: &str,
    sources: &[SegmentSnapshot],
    keep: impl Fn(u64, &Position, bool) -> bool,
) -> Result<Segment> {
    let Some(first) = sources.first() else {
        return Err(StorageError::Compaction {
            segment: 0,
            reason: "nothing to rewrite".into(),
        });
    };

    let descriptor = SegmentDescriptor {
        id: first.descriptor.id,
        version: sources.iter().map(|s| s.descriptor.version).max().unwrap_or(0) + 1,
        first_index: first.descriptor.first_index,
        max_entries: first.descriptor.max_entries,
    };
    let range = sources.iter().map(|s| s.range).sum();

    let path = dir.join(file_name(name, descriptor.id, descriptor.version));
    let temp_path = path.with_extension("log.tmp");

    let written = write_rewrite(&temp_path, &descriptor, sources, &keep);
    let (positions, cleaned, size, header) = match written {
        Ok(written) => written,
        Err(error) => {
            let _ = fs::remove_file(&temp_path);
            return Err(error);
        }
    };

    // the index lands first so a crash never leaves a new log without its range
    let finish = write_index(&path, range, &positions).and_then(|_| Ok(fs::rename(&temp_path, &path)?));
    if let Err(error) = finish {
        let _ = fs::remove_file(&temp_path);
        let _ = fs::remove_file(index_path_for(&path));
        return Err(error);
    }

    Ok(Segment {
        descriptor,
        path,
        range,
        positions,
        cleaned,
        header,
        size,
        writer: None,
    })
}

type Rewritten = (BTreeMap<u64, Position>, BTreeSet<u64>, u64, u64);

fn write_rewrite(
    temp_path: &Path,
    descriptor: &SegmentDescriptor,
    sources: &[SegmentSnapshot],
    keep: &impl Fn(u64, &Position, bool) -> bool,
) -> Result<Rewritten> {
    let mut writer = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp_path)?,
    );

    let mut header = serde_json::to_vec(descriptor)?;
    header.push(b'\n');
    writer.write_all(&header)?;

    let mut offset = header.len() as u64;
    let mut positions = BTreeMap::new();
    let mut cleaned = BTreeSet::new();

    for source in sources {
        let mut reader = File::open(&source.path)?;
        for (&index, position) in &source.positions {
            let is_clean = source.cleaned.contains(&index);
            if !keep(index, position, is_clean) {
                continue;
            }

            let mut bytes = vec![0; position.length as usize];
            reader.seek(SeekFrom::Start(position.offset))?;
            reader.read_exact(&mut bytes)?;
            writer.write_all(&bytes)?;
            writer.write_all(b"\n")?;

            positions.insert(index, Position { offset, ..*position });
            if is_clean {
                cleaned.insert(index);
            }
            offset += position.length + 1;
        }
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok((positions, cleaned, offset, header.len() as u64))
}

fn write_index(log_path: &Path, range: u64, positions: &BTreeMap<u64, Position>) -> Result<()> {
    let index = OffsetIndex {
        range,
        positions: positions.iter().map(|(&i, &p)| (i, p)).collect(),
    };
    let path = index_path_for(log_path);
    let temp_path = path.with_extension("index.tmp");

    let mut writer = BufWriter::new(File::create(&temp_path)?);
    serde_json::to_writer(&mut writer, &index)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&temp_path, &path)?;
    Ok(())
}

fn read_at(path: &Path, position: &Position) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(position.offset))?;
    let mut bytes = vec![0; position.length as usize];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use tempfile::tempdir;

    fn descriptor(id: u64, first_index: u64) -> SegmentDescriptor {
        SegmentDescriptor {
            id,
            version: 1,
            first_index,
            max_entries: 4,
        }
    }

    fn command(index: u64) -> Entry {
        Entry::new(1, index, EntryKind::Command {
            session: 1,
            sequence: index,
            operation: index.to_be_bytes().to_vec(),
        })
    }

    #[test]
    fn parses_segment_file_names() {
        assert_eq!(parse_file_name("raft", "raft-3-2.log"), Some((3, 2)));
        assert_eq!(parse_file_name("my-log", "my-log-12-1.log"), Some((12, 1)));
        assert_eq!(parse_file_name("raft", "raft-3-2.index"), None);
        assert_eq!(parse_file_name("raft", "other-3-2.log"), None);
    }

    #[test]
    fn appended_entries_are_readable() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), "raft", descriptor(1, 1)).unwrap();

        for index in 1..=3 {
            segment.append(&command(index)).unwrap();
        }

        assert_eq!(segment.range(), 3);
        assert_eq!(segment.get(2).unwrap(), Some(command(2)));
        assert_eq!(segment.term(3), Some(1));
        assert!(!segment.is_full());
    }

    #[test]
    fn rejects_out_of_order_append() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), "raft", descriptor(1, 1)).unwrap();

        let error = segment.append(&command(2)).unwrap_err();
        assert!(matches!(error, StorageError::OutOfOrder { index: 2, next: 1 }));
    }

    #[test]
    fn sealed_segment_reopens_from_offset_index() {
        let dir = tempdir().unwrap();
        let path = {
            let mut segment = Segment::create(dir.path(), "raft", descriptor(1, 1)).unwrap();
            for index in 1..=4 {
                segment.append(&command(index)).unwrap();
            }
            segment.seal().unwrap();
            segment.path().to_path_buf()
        };

        assert!(index_path_for(&path).exists());
        let reopened = Segment::open(&path).unwrap();
        assert!(reopened.is_sealed());
        assert_eq!(reopened.range(), 4);
        assert_eq!(reopened.get(4).unwrap(), Some(command(4)));
    }

    #[test]
    fn torn_tail_entry_is_dropped_on_scan() {
        let dir = tempdir().unwrap();
        let path = {
            let mut segment = Segment::create(dir.path(), "raft", descriptor(1, 1)).unwrap();
            segment.append(&command(1)).unwrap();
            segment.append(&command(2)).unwrap();
            segment.path().to_path_buf()
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"term\":1,\"ind").unwrap();

        let reopened = Segment::open(&path).unwrap();
        assert_eq!(reopened.range(), 2);
        assert_eq!(reopened.live_entries(), 2);
    }

    #[test]
    fn truncate_drops_suffix_and_unseals() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), "raft", descriptor(1, 1)).unwrap();
        for index in 1..=4 {
            segment.append(&command(index)).unwrap();
        }
        segment.seal().unwrap();

        segment.truncate(2).unwrap();

        assert!(!segment.is_sealed());
        assert_eq!(segment.next_index(), 3);
        assert!(!segment.contains(3));
        segment.append(&command(3)).unwrap();
        assert_eq!(segment.get(3).unwrap(), Some(command(3)));
    }

    #[test]
    fn rewrite_keeps_selected_entries_and_range() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), "raft", descriptor(1, 1)).unwrap();
        for index in 1..=4 {
            segment.append(&command(index)).unwrap();
        }
        segment.seal().unwrap();
        segment.clean(2);
        segment.clean(3);

        let rewritten = rewrite(dir.path(), "raft", &[segment.snapshot()], |_, _, clean| !clean).unwrap();

        assert_eq!(rewritten.descriptor().version, 2);
        assert_eq!(rewritten.range(), 4);
        assert!(rewritten.contains(1));
        assert!(!rewritten.contains(2));
        assert!(!rewritten.contains(3));
        assert_eq!(rewritten.get(4).unwrap(), Some(command(4)));
    }
}
