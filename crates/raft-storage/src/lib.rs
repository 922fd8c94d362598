//! # raft-storage
//!
//! why: provide the durable, compactable log that raft replicates
//! relations: leaf crate; used by raft-core for the log, term/vote and compaction watermarks
//! what: Entry types, segmented Log, Compactor, MetaStorage, Storage builder
//!
//! ```text
//! Storage ── open(name) ──> Log ──> [Segment, Segment, ..., tail Segment]
//!                            │
//!                            ├── MetaStorage (term, vote, watermarks)
//!                            └── Compactor (minor / major passes)
//! ```

pub mod compactor;
pub mod entry;
pub mod error;
pub mod log;
pub mod meta;
mod segment;
pub mod storage;

pub use compactor::{Compaction, CompactionReport, Compactor, CompactorHandle};
pub use entry::{ConfigurationChange, Entry, EntryKind, Member, MemberType};
pub use error::{Result, StorageError};
pub use log::Log;
pub use meta::{FileMetaStorage, InMemoryMetaStorage, MetaStorage, Watermarks};
pub use segment::SegmentDescriptor;
pub use storage::{Storage, StorageConfig};
