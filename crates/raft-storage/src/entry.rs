//! # entry
//!
//! why: define the typed records that make up the replicated log
//! relations: appended by raft-core roles, applied by the executor, rewritten by the compactor
//! what: Entry, EntryKind, Member, MemberType, ConfigurationChange

use serde::{Deserialize, Serialize};

/// Participation level of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberType {
    /// Votes in elections and counts towards the commit quorum.
    Active,
    /// Receives replicated entries but neither votes nor counts for quorum.
    Passive,
    /// Known to the cluster but receives nothing until promoted.
    Reserve,
}

/// A member as recorded in configuration entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub address: String,
    pub member_type: MemberType,
}

impl Member {
    pub fn new(id: u64, address: impl Into<String>, member_type: MemberType) -> Self {
        Self {
            id,
            address: address.into(),
            member_type,
        }
    }

    pub fn active(id: u64, address: impl Into<String>) -> Self {
        Self::new(id, address, MemberType::Active)
    }

    pub fn passive(id: u64, address: impl Into<String>) -> Self {
        Self::new(id, address, MemberType::Passive)
    }
}

/// The membership change a configuration entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationChange {
    /// A new member joins as passive.
    Join(Member),
    /// A member is removed.
    Leave(u64),
    /// A caught-up passive member becomes active.
    Promote(u64),
}

/// Payload of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// Appended by every new leader to commit entries from earlier terms.
    NoOp,
    /// Opens a client session; the session id is the entry index.
    Register { client: String, timeout: u64 },
    /// Refreshes a session and acknowledges delivered results and events.
    KeepAlive {
        session: u64,
        command_sequence: u64,
        event_version: u64,
    },
    /// A state machine command.
    Command {
        session: u64,
        sequence: u64,
        operation: Vec<u8>,
    },
    /// A command that removes state; only major compaction may drop it.
    Tombstone {
        session: u64,
        sequence: u64,
        operation: Vec<u8>,
    },
    /// A read-only operation. Queries are applied without being persisted.
    Query {
        session: u64,
        sequence: u64,
        version: u64,
        operation: Vec<u8>,
    },
    /// Closes a session, either on client request or because it expired.
    Unregister { session: u64, expired: bool },
    /// A cluster membership change and the resulting member list.
    Configuration {
        change: ConfigurationChange,
        members: Vec<Member>,
    },
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// Leader wall clock in milliseconds when the entry was created
    pub timestamp: u64,
    pub kind: EntryKind,
}

impl Entry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, kind: EntryKind) -> Self {
        Self {
            term,
            index,
            timestamp: 0,
            kind,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Tombstones survive minor compaction even when cleaned.
    pub fn is_tombstone(&self) -> bool {
        matches!(
            self.kind,
            EntryKind::Tombstone { .. } | EntryKind::Unregister { .. }
        )
    }

    /// The session this entry belongs to, if any.
    pub fn session(&self) -> Option<u64> {
        match &self.kind {
            EntryKind::KeepAlive { session, .. }
            | EntryKind::Command { session, .. }
            | EntryKind::Tombstone { session, .. }
            | EntryKind::Query { session, .. }
            | EntryKind::Unregister { session, .. } => Some(*session),
            EntryKind::Register { .. } => Some(self.index),
            EntryKind::NoOp | EntryKind::Configuration { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EntryKind::NoOp => "no-op",
            EntryKind::Register { .. } => "register",
            EntryKind::KeepAlive { .. } => "keep-alive",
            EntryKind::Command { .. } => "command",
            EntryKind::Tombstone { .. } => "tombstone",
            EntryKind::Query { .. } => "query",
            EntryKind::Unregister { .. } => "unregister",
            EntryKind::Configuration { .. } => "configuration",
        }
    }
}
