//! # error
//!
//! why: one error taxonomy shared by the protocol, the executor and the driver
//! relations: wraps raft-storage errors; ErrorKind travels inside message.rs responses
//! what: RaftError, ErrorKind, crate Result alias

use raft_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, Error)]
pub enum RaftError {
    /// A peer is on a different term. Never retried; the role steps down instead.
    #[error("term mismatch: received {received}, current {current}")]
    TermMismatch { received: u64, current: u64 },

    #[error("network failure talking to member {member}: {reason}")]
    NetworkFailure { member: u64, reason: String },

    /// The follower's log does not contain the leader's previous entry.
    #[error("log mismatch at index {index}")]
    LogMismatch { index: u64 },

    #[error("session {0} expired")]
    SessionExpired(u64),

    #[error("session {0} not found")]
    SessionNotFound(u64),

    #[error("session {session}: expected sequence {expected}, received {received}")]
    SequenceOutOfOrder {
        session: u64,
        expected: u64,
        received: u64,
    },

    /// Another membership change is still uncommitted.
    #[error("configuration change at index {pending} is still in progress")]
    ConfigurationConflict { pending: u64 },

    #[error("not the leader (leader: {leader:?})")]
    NoLeader { leader: Option<u64> },

    #[error("illegal member state: {0}")]
    IllegalMemberState(String),

    /// The user state machine rejected an operation.
    #[error("application error: {0}")]
    Application(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A remote member rejected the request with this kind.
    #[error("request rejected: {0}")]
    Remote(ErrorKind),

    #[error("server is shutting down")]
    Shutdown,
}

/// Error classification carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TermMismatch,
    NetworkFailure,
    LogMismatch,
    SessionExpired,
    SessionNotFound,
    SequenceOutOfOrder,
    CompactionFailure,
    ConfigurationConflict,
    NoLeader,
    IllegalMemberState,
    Application,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TermMismatch => "term mismatch",
            ErrorKind::NetworkFailure => "network failure",
            ErrorKind::LogMismatch => "log mismatch",
            ErrorKind::SessionExpired => "session expired",
            ErrorKind::SessionNotFound => "session not found",
            ErrorKind::SequenceOutOfOrder => "sequence out of order",
            ErrorKind::CompactionFailure => "compaction failure",
            ErrorKind::ConfigurationConflict => "configuration conflict",
            ErrorKind::NoLeader => "no leader",
            ErrorKind::IllegalMemberState => "illegal member state",
            ErrorKind::Application => "application error",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

impl RaftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RaftError::TermMismatch { .. } => ErrorKind::TermMismatch,
            RaftError::NetworkFailure { .. } => ErrorKind::NetworkFailure,
            RaftError::LogMismatch { .. } => ErrorKind::LogMismatch,
            RaftError::SessionExpired(_) => ErrorKind::SessionExpired,
            RaftError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            RaftError::SequenceOutOfOrder { .. } => ErrorKind::SequenceOutOfOrder,
            RaftError::ConfigurationConflict { .. } => ErrorKind::ConfigurationConflict,
            RaftError::NoLeader { .. } => ErrorKind::NoLeader,
            RaftError::IllegalMemberState(_) => ErrorKind::IllegalMemberState,
            RaftError::Application(_) => ErrorKind::Application,
            RaftError::Storage(StorageError::Compaction { .. }) => ErrorKind::CompactionFailure,
            RaftError::Remote(kind) => *kind,
            RaftError::Config(_) | RaftError::Storage(_) | RaftError::Shutdown => ErrorKind::Internal,
        }
    }

    /// Transient failures the caller may retry against the same or another member.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NetworkFailure | ErrorKind::NoLeader | ErrorKind::ConfigurationConflict
        )
    }
}
