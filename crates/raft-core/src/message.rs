//! # message
//!
//! why: define all rpc message types exchanged between members and clients
//! relations: produced and consumed by node.rs, carried by transport.rs, answered by server.rs
//! what: vote/append/join/leave protocol messages, client session messages, Request/Response envelopes

use crate::error::{ErrorKind, RaftError};
use raft_storage::{Entry, Member};
use serde::{Deserialize, Serialize};

/// Outcome marker carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
}

// -- member protocol --

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    /// entries after `prev_log_index`; compacted indices are simply missing
    pub entries: Vec<Entry>,
    pub commit_index: u64,
}

impl AppendRequest {
    /// Index of the last slot covered by this request.
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.index)
            .unwrap_or(self.prev_log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// the responder's last log index, used by the leader to back off
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member: Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub member: u64,
}

/// Answer to join and leave requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub leader: Option<u64>,
    pub term: u64,
    /// index of the configuration the members belong to
    pub version: u64,
    pub members: Vec<Member>,
}

impl ConfigurationResponse {
    pub fn ok(term: u64, leader: Option<u64>, version: u64, members: Vec<Member>) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            leader,
            term,
            version,
            members,
        }
    }

    pub fn error(term: u64, leader: Option<u64>, error: &RaftError) -> Self {
        Self {
            status: Status::Error,
            error: Some(error.kind()),
            leader,
            term,
            version: 0,
            members: Vec::new(),
        }
    }
}

// -- client protocol --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client: String,
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub leader: Option<u64>,
    pub session: u64,
    pub timeout: u64,
    pub members: Vec<Member>,
}

impl RegisterResponse {
    pub fn ok(leader: Option<u64>, session: u64, timeout: u64, members: Vec<Member>) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            leader,
            session,
            timeout,
            members,
        }
    }

    pub fn error(leader: Option<u64>, error: &RaftError) -> Self {
        Self {
            status: Status::Error,
            error: Some(error.kind()),
            leader,
            session: 0,
            timeout: 0,
            members: Vec::new(),
        }
    }

    /// The new session id, or the rejection.
    pub fn into_result(self) -> crate::Result<u64> {
        match (self.status, self.error) {
            (Status::Ok, _) => Ok(self.session),
            (Status::Error, Some(ErrorKind::NoLeader)) => Err(RaftError::NoLeader { leader: self.leader }),
            (Status::Error, kind) => Err(RaftError::Remote(kind.unwrap_or(ErrorKind::Internal))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session: u64,
    pub command_sequence: u64,
    pub event_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session: u64,
    pub sequence: u64,
    pub operation: Vec<u8>,
    /// the command deletes state; its entry is kept until major compaction
    #[serde(default)]
    pub tombstone: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session: u64,
    pub sequence: u64,
    /// the highest index the client has already observed
    pub version: u64,
    pub operation: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session: u64,
}

/// Answer to keep-alive, command, query and unregister requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub leader: Option<u64>,
    /// index the result was produced at
    pub index: u64,
    pub result: Vec<u8>,
}

impl OperationResponse {
    pub fn ok(index: u64, result: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            leader: None,
            index,
            result,
        }
    }

    pub fn error(leader: Option<u64>, error: &RaftError) -> Self {
        Self {
            status: Status::Error,
            error: Some(error.kind()),
            leader,
            index: 0,
            result: Vec::new(),
        }
    }

    pub fn into_result(self) -> crate::Result<(u64, Vec<u8>)> {
        match (self.status, self.error) {
            (Status::Ok, _) => Ok((self.index, self.result)),
            (Status::Error, Some(ErrorKind::NoLeader)) => Err(RaftError::NoLeader { leader: self.leader }),
            (Status::Error, kind) => Err(RaftError::Remote(kind.unwrap_or(ErrorKind::Internal))),
        }
    }
}

/// An event published by the state machine to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Vec<u8>,
}

/// Events published at one index, pushed to the owning session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub session: u64,
    pub event_version: u64,
    /// version of the previous batch for this session, for gap detection
    pub previous_version: u64,
    pub events: Vec<Event>,
}

// -- envelopes --

/// Everything a member can send to another member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Vote(VoteRequest),
    Append(AppendRequest),
    Join(JoinRequest),
    Leave(LeaveRequest),
    Register(RegisterRequest),
    KeepAlive(KeepAliveRequest),
    Command(CommandRequest),
    Query(QueryRequest),
    Unregister(UnregisterRequest),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Vote(_) => "vote",
            Request::Append(_) => "append",
            Request::Join(_) => "join",
            Request::Leave(_) => "leave",
            Request::Register(_) => "register",
            Request::KeepAlive(_) => "keep-alive",
            Request::Command(_) => "command",
            Request::Query(_) => "query",
            Request::Unregister(_) => "unregister",
        }
    }

    /// Whether a client issued this request, as opposed to another member.
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            Request::Register(_)
                | Request::KeepAlive(_)
                | Request::Command(_)
                | Request::Query(_)
                | Request::Unregister(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Vote(VoteResponse),
    Append(AppendResponse),
    Configuration(ConfigurationResponse),
    Register(RegisterResponse),
    Operation(OperationResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_storage::EntryKind;

    #[test]
    fn heartbeat_last_index_is_prev_index() {
        let heartbeat = AppendRequest {
            term: 2,
            leader: 1,
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![],
            commit_index: 7,
        };
        assert_eq!(heartbeat.last_index(), 7);

        let append = AppendRequest {
            entries: vec![Entry::new(2, 8, EntryKind::NoOp), Entry::new(2, 10, EntryKind::NoOp)],
            ..heartbeat
        };
        assert_eq!(append.last_index(), 10);
    }

    #[test]
    fn error_response_converts_back_to_error() {
        let response = OperationResponse::error(Some(3), &RaftError::NoLeader { leader: Some(3) });
        assert!(matches!(response.into_result(), Err(RaftError::NoLeader { leader: Some(3) })));

        let response = OperationResponse::error(None, &RaftError::SessionExpired(4));
        assert!(matches!(
            response.into_result(),
            Err(RaftError::Remote(ErrorKind::SessionExpired))
        ));
    }
}
