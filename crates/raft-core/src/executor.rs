//! # executor
//!
//! why: apply committed entries deterministically, exactly once per session sequence
//! relations: fed by node.rs through server.rs, drives state_machine.rs, owns session.rs, cleans raft-storage entries
//! what: Executor, Applied, Output
//!
//! entries are applied strictly in index order on a single task. every entry
//! carries the leader's timestamp, which is the only clock the executor reads,
//! so session timeouts resolve identically on every member.
//!
//! an entry is cleaned as soon as replaying it could not change the outcome:
//!
//! ```text
//! no-op, rejected operations, unregister ... right after being applied
//! keep-alive ............................... when the next keep-alive arrives
//! register + last keep-alive ............... when the session is closed
//! command .................................. when the state machine says so
//! configuration ............................ when a newer one is applied
//! ```

use crate::error::{RaftError, Result};
use crate::message::{Event, PublishRequest, QueryRequest};
use crate::session::SessionManager;
use crate::state_machine::{Commit, StateMachine};
use raft_storage::{Entry, EntryKind, Log};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What applying an entry produced for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    None,
    /// a session was registered with this id
    Session(u64),
    Value(Vec<u8>),
}

/// Result of one applied entry.
#[derive(Debug)]
pub struct Applied {
    pub index: u64,
    pub term: u64,
    pub result: Result<Output>,
}

#[derive(Debug)]
struct PendingQuery {
    ticket: u64,
    index: u64,
    request: QueryRequest,
}

pub type QueryResult = Result<(u64, Vec<u8>)>;

pub struct Executor {
    log: Arc<Log>,
    state_machine: Box<dyn StateMachine>,
    sessions: SessionManager,
    last_applied: u64,
    configuration_index: u64,
    timestamp: u64,
    queries: Vec<PendingQuery>,
    ready: Vec<(u64, QueryResult)>,
    published: Vec<PublishRequest>,
    suspects: BTreeSet<u64>,
}

impl Executor {
    pub fn new(log: Arc<Log>, state_machine: Box<dyn StateMachine>) -> Self {
        Self {
            log,
            state_machine,
            sessions: SessionManager::new(),
            last_applied: 0,
            configuration_index: 0,
            timestamp: 0,
            queries: Vec::new(),
            ready: Vec::new(),
            published: Vec::new(),
            suspects: BTreeSet::new(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Highest index below which no session still waits for an event
    /// acknowledgement. Entries up to here may be major compacted.
    pub fn last_completed(&self) -> u64 {
        self.sessions
            .iter()
            .filter_map(|session| session.first_unacked_event())
            .map(|version| version - 1)
            .min()
            .unwrap_or(self.last_applied)
            .min(self.last_applied)
    }

    /// Applies the next committed entry.
    pub fn apply(&mut self, entry: Entry) -> Result<Applied> {
        if entry.index <= self.last_applied {
            return Err(RaftError::IllegalMemberState(format!(
                "entry {} already applied (last applied {})",
                entry.index, self.last_applied
            )));
        }

        let index = entry.index;
        let term = entry.term;
        let timestamp = entry.timestamp;
        self.timestamp = self.timestamp.max(timestamp);

        tracing::trace!(index, kind = entry.kind_name(), "applying entry");

        let result = match entry.kind {
            EntryKind::NoOp => {
                self.sessions.reset_timestamps(timestamp);
                self.log.clean(index);
                Ok(Output::None)
            }
            EntryKind::Register { client, timeout } => {
                let session = self.sessions.register(index, client, timeout, timestamp);
                tracing::debug!(session = index, timeout, "registered session");
                self.state_machine.register(session);
                Ok(Output::Session(index))
            }
            EntryKind::KeepAlive {
                session,
                command_sequence,
                event_version,
            } => self.keep_alive(index, timestamp, session, command_sequence, event_version),
            EntryKind::Command {
                session,
                sequence,
                operation,
            } => self.command(index, term, timestamp, session, sequence, &operation, false),
            EntryKind::Tombstone {
                session,
                sequence,
                operation,
            } => self.command(index, term, timestamp, session, sequence, &operation, true),
            EntryKind::Unregister { session, expired } => self.unregister(index, session, expired),
            EntryKind::Configuration { .. } => {
                if self.configuration_index > 0 {
                    self.log.clean(self.configuration_index);
                }
                self.configuration_index = index;
                Ok(Output::None)
            }
            EntryKind::Query { .. } => Err(RaftError::IllegalMemberState(format!(
                "query entry {index} found in the log"
            ))),
        };

        self.last_applied = index;
        self.check_sessions();
        self.run_queries();

        Ok(Applied { index, term, result })
    }

    /// Moves `last_applied` over committed indices that had no entry left.
    pub fn advance(&mut self, commit_index: u64) {
        if commit_index > self.last_applied {
            self.last_applied = commit_index;
            self.run_queries();
        }
    }

    fn keep_alive(
        &mut self,
        index: u64,
        timestamp: u64,
        id: u64,
        command_sequence: u64,
        event_version: u64,
    ) -> Result<Output> {
        let Some(session) = self.sessions.get_mut(id) else {
            self.log.clean(index);
            return Err(self.sessions.missing(id));
        };

        session.trust(timestamp);
        session.ack(command_sequence, event_version);
        if let Some(previous) = session.keep_alive_index.replace(index) {
            self.log.clean(previous);
        }
        self.suspects.remove(&id);
        Ok(Output::None)
    }

    #[allow(clippy::too_many_arguments)]
    fn command(
        &mut self,
        index: u64,
        term: u64,
        timestamp: u64,
        id: u64,
        sequence: u64,
        operation: &[u8],
        tombstone: bool,
    ) -> Result<Output> {
        let Some(session) = self.sessions.get_mut(id) else {
            self.log.clean(index);
            return Err(self.sessions.missing(id));
        };

        let expected = session.sequence() + 1;
        if sequence != expected {
            self.log.clean(index);
            return Err(RaftError::SequenceOutOfOrder {
                session: id,
                expected,
                received: sequence,
            });
        }

        session.trust(timestamp);
        session.applied(sequence, index);
        self.suspects.remove(&id);

        let mut commit = Commit::new(index, term, timestamp, id, operation);
        if tombstone {
            commit = commit.tombstone();
        }
        let result = self.state_machine.apply(&commit);

        if commit.is_clean() {
            self.log.clean(index);
        }
        let events = commit.take_events();
        if !events.is_empty() {
            self.publish(id, index, events);
        }

        result.map(Output::Value)
    }

    fn publish(&mut self, id: u64, version: u64, events: Vec<Event>) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let previous_version = session.publish(version, events.clone());
        self.published.push(PublishRequest {
            session: id,
            event_version: version,
            previous_version,
            events,
        });
    }

    fn unregister(&mut self, index: u64, id: u64, expired: bool) -> Result<Output> {
        self.log.clean(index);

        let Some(session) = self.sessions.get(id) else {
            return Err(self.sessions.missing(id));
        };

        self.log.clean(session.id());
        if let Some(keep_alive) = session.keep_alive_index {
            self.log.clean(keep_alive);
        }
        self.suspects.remove(&id);

        if expired {
            tracing::debug!(session = id, "expiring session");
            self.state_machine.expire(id);
        } else {
            tracing::debug!(session = id, "unregistering session");
        }
        self.state_machine.close(id);

        // only an expired id is remembered, for the error later requests get
        if expired {
            self.sessions.expire(id);
        } else {
            self.sessions.remove(id);
        }
        Ok(Output::None)
    }

    fn check_sessions(&mut self) {
        for id in self.sessions.suspect_timed_out(self.timestamp) {
            tracing::debug!(session = id, timestamp = self.timestamp, "session suspected");
            self.suspects.insert(id);
        }
    }

    /// Runs `request` once `index` has been applied and the session has
    /// applied the query's sequence. Returns the result if it ran right away.
    pub fn query(&mut self, ticket: u64, index: u64, request: QueryRequest) -> Option<QueryResult> {
        let pending = PendingQuery { ticket, index, request };
        match self.try_query(&pending) {
            Some(result) => Some(result),
            None => {
                self.queries.push(pending);
                None
            }
        }
    }

    fn try_query(&self, pending: &PendingQuery) -> Option<QueryResult> {
        let id = pending.request.session;
        let Some(session) = self.sessions.get(id) else {
            return Some(Err(self.sessions.missing(id)));
        };
        if self.last_applied < pending.index || session.sequence() < pending.request.sequence {
            return None;
        }

        let commit = Commit::new(self.last_applied, 0, self.timestamp, id, &pending.request.operation);
        Some(
            self.state_machine
                .query(&commit)
                .map(|result| (self.last_applied, result)),
        )
    }

    fn run_queries(&mut self) {
        if self.queries.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.queries);
        for query in pending {
            match self.try_query(&query) {
                Some(result) => self.ready.push((query.ticket, result)),
                None => self.queries.push(query),
            }
        }
    }

    /// Queries that became answerable since the last call.
    pub fn take_ready_queries(&mut self) -> Vec<(u64, QueryResult)> {
        std::mem::take(&mut self.ready)
    }

    /// Event batches published since the last call.
    pub fn take_published(&mut self) -> Vec<PublishRequest> {
        std::mem::take(&mut self.published)
    }

    /// Sessions that timed out since the last call.
    pub fn take_suspects(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.suspects).into_iter().collect()
    }

    /// Fails every waiting query, used when the server shuts down.
    pub fn cancel_queries(&mut self) -> Vec<(u64, QueryResult)> {
        self.queries
            .drain(..)
            .map(|query| (query.ticket, Err(RaftError::Shutdown)))
            .collect()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("last_applied", &self.last_applied)
            .field("sessions", &self.sessions.len())
            .field("pending_queries", &self.queries.len())
            .finish_non_exhaustive()
    }
}
