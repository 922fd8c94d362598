//! # session
//!
//! why: give clients exactly-once commands and ordered events across retries
//! relations: owned by executor.rs, handed to state_machine.rs callbacks
//! what: Session, SessionState, SessionManager

use crate::error::RaftError;
use crate::message::Event;
use std::collections::{BTreeMap, BTreeSet};

/// expired ids remembered so late requests learn why their session is gone
const EXPIRED_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// timed out; the leader will expire it unless a keep-alive arrives first
    Suspect,
    Expired,
}

/// A registered client session. The id is the index of its register entry.
#[derive(Debug, Clone)]
pub struct Session {
    id: u64,
    client: String,
    timeout: u64,
    last_timestamp: u64,
    /// highest command sequence applied
    last_sequence: u64,
    /// highest command sequence the client has seen a response for
    command_ack: u64,
    /// index of the last command applied for this session
    last_version: u64,
    state: SessionState,
    /// unacknowledged event batches keyed by the index that published them
    events: BTreeMap<u64, Vec<Event>>,
    last_event_version: u64,
    pub(crate) keep_alive_index: Option<u64>,
}

impl Session {
    fn new(id: u64, client: String, timeout: u64, timestamp: u64) -> Self {
        Self {
            id,
            client,
            timeout,
            last_timestamp: timestamp,
            last_sequence: 0,
            command_ack: 0,
            last_version: id,
            state: SessionState::Open,
            events: BTreeMap::new(),
            last_event_version: 0,
            keep_alive_index: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn timestamp(&self) -> u64 {
        self.last_timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn command_ack(&self) -> u64 {
        self.command_ack
    }

    pub fn version(&self) -> u64 {
        self.last_version
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn is_suspect(&self) -> bool {
        self.state == SessionState::Suspect
    }

    pub fn is_expired(&self) -> bool {
        self.state == SessionState::Expired
    }

    pub fn last_event_version(&self) -> u64 {
        self.last_event_version
    }

    pub fn pending_events(&self) -> impl Iterator<Item = (u64, &[Event])> {
        self.events.iter().map(|(&version, events)| (version, events.as_slice()))
    }

    /// Lowest event version the client has not acknowledged yet.
    pub fn first_unacked_event(&self) -> Option<u64> {
        self.events.keys().next().copied()
    }

    /// Refreshes the session with a timestamp from the log. A suspect session
    /// becomes open again.
    pub(crate) fn trust(&mut self, timestamp: u64) {
        self.last_timestamp = self.last_timestamp.max(timestamp);
        if self.state == SessionState::Suspect {
            self.state = SessionState::Open;
        }
    }

    pub(crate) fn is_timed_out(&self, now: u64) -> bool {
        now.saturating_sub(self.last_timestamp) > self.timeout
    }

    pub(crate) fn applied(&mut self, sequence: u64, index: u64) {
        self.last_sequence = sequence;
        self.last_version = index;
    }

    pub(crate) fn ack(&mut self, command_sequence: u64, event_version: u64) {
        self.command_ack = self.command_ack.max(command_sequence.min(self.last_sequence));
        self.events.retain(|&version, _| version > event_version);
    }

    /// Queues events published at `version` and returns the previous version.
    pub(crate) fn publish(&mut self, version: u64, events: Vec<Event>) -> u64 {
        let previous = self.last_event_version;
        self.events.entry(version).or_default().extend(events);
        self.last_event_version = version;
        previous
    }

    fn expire(&mut self) {
        self.state = SessionState::Expired;
        self.events.clear();
    }
}

/// All live sessions known to the state machine.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: BTreeMap<u64, Session>,
    /// most recently expired ids; older ones fall back to not found
    expired: BTreeSet<u64>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u64, client: impl Into<String>, timeout: u64, timestamp: u64) -> &Session {
        self.sessions
            .entry(id)
            .or_insert_with(|| Session::new(id, client.into(), timeout, timestamp))
    }

    pub fn get(&self, id: u64) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Drops an expired session. Only its id is kept, so later requests
    /// are rejected as expired rather than unknown.
    pub(crate) fn expire(&mut self, id: u64) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        session.expire();
        self.expired.insert(id);
        while self.expired.len() > EXPIRED_HISTORY {
            self.expired.pop_first();
        }
        Some(session)
    }

    /// Why a request for `id` found no live session.
    pub(crate) fn missing(&self, id: u64) -> RaftError {
        if self.expired.contains(&id) {
            RaftError::SessionExpired(id)
        } else {
            RaftError::SessionNotFound(id)
        }
    }

    /// Moves every timestamp forward, used when a new leader takes over and
    /// clients had no chance to keep their sessions alive.
    pub(crate) fn reset_timestamps(&mut self, timestamp: u64) {
        for session in self.sessions.values_mut() {
            session.trust(timestamp);
        }
    }

    /// Marks open sessions that missed their timeout as suspect and returns their ids.
    pub(crate) fn suspect_timed_out(&mut self, now: u64) -> Vec<u64> {
        let mut suspects = Vec::new();
        for session in self.sessions.values_mut() {
            if session.is_open() && session.is_timed_out(now) {
                session.state = SessionState::Suspect;
                suspects.push(session.id);
            }
        }
        suspects
    }
}
