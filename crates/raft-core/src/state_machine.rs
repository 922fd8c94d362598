//! # state_machine
//!
//! why: the contract between the replicated log and user code
//! relations: invoked by executor.rs, one Commit per applied command or query
//! what: StateMachine trait, Commit handle

use crate::error::Result;
use crate::message::Event;
use crate::session::Session;
use std::cell::{Cell, RefCell};

/// User logic driven by committed entries.
///
/// callbacks run on the apply task one at a time and in log order, so an
/// implementation needs no synchronisation of its own.
pub trait StateMachine: Send + 'static {
    /// Applies a command. The returned bytes are sent to the client.
    fn apply(&mut self, commit: &Commit<'_>) -> Result<Vec<u8>>;

    /// Answers a read-only query.
    fn query(&self, commit: &Commit<'_>) -> Result<Vec<u8>>;

    fn register(&mut self, _session: &Session) {}

    /// The session timed out and was expired by the leader.
    fn expire(&mut self, _session: u64) {}

    /// The session is gone, whether it expired or was unregistered.
    fn close(&mut self, _session: u64) {}
}

/// One applied operation, handed to the state machine for the duration of a callback.
#[derive(Debug)]
pub struct Commit<'a> {
    index: u64,
    term: u64,
    timestamp: u64,
    session: u64,
    operation: &'a [u8],
    tombstone: bool,
    cleaned: Cell<bool>,
    events: RefCell<Vec<Event>>,
}

impl<'a> Commit<'a> {
    pub(crate) fn new(index: u64, term: u64, timestamp: u64, session: u64, operation: &'a [u8]) -> Self {
        Self {
            index,
            term,
            timestamp,
            session,
            operation,
            tombstone: false,
            cleaned: Cell::new(false),
            events: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn tombstone(mut self) -> Self {
        self.tombstone = true;
        self
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Leader time of the entry in milliseconds. Deterministic across members.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn operation(&self) -> &[u8] {
        self.operation
    }

    /// Whether the command deletes state and must outlive minor compaction.
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Releases the entry for compaction once its effect no longer matters.
    pub fn clean(&self) {
        self.cleaned.set(true);
    }

    pub fn is_clean(&self) -> bool {
        self.cleaned.get()
    }

    /// Publishes an event to the committing session. Ignored for queries.
    pub fn publish(&self, name: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.events.borrow_mut().push(Event {
            name: name.into(),
            payload: payload.into(),
        });
    }

    pub(crate) fn take_events(&self) -> Vec<Event> {
        self.events.take()
    }
}
