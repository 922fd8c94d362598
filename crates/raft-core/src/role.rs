//! # role
//!
//! why: each server is in exactly one role, and each role carries only its own state
//! relations: held by node.rs, which implements the behaviour of every role
//! what: RoleKind, Role, Candidacy, Leadership, PendingRead, Attempt

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The externally visible role of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    /// Not participating: never started, left, or gave up joining.
    Inactive,
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
    /// Asking the cluster to add this server.
    Join,
    /// Asking the cluster to remove this server.
    Leave,
    /// Leader committing its own removal.
    Renounce,
}

impl Default for RoleKind {
    fn default() -> Self {
        Self::Inactive
    }
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoleKind::Inactive => "inactive",
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
            RoleKind::Join => "join",
            RoleKind::Leave => "leave",
            RoleKind::Renounce => "renounce",
        };
        f.write_str(name)
    }
}

/// Votes gathered in the current term, including our own.
#[derive(Debug, Default)]
pub(crate) struct Candidacy {
    pub votes: BTreeSet<u64>,
}

#[derive(Debug)]
pub(crate) struct Leadership {
    /// the no-op appended on election; reads wait for it to commit
    pub noop_index: u64,
    /// uncommitted configuration entry, at most one at a time
    pub pending_configuration: Option<u64>,
    pub heartbeat_due: u64,
    /// when the leader next checks that a quorum still answers
    pub check_due: u64,
    /// set while renouncing: our own leave entry and when to give up
    pub leave: Option<(u64, u64)>,
    /// current read round; appends carry it and answers confirm it
    pub round: u64,
    /// reads waiting for a quorum to confirm this leader
    pub reads: Vec<PendingRead>,
}

impl Leadership {
    pub fn new(pending_configuration: Option<u64>, heartbeat_due: u64, check_due: u64) -> Self {
        Self {
            noop_index: 0,
            pending_configuration,
            heartbeat_due,
            check_due,
            leave: None,
            round: 0,
            reads: Vec::new(),
        }
    }
}

/// A read that may run at `index` once a quorum answers `round`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRead {
    pub id: u64,
    pub index: u64,
    pub round: u64,
}

/// A join or leave in progress. Targets are fixed when the attempt starts
/// and tried in turn until the deadline.
#[derive(Debug)]
pub(crate) struct Attempt {
    targets: Vec<u64>,
    next: usize,
    /// a leader named in a rejection, tried before the next target
    hint: Option<u64>,
    pub in_flight: Option<u64>,
    pub retry_at: u64,
    pub deadline: u64,
}

impl Attempt {
    pub fn new(targets: Vec<u64>, now: u64, deadline: u64) -> Self {
        Self {
            targets,
            next: 0,
            hint: None,
            in_flight: None,
            retry_at: now,
            deadline,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.hint.is_none()
    }

    /// Picks the member to ask next, cycling through the targets.
    pub fn next_target(&mut self) -> Option<u64> {
        if let Some(hint) = self.hint.take() {
            return Some(hint);
        }
        if self.targets.is_empty() {
            return None;
        }
        let target = self.targets[self.next % self.targets.len()];
        self.next = (self.next + 1) % self.targets.len();
        Some(target)
    }

    pub fn prefer(&mut self, leader: u64) {
        self.hint = Some(leader);
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.in_flight.is_none() && now >= self.retry_at
    }
}

#[derive(Debug)]
pub(crate) enum Role {
    Inactive,
    Follower,
    Candidate(Candidacy),
    Leader(Leadership),
    Join(Attempt),
    Leave(Attempt),
    Renounce(Leadership),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Inactive => RoleKind::Inactive,
            Role::Follower => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
            Role::Join(_) => RoleKind::Join,
            Role::Leave(_) => RoleKind::Leave,
            Role::Renounce(_) => RoleKind::Renounce,
        }
    }

    /// Leader state for both leading roles.
    pub fn leadership(&self) -> Option<&Leadership> {
        match self {
            Role::Leader(leadership) | Role::Renounce(leadership) => Some(leadership),
            _ => None,
        }
    }

    pub fn leadership_mut(&mut self) -> Option<&mut Leadership> {
        match self {
            Role::Leader(leadership) | Role::Renounce(leadership) => Some(leadership),
            _ => None,
        }
    }

    pub fn attempt_mut(&mut self) -> Option<&mut Attempt> {
        match self {
            Role::Join(attempt) | Role::Leave(attempt) => Some(attempt),
            _ => None,
        }
    }
}
