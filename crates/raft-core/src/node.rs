//! # node
//!
//! why: the raft role state machine, free of io so every transition can be driven by hand
//! relations: owns role.rs and cluster.rs, appends to the raft-storage Log, driven by server.rs
//! what: RaftNode (elections, replication, commit, membership), Completion, Reply, NodeStatus
//!
//! handlers answer requests directly. requests to other members are queued and
//! drained with take_messages; the driver reports every outcome back through
//! handle_response or handle_failure. time only moves through tick(now).
//!
//! configuration entries take effect when they commit. the leader accepts one
//! change at a time, so two configurations never compete for a quorum.

use crate::cluster::{Cluster, ClusterConfiguration, MemberState};
use crate::config::{RaftConfig, ServerConfig};
use crate::error::{RaftError, Result};
use crate::message::{
    AppendRequest, AppendResponse, CommandRequest, ConfigurationResponse, JoinRequest, KeepAliveRequest,
    LeaveRequest, Request, Response, Status, VoteRequest, VoteResponse,
};
use crate::role::{Attempt, Candidacy, Leadership, PendingRead, Role, RoleKind};
use rand::Rng;
use raft_storage::{ConfigurationChange, Entry, EntryKind, Log, Member, MemberType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// configuration entries by index
type Configurations = BTreeMap<u64, Vec<Member>>;

/// Outcome of a membership change, reported through take_completions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// a change appended by this leader committed or was abandoned
    Configuration { index: u64, response: ConfigurationResponse },
    /// this server's join finished; false when it gave up
    Joined(bool),
    /// this server stopped participating; `committed` tells whether its removal committed
    Left { committed: bool },
    /// a read started with `read` may run at `index`; None when leadership was lost first
    Read { id: u64, index: Option<u64> },
}

/// A response that is available now or once the entry at the index commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Now(T),
    AtCommit(u64),
}

/// Snapshot of a server's raft state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: u64,
    pub role: RoleKind,
    pub term: u64,
    pub leader: Option<u64>,
    pub commit_index: u64,
    pub last_log_index: u64,
    pub version: u64,
    pub members: Vec<Member>,
}

#[derive(Debug)]
pub struct RaftNode {
    id: u64,
    address: String,
    config: RaftConfig,
    log: Arc<Log>,
    cluster: Cluster,
    role: Role,
    term: u64,
    voted_for: Option<u64>,
    leader: Option<u64>,
    commit_index: u64,
    /// highest index handed out by get_entries_to_apply
    last_delivered: u64,
    now: u64,
    election_deadline: u64,
    /// appended but not yet committed configurations
    configurations: Configurations,
    next_read: u64,
    outbox: Vec<(u64, Request)>,
    completions: Vec<Completion>,
}

impl RaftNode {
    /// Restores term, vote and the latest committed configuration from `log`. The node
    /// stays inactive until open is called.
    ///
    /// an empty member list bootstraps a single member cluster.
    pub fn new(config: &ServerConfig, log: Arc<Log>) -> Result<Self> {
        let (term, voted_for) = log.load_term_and_vote();

        let mut members = config.members.clone();
        if members.is_empty() {
            members.push(Member::active(config.id, config.address.clone()));
        }
        let mut cluster = Cluster::new(config.id, members);
        let committed = log.commit_index().max(log.compactor().minor_index());
        let (latest, configurations) = Self::stored_configurations(&log, committed)?;
        if let Some((index, members)) = latest {
            cluster.configure(index, &members, log.next_index());
        }

        tracing::debug!(
            term,
            voted_for = ?voted_for,
            last_index = log.last_index(),
            committed,
            version = cluster.version(),
            pending = configurations.len(),
            "restored raft state",
        );

        Ok(Self {
            id: config.id,
            address: config.address.clone(),
            config: config.raft.clone(),
            log,
            cluster,
            role: Role::Inactive,
            term,
            voted_for,
            leader: None,
            commit_index: 0,
            last_delivered: 0,
            now: 0,
            election_deadline: 0,
            configurations,
            next_read: 0,
            outbox: Vec::new(),
            completions: Vec::new(),
        })
    }

    /// Scans the log backwards for configuration entries. Returns the newest
    /// one at or below `committed` and every newer one, which stay pending
    /// until they commit or are truncated.
    fn stored_configurations(log: &Log, committed: u64) -> Result<(Option<(u64, Vec<Member>)>, Configurations)> {
        let mut pending = BTreeMap::new();
        let first = log.first_index();
        let mut index = log.last_index();
        while index >= first && index > 0 {
            if let Some(Entry {
                kind: EntryKind::Configuration { members, .. },
                ..
            }) = log.get(index)?
            {
                if index <= committed {
                    return Ok((Some((index, members)), pending));
                }
                pending.insert(index, members);
            }
            index -= 1;
        }
        Ok((None, pending))
    }

    /// Starts participating: as a follower when this server is a member,
    /// otherwise by asking the known members to add it.
    pub fn open(&mut self, now: u64) {
        self.now = self.now.max(now);
        if self.cluster.contains(self.id) {
            self.become_follower();
            return;
        }

        let targets: Vec<u64> = self.cluster.members().map(MemberState::id).collect();
        tracing::info!(members = ?targets, "joining cluster");
        let deadline = self.now + self.config.configuration_timeout;
        self.role = Role::Join(Attempt::new(targets, self.now, deadline));
    }

    // -- accessors --

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn voted_for(&self) -> Option<u64> {
        self.voted_for
    }

    pub fn leader(&self) -> Option<u64> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.role.leadership().is_some()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    /// Term of the newest entry still present in the log.
    pub fn last_log_term(&self) -> u64 {
        let first = self.log.first_index();
        let mut index = self.log.last_index();
        while index >= first && index > 0 {
            if let Some(term) = self.log.term(index) {
                return term;
            }
            index -= 1;
        }
        0
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster.quorum()
    }

    pub fn status(&self) -> NodeStatus {
        let configuration = self.cluster.configuration();
        NodeStatus {
            id: self.id,
            role: self.role.kind(),
            term: self.term,
            leader: self.leader,
            commit_index: self.commit_index,
            last_log_index: self.log.last_index(),
            version: configuration.version,
            members: configuration.members,
        }
    }

    // -- driver interface --

    /// Requests queued for other members since the last call.
    pub fn take_messages(&mut self) -> Vec<(u64, Request)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    /// Committed entries not handed out yet, in index order. Compacted
    /// indices are simply missing.
    pub fn get_entries_to_apply(&mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for index in self.last_delivered + 1..=self.commit_index {
            if let Some(entry) = self.log.get(index)? {
                entries.push(entry);
            }
        }
        self.last_delivered = self.last_delivered.max(self.commit_index);
        Ok(entries)
    }

    /// When tick next has work to do, if ever.
    pub fn next_deadline(&self) -> Option<u64> {
        match &self.role {
            Role::Inactive => None,
            Role::Follower | Role::Candidate(_) => Some(self.election_deadline),
            Role::Leader(leadership) | Role::Renounce(leadership) => Some(match leadership.leave {
                Some((_, deadline)) => deadline.min(leadership.heartbeat_due),
                None => leadership.heartbeat_due,
            }),
            Role::Join(attempt) | Role::Leave(attempt) => Some(match attempt.in_flight {
                Some(_) => attempt.deadline,
                None => attempt.retry_at.min(attempt.deadline),
            }),
        }
    }

    /// Advances the clock and runs whatever timed out.
    pub fn tick(&mut self, now: u64) -> Result<()> {
        self.now = self.now.max(now);

        match self.role.kind() {
            RoleKind::Inactive => Ok(()),
            RoleKind::Follower | RoleKind::Candidate => {
                if self.now < self.election_deadline {
                    return Ok(());
                }
                if self.cluster.is_local_active() {
                    self.start_election()
                } else {
                    // passive members wait for the leader
                    self.reset_election_deadline();
                    Ok(())
                }
            }
            RoleKind::Leader | RoleKind::Renounce => self.tick_leader(),
            RoleKind::Join | RoleKind::Leave => {
                self.tick_attempt();
                Ok(())
            }
        }
    }

    /// Routes a response to the handler for its kind.
    pub fn handle_response(&mut self, from: u64, response: &Response) -> Result<()> {
        match response {
            Response::Vote(response) => self.handle_vote_response(from, response),
            Response::Append(response) => self.handle_append_response(from, response),
            Response::Configuration(response) => self.handle_configuration_response(from, response),
            Response::Register(_) | Response::Operation(_) => Ok(()),
        }
    }

    /// The request to `to` could not be delivered or timed out.
    pub fn handle_failure(&mut self, to: u64, request: &Request) {
        match request {
            Request::Append(_) => {
                let (base, max) = (self.config.heartbeat_interval, self.config.election_timeout_max);
                if let Some(state) = self.cluster.member_mut(to) {
                    state.failed(self.now, base, max);
                    tracing::debug!(member = to, failures = state.failures(), "append failed");
                }
            }
            Request::Join(_) | Request::Leave(_) => {
                let retry_at = self.now + self.config.heartbeat_interval;
                if let Some(attempt) = self.role.attempt_mut() {
                    attempt.in_flight = None;
                    attempt.retry_at = retry_at;
                }
                tracing::debug!(member = to, request = request.name(), "configuration request failed");
            }
            _ => {}
        }
    }

    // -- transitions --

    fn reset_election_deadline(&mut self) {
        let timeout = rand::thread_rng().gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        self.election_deadline = self.now + timeout;
    }

    fn become_follower(&mut self) {
        if self.role.kind() != RoleKind::Follower {
            tracing::info!(term = self.term, leader = ?self.leader, "became follower");
        }
        self.role = Role::Follower;
        self.reset_election_deadline();
    }

    fn become_inactive(&mut self, committed: bool) {
        tracing::info!(term = self.term, committed, "left cluster");
        if let Role::Leader(leadership) | Role::Renounce(leadership) = std::mem::replace(&mut self.role, Role::Inactive) {
            self.fail_reads(&leadership.reads);
        }
        self.completions.push(Completion::Left { committed });
    }

    fn become_leader(&mut self) -> Result<()> {
        tracing::info!(term = self.term, "became leader");
        self.leader = Some(self.id);
        self.cluster.reset_progress(self.log.next_index());
        let pending = self.configurations.keys().next_back().copied();
        let check_due = self.now + self.config.election_timeout_max;
        self.role = Role::Leader(Leadership::new(pending, self.now, check_due));

        let index = self.append(EntryKind::NoOp)?;
        if let Some(leadership) = self.role.leadership_mut() {
            leadership.noop_index = index;
        }
        self.replicate_all(true)?;
        self.advance_commit()
    }

    /// Adopts a newer term. Candidates and leaders give up; members that are
    /// joining or leaving keep doing so.
    fn step_down(&mut self, term: u64, leader: Option<u64>) -> Result<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.leader = None;
            self.log.save_term_and_vote(term, None)?;
        }
        if leader.is_some() {
            self.leader = leader;
        }

        match std::mem::replace(&mut self.role, Role::Inactive) {
            Role::Leader(leadership) => {
                tracing::info!(term = self.term, "stepping down");
                self.abandon(&leadership);
                self.become_follower();
            }
            Role::Renounce(leadership) => {
                self.abandon(&leadership);
                let deadline = match leadership.leave {
                    Some((_, deadline)) => deadline,
                    None => self.now + self.config.configuration_timeout,
                };
                self.start_leave(deadline);
            }
            Role::Candidate(_) => self.become_follower(),
            role => self.role = role,
        }
        Ok(())
    }

    fn abandon(&mut self, leadership: &Leadership) {
        self.fail_reads(&leadership.reads);
        if let Some(index) = leadership.pending_configuration {
            let error = RaftError::NoLeader { leader: self.leader };
            self.completions.push(Completion::Configuration {
                index,
                response: ConfigurationResponse::error(self.term, self.leader, &error),
            });
        }
    }

    fn fail_reads(&mut self, reads: &[PendingRead]) {
        for read in reads {
            self.completions.push(Completion::Read { id: read.id, index: None });
        }
    }

    fn start_leave(&mut self, deadline: u64) {
        let leader = self.leader.filter(|&leader| leader != self.id);
        let mut targets: Vec<u64> = leader.into_iter().collect();
        targets.extend(
            self.cluster
                .remote_active()
                .into_iter()
                .filter(|&member| Some(member) != leader),
        );

        if targets.is_empty() {
            self.become_inactive(false);
            return;
        }
        tracing::info!(term = self.term, targets = ?targets, "leaving cluster");
        self.role = Role::Leave(Attempt::new(targets, self.now, deadline));
    }

    // -- elections --

    /// Votes for itself in a new term and asks every other active member.
    pub fn start_election(&mut self) -> Result<()> {
        if !self.cluster.is_local_active() {
            return Err(RaftError::IllegalMemberState(format!(
                "member {} is not active and cannot stand for election",
                self.id
            )));
        }

        self.term += 1;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.log.save_term_and_vote(self.term, self.voted_for)?;
        self.reset_election_deadline();

        let mut candidacy = Candidacy::default();
        candidacy.votes.insert(self.id);
        self.role = Role::Candidate(candidacy);
        tracing::info!(term = self.term, "starting election");

        if self.cluster.quorum() <= 1 {
            return self.become_leader();
        }

        let request = VoteRequest {
            term: self.term,
            candidate: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.last_log_term(),
        };
        for member in self.cluster.remote_active() {
            self.outbox.push((member, Request::Vote(request.clone())));
        }
        Ok(())
    }

    /// Grants at most one vote per term, to an active candidate whose log is
    /// at least as up to date as ours. The vote is stored before it is returned.
    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> Result<VoteResponse> {
        if request.term > self.term {
            self.step_down(request.term, None)?;
        }

        let granted = self.can_vote_for(request);
        if granted {
            self.voted_for = Some(request.candidate);
            self.log.save_term_and_vote(self.term, self.voted_for)?;
            self.reset_election_deadline();
        }

        tracing::debug!(term = self.term, candidate = request.candidate, granted, "vote requested");
        Ok(VoteResponse {
            term: self.term,
            granted,
        })
    }

    fn can_vote_for(&self, request: &VoteRequest) -> bool {
        if request.term < self.term || matches!(self.role, Role::Inactive) {
            return false;
        }
        if !self.cluster.is_active(request.candidate) {
            return false;
        }
        if self.voted_for.is_some_and(|vote| vote != request.candidate) {
            return false;
        }
        (request.last_log_term, request.last_log_index) >= (self.last_log_term(), self.log.last_index())
    }

    pub fn handle_vote_response(&mut self, from: u64, response: &VoteResponse) -> Result<()> {
        if response.term > self.term {
            return self.step_down(response.term, None);
        }

        let quorum = self.cluster.quorum();
        let active = self.cluster.is_active(from);
        let Role::Candidate(candidacy) = &mut self.role else {
            return Ok(());
        };
        if response.term != self.term || !response.granted || !active {
            return Ok(());
        }

        candidacy.votes.insert(from);
        let won = candidacy.votes.len() >= quorum;
        tracing::debug!(term = self.term, member = from, votes = candidacy.votes.len(), "vote granted");
        if won {
            self.become_leader()?;
        }
        Ok(())
    }

    // -- replication, follower side --

    fn append_response(&self, success: bool, last_log_index: u64) -> AppendResponse {
        AppendResponse {
            term: self.term,
            success,
            last_log_index,
        }
    }

    /// Accepts entries from the leader of the current term.
    ///
    /// entries the leader already compacted are missing from the request;
    /// their slots are skipped here. conflicting uncommitted entries are
    /// truncated before the leader's entries are appended.
    pub fn handle_append(&mut self, request: &AppendRequest) -> Result<AppendResponse> {
        if request.term < self.term || matches!(self.role, Role::Inactive) {
            return Ok(self.append_response(false, self.log.last_index()));
        }
        if request.term == self.term && self.role.leadership().is_some() {
            tracing::warn!(term = self.term, leader = request.leader, "append from another leader of this term");
            return Ok(self.append_response(false, self.log.last_index()));
        }

        self.step_down(request.term, Some(request.leader))?;
        self.reset_election_deadline();

        if let Err(hint) = self.check_previous(request) {
            tracing::debug!(
                prev_log_index = request.prev_log_index,
                prev_log_term = request.prev_log_term,
                hint,
                "log mismatch",
            );
            return Ok(self.append_response(false, hint));
        }

        self.append_entries(request)?;
        self.update_commit(request.commit_index.min(request.last_index()))?;
        Ok(self.append_response(true, self.log.last_index()))
    }

    /// Checks the slot before the batch. On mismatch returns the index the
    /// leader should retry after.
    fn check_previous(&self, request: &AppendRequest) -> std::result::Result<(), u64> {
        let prev = request.prev_log_index;
        let last = self.log.last_index();
        if prev == 0 {
            return Ok(());
        }
        if prev > last {
            return Err(last);
        }

        match self.log.term(prev) {
            Some(term) if term == request.prev_log_term => Ok(()),
            // compacted here, so committed, so identical
            None => Ok(()),
            // compacted on the leader: only a committed local entry is known to match
            Some(_) if request.prev_log_term == 0 && prev <= self.commit_index => Ok(()),
            Some(_) if request.prev_log_term == 0 => Err(self.commit_index.min(last)),
            Some(_) => Err(prev.saturating_sub(1).max(self.commit_index).min(last)),
        }
    }

    fn append_entries(&mut self, request: &AppendRequest) -> Result<()> {
        let mut expected = request.prev_log_index + 1;
        for entry in &request.entries {
            if entry.index < expected {
                continue;
            }
            if entry.index > expected {
                self.fill_gap(expected, entry.index)?;
            }
            expected = entry.index + 1;

            if entry.index < self.log.next_index() {
                match self.log.term(entry.index) {
                    Some(term) if term == entry.term => continue,
                    None => continue,
                    Some(_) => {
                        tracing::debug!(index = entry.index, term = entry.term, "conflicting entry, truncating");
                        self.truncate(entry.index - 1)?;
                    }
                }
            }

            self.log.append(entry.clone())?;
            if let EntryKind::Configuration { members, .. } = &entry.kind {
                self.configurations.insert(entry.index, members.clone());
            }
        }
        Ok(())
    }

    /// Slots `from..to` were compacted on the leader. Local entries there that
    /// are not committed cannot be verified and are dropped.
    fn fill_gap(&mut self, from: u64, to: u64) -> Result<()> {
        let last = self.log.last_index();
        if last >= from {
            let keep = (from - 1).max(self.commit_index);
            if keep < last {
                self.truncate(keep)?;
            }
        }

        let next = self.log.next_index();
        if next < to {
            self.log.skip(to - next)?;
        }
        Ok(())
    }

    fn truncate(&mut self, index: u64) -> Result<()> {
        self.log.truncate(index)?;
        self.configurations.retain(|&version, _| version <= index);
        Ok(())
    }

    fn update_commit(&mut self, index: u64) -> Result<()> {
        if index <= self.commit_index {
            return Ok(());
        }
        let commit = self.log.commit(index);
        if commit <= self.commit_index {
            return Ok(());
        }

        self.commit_index = commit;
        self.log.compactor().set_minor_index(commit);
        tracing::trace!(commit, "commit index advanced");

        let pending = self.configurations.split_off(&(commit + 1));
        let committed = std::mem::replace(&mut self.configurations, pending);
        for (index, members) in committed {
            self.apply_configuration(index, &members);
        }
        Ok(())
    }

    fn apply_configuration(&mut self, index: u64, members: &[Member]) {
        if !self.cluster.configure(index, members, self.log.next_index()) {
            return;
        }
        tracing::info!(version = index, members = members.len(), "configuration committed");

        if let Some(leadership) = self.role.leadership_mut() {
            if leadership.pending_configuration == Some(index) {
                leadership.pending_configuration = None;
                let response = ConfigurationResponse::ok(self.term, Some(self.id), index, members.to_vec());
                self.completions.push(Completion::Configuration { index, response });
            }
        }

        let member = self.cluster.contains(self.id);
        match self.role.kind() {
            RoleKind::Join if member => {
                self.become_follower();
                self.completions.push(Completion::Joined(true));
            }
            RoleKind::Join | RoleKind::Inactive => {}
            _ if !member => self.become_inactive(true),
            _ => {}
        }
    }

    // -- replication, leader side --

    fn tick_leader(&mut self) -> Result<()> {
        let Some(leadership) = self.role.leadership() else {
            return Ok(());
        };
        if let Some((index, deadline)) = leadership.leave {
            if self.now >= deadline {
                tracing::warn!(term = self.term, index, "own removal did not commit in time");
                self.become_inactive(false);
                return Ok(());
            }
        }

        let heartbeat = self.now >= leadership.heartbeat_due;
        // a quorum that stops answering for a whole period elects someone else
        if self.now >= leadership.check_due {
            if !self.cluster.check_quorum() {
                tracing::warn!(term = self.term, "no quorum answered, stepping down");
                self.leader = None;
                return self.step_down(self.term, None);
            }
            let due = self.now + self.config.election_timeout_max;
            if let Some(leadership) = self.role.leadership_mut() {
                leadership.check_due = due;
            }
        }

        self.replicate_all(heartbeat)?;
        self.promote()
    }

    fn replicate_all(&mut self, heartbeat: bool) -> Result<()> {
        if heartbeat {
            let due = self.now + self.config.heartbeat_interval;
            if let Some(leadership) = self.role.leadership_mut() {
                leadership.heartbeat_due = due;
            }
        }
        for member in self.cluster.replication_targets() {
            self.replicate(member, heartbeat)?;
        }
        Ok(())
    }

    /// Sends the next batch to `to` unless an append is already outstanding
    /// or the member is backing off. Without `heartbeat` nothing is sent to a
    /// member that is up to date.
    fn replicate(&mut self, to: u64, heartbeat: bool) -> Result<()> {
        let last = self.log.last_index();
        let Some(state) = self.cluster.member(to) else {
            return Ok(());
        };
        if state.in_flight || self.now < state.retry_at {
            return Ok(());
        }
        let next = state.next_index.max(1);
        if !heartbeat && next > last {
            return Ok(());
        }

        let prev_log_index = next - 1;
        let prev_log_term = match prev_log_index {
            0 => 0,
            index => self.log.term(index).unwrap_or(0),
        };

        let mut entries = Vec::new();
        let mut index = next;
        while index <= last && (entries.len() as u64) < self.config.max_entries_per_append {
            if let Some(entry) = self.log.get(index)? {
                entries.push(entry);
            }
            index += 1;
        }

        let request = AppendRequest {
            term: self.term,
            leader: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.commit_index,
        };
        let round = self.role.leadership().map_or(0, |leadership| leadership.round);
        if let Some(state) = self.cluster.member_mut(to) {
            state.in_flight = true;
            state.sent_index = request.last_index();
            state.sent_round = round;
        }
        tracing::trace!(member = to, prev_log_index, entries = request.entries.len(), "sending append");
        self.outbox.push((to, Request::Append(request)));
        Ok(())
    }

    pub fn handle_append_response(&mut self, from: u64, response: &AppendResponse) -> Result<()> {
        if response.term > self.term {
            return self.step_down(response.term, None);
        }
        if response.term < self.term || self.role.leadership().is_none() {
            return Ok(());
        }
        let round = self.role.leadership().map_or(0, |leadership| leadership.round);
        let Some(state) = self.cluster.member_mut(from) else {
            return Ok(());
        };

        state.succeeded();
        state.answered();
        // an answer to an append from before the latest read round confirms nothing new
        let behind = state.acked_round < round;
        let resend = if response.success {
            state.match_index = state.match_index.max(state.sent_index);
            state.next_index = state.match_index + 1;
            false
        } else {
            let previous = state.next_index;
            state.next_index = previous
                .saturating_sub(1)
                .min(response.last_log_index + 1)
                .max(1);
            tracing::debug!(member = from, next_index = state.next_index, "append rejected, backing off");
            state.next_index < previous
        };

        if response.success {
            self.advance_commit()?;
        }
        self.confirm_reads();
        let waiting = self
            .role
            .leadership()
            .is_some_and(|leadership| !leadership.reads.is_empty());
        if self.role.leadership().is_some() {
            self.replicate(from, resend || (behind && waiting))?;
        }
        Ok(())
    }

    /// Completes the reads whose round a quorum has answered.
    fn confirm_reads(&mut self) {
        let Some(leadership) = self.role.leadership_mut() else {
            return;
        };
        if leadership.reads.is_empty() {
            return;
        }
        let confirmed = self.cluster.quorum_round(leadership.round);
        let completions = &mut self.completions;
        leadership.reads.retain(|read| {
            if read.round > confirmed {
                return true;
            }
            completions.push(Completion::Read {
                id: read.id,
                index: Some(read.index),
            });
            false
        });
    }

    /// Commits the highest index stored on a quorum, provided it belongs to
    /// the current term. Older entries commit along with it.
    fn advance_commit(&mut self) -> Result<()> {
        if self.role.leadership().is_none() {
            return Ok(());
        }
        let index = self.cluster.quorum_index(self.log.last_index());
        if index > self.commit_index && self.log.term(index) == Some(self.term) {
            self.update_commit(index)?;
        }
        Ok(())
    }

    fn append(&mut self, kind: EntryKind) -> Result<u64> {
        let index = self.log.next_index();
        self.log
            .append(Entry::new(self.term, index, kind).with_timestamp(self.now))?;
        Ok(index)
    }

    fn propose(&mut self, kind: EntryKind) -> Result<u64> {
        if self.role.leadership().is_none() {
            return Err(RaftError::NoLeader { leader: self.leader });
        }
        let index = self.append(kind)?;
        self.replicate_all(false)?;
        self.advance_commit()?;
        Ok(index)
    }

    // -- membership --

    fn pending_configuration(&self) -> Option<u64> {
        match &self.role {
            Role::Leader(leadership) => leadership.pending_configuration,
            Role::Renounce(leadership) => leadership
                .pending_configuration
                .or(leadership.leave.map(|(index, _)| index)),
            _ => None,
        }
    }

    fn configuration_ok(&self) -> ConfigurationResponse {
        let configuration = self.cluster.configuration();
        ConfigurationResponse::ok(self.term, self.leader, configuration.version, configuration.members)
    }

    fn configuration_error(&self, error: &RaftError) -> ConfigurationResponse {
        ConfigurationResponse::error(self.term, self.leader, error)
    }

    fn propose_configuration(&mut self, change: ConfigurationChange) -> Result<u64> {
        let members = ClusterConfiguration::apply(&self.cluster.configuration().members, &change);
        if self.role.leadership().is_none() {
            return Err(RaftError::NoLeader { leader: self.leader });
        }

        let index = self.append(EntryKind::Configuration {
            change,
            members: members.clone(),
        })?;
        self.configurations.insert(index, members);
        if let Some(leadership) = self.role.leadership_mut() {
            leadership.pending_configuration = Some(index);
        }
        self.replicate_all(false)?;
        self.advance_commit()?;
        Ok(index)
    }

    /// Adds a member. Answered at once when there is nothing to do or the
    /// change cannot be made, otherwise when the configuration commits.
    pub fn handle_join(&mut self, request: &JoinRequest) -> Result<Reply<ConfigurationResponse>> {
        let member = &request.member;
        if !self.is_leader() {
            let error = RaftError::NoLeader { leader: self.leader };
            return Ok(Reply::Now(self.configuration_error(&error)));
        }
        if self
            .cluster
            .member(member.id)
            .is_some_and(|state| state.member().address == member.address)
        {
            return Ok(Reply::Now(self.configuration_ok()));
        }
        if let Some(pending) = self.pending_configuration() {
            let error = RaftError::ConfigurationConflict { pending };
            return Ok(Reply::Now(self.configuration_error(&error)));
        }

        tracing::info!(member = member.id, address = %member.address, "member asked to join");
        let index = self.propose_configuration(ConfigurationChange::Join(member.clone()))?;
        Ok(Reply::AtCommit(index))
    }

    /// Removes a member other than this leader.
    pub fn handle_leave(&mut self, request: &LeaveRequest) -> Result<Reply<ConfigurationResponse>> {
        if !self.is_leader() {
            let error = RaftError::NoLeader { leader: self.leader };
            return Ok(Reply::Now(self.configuration_error(&error)));
        }
        if !self.cluster.contains(request.member) {
            return Ok(Reply::Now(self.configuration_ok()));
        }
        if request.member == self.id {
            let error = RaftError::IllegalMemberState("a leader leaves by renouncing".into());
            return Ok(Reply::Now(self.configuration_error(&error)));
        }
        if let Some(pending) = self.pending_configuration() {
            let error = RaftError::ConfigurationConflict { pending };
            return Ok(Reply::Now(self.configuration_error(&error)));
        }

        tracing::info!(member = request.member, "member asked to leave");
        let index = self.propose_configuration(ConfigurationChange::Leave(request.member))?;
        Ok(Reply::AtCommit(index))
    }

    pub fn handle_configuration_response(&mut self, from: u64, response: &ConfigurationResponse) -> Result<()> {
        if response.term > self.term {
            self.step_down(response.term, response.leader)?;
        }

        let (id, now, heartbeat) = (self.id, self.now, self.config.heartbeat_interval);
        let Some(attempt) = self.role.attempt_mut() else {
            return Ok(());
        };
        attempt.in_flight = None;

        if response.status != Status::Ok {
            match response.leader.filter(|&leader| leader != from && leader != id) {
                Some(leader) => {
                    attempt.prefer(leader);
                    attempt.retry_at = now;
                }
                None => attempt.retry_at = now + heartbeat,
            }
            tracing::debug!(member = from, error = ?response.error, "configuration change rejected");
            return Ok(());
        }

        if response.leader.is_some() {
            self.leader = response.leader;
        }
        match self.role.kind() {
            RoleKind::Join if response.members.iter().any(|member| member.id == id) => {
                self.cluster
                    .configure(response.version, &response.members, self.log.next_index());
                self.become_follower();
                self.completions.push(Completion::Joined(true));
            }
            RoleKind::Leave => {
                self.cluster
                    .configure(response.version, &response.members, self.log.next_index());
                self.become_inactive(true);
            }
            _ => {}
        }
        Ok(())
    }

    fn tick_attempt(&mut self) {
        let joining = self.role.kind() == RoleKind::Join;
        let (id, now) = (self.id, self.now);
        let member = Member::passive(id, self.address.clone());

        let Some(attempt) = self.role.attempt_mut() else {
            return;
        };
        if now >= attempt.deadline || attempt.is_empty() {
            if joining {
                tracing::warn!("join did not complete in time");
                self.role = Role::Inactive;
                self.completions.push(Completion::Joined(false));
            } else {
                tracing::warn!("leave did not complete in time");
                self.become_inactive(false);
            }
            return;
        }
        if !attempt.is_due(now) {
            return;
        }
        let Some(target) = attempt.next_target() else {
            return;
        };
        attempt.in_flight = Some(target);

        let request = if joining {
            Request::Join(JoinRequest { member })
        } else {
            Request::Leave(LeaveRequest { member: id })
        };
        tracing::debug!(member = target, request = request.name(), "asking member");
        self.outbox.push((target, request));
    }

    /// Proposes promotion of a passive member that has caught up.
    fn promote(&mut self) -> Result<()> {
        let Role::Leader(leadership) = &self.role else {
            return Ok(());
        };
        if leadership.pending_configuration.is_some() || self.commit_index == 0 {
            return Ok(());
        }

        let commit = self.commit_index;
        let caught_up = self
            .cluster
            .members()
            .find(|state| state.member_type() == MemberType::Passive && state.match_index() >= commit)
            .map(MemberState::id);
        if let Some(member) = caught_up {
            tracing::info!(member, "promoting member");
            self.propose_configuration(ConfigurationChange::Promote(member))?;
        }
        Ok(())
    }

    /// Leaves the cluster. A leader renounces by committing its own removal;
    /// other members ask the leader, then every active member in turn. Either
    /// way the server goes inactive once the configuration timeout passes.
    pub fn leave(&mut self) -> Result<()> {
        let deadline = self.now + self.config.configuration_timeout;
        match std::mem::replace(&mut self.role, Role::Inactive) {
            Role::Leader(mut leadership) => {
                if let Some(pending) = leadership.pending_configuration {
                    self.role = Role::Leader(leadership);
                    return Err(RaftError::ConfigurationConflict { pending });
                }
                tracing::info!(term = self.term, "renouncing leadership");
                leadership.leave = Some((0, deadline));
                self.role = Role::Renounce(leadership);

                let index = self.propose_configuration(ConfigurationChange::Leave(self.id))?;
                if let Some(leadership) = self.role.leadership_mut() {
                    leadership.leave = Some((index, deadline));
                }
                Ok(())
            }
            Role::Follower | Role::Candidate(_) => {
                self.start_leave(deadline);
                Ok(())
            }
            Role::Join(_) => {
                self.become_inactive(false);
                Ok(())
            }
            Role::Inactive => {
                self.completions.push(Completion::Left {
                    committed: !self.cluster.contains(self.id),
                });
                Ok(())
            }
            role => {
                self.role = role;
                Ok(())
            }
        }
    }

    // -- client operations --

    /// Appends a register entry. The session id is the returned index.
    pub fn register(&mut self, client: impl Into<String>, timeout: u64) -> Result<u64> {
        let timeout = match timeout {
            0 => self.config.session_timeout,
            timeout => timeout,
        };
        self.propose(EntryKind::Register {
            client: client.into(),
            timeout,
        })
    }

    pub fn keep_alive(&mut self, request: &KeepAliveRequest) -> Result<u64> {
        self.propose(EntryKind::KeepAlive {
            session: request.session,
            command_sequence: request.command_sequence,
            event_version: request.event_version,
        })
    }

    pub fn command(&mut self, request: &CommandRequest) -> Result<u64> {
        let (session, sequence, operation) = (request.session, request.sequence, request.operation.clone());
        let kind = if request.tombstone {
            EntryKind::Tombstone {
                session,
                sequence,
                operation,
            }
        } else {
            EntryKind::Command {
                session,
                sequence,
                operation,
            }
        };
        self.propose(kind)
    }

    pub fn unregister(&mut self, session: u64) -> Result<u64> {
        self.propose(EntryKind::Unregister { session, expired: false })
    }

    /// Expires a session that stopped sending keep-alives.
    pub fn expire_session(&mut self, session: u64) -> Result<u64> {
        tracing::debug!(session, "expiring timed out session");
        self.propose(EntryKind::Unregister { session, expired: true })
    }

    /// Starts a linearizable read and returns its id.
    ///
    /// the read index is everything committed, and at least this leader's
    /// no-op so no earlier leader's commits are missed. it is only released,
    /// as Completion::Read, once a quorum has answered an append sent after
    /// this call; a leader cut off from the cluster never releases it.
    pub fn read(&mut self) -> Result<u64> {
        let leader = self.leader;
        let (commit, single) = (self.commit_index, self.cluster.quorum() <= 1);
        let Some(leadership) = self.role.leadership_mut() else {
            return Err(RaftError::NoLeader { leader });
        };

        self.next_read += 1;
        let id = self.next_read;
        let index = commit.max(leadership.noop_index);
        if single {
            self.completions.push(Completion::Read { id, index: Some(index) });
            return Ok(id);
        }

        leadership.round += 1;
        let round = leadership.round;
        leadership.reads.push(PendingRead { id, index, round });
        tracing::trace!(id, index, round, "read waiting for quorum");
        self.replicate_all(true)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_storage::InMemoryMetaStorage;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn members(ids: &[u64]) -> Vec<Member> {
        ids.iter()
            .map(|&id| Member::active(id, format!("127.0.0.1:{}", 5000 + id)))
            .collect()
    }

    fn node_in(dir: &Path, id: u64, ids: &[u64]) -> RaftNode {
        let log = Log::open(dir, "raft", 16, Box::new(InMemoryMetaStorage::new())).unwrap();
        let config = ServerConfig::new(id, format!("127.0.0.1:{}", 5000 + id)).with_members(members(ids));
        let mut node = RaftNode::new(&config, Arc::new(log)).unwrap();
        node.open(0);
        node
    }

    fn node(id: u64, ids: &[u64]) -> (TempDir, RaftNode) {
        let dir = tempdir().unwrap();
        let node = node_in(dir.path(), id, ids);
        (dir, node)
    }

    fn appends(node: &mut RaftNode) -> Vec<(u64, AppendRequest)> {
        node.take_messages()
            .into_iter()
            .filter_map(|(to, request)| match request {
                Request::Append(append) => Some((to, append)),
                _ => None,
            })
            .collect()
    }

    fn reads(node: &mut RaftNode) -> Vec<(u64, Option<u64>)> {
        node.take_completions()
            .into_iter()
            .filter_map(|completion| match completion {
                Completion::Read { id, index } => Some((id, index)),
                _ => None,
            })
            .collect()
    }

    fn acked(last_log_index: u64) -> AppendResponse {
        AppendResponse {
            term: 1,
            success: true,
            last_log_index,
        }
    }

    /// node 1 leading [1, 2, 3] in term 1 with its no-op committed by 2
    fn leader() -> (TempDir, RaftNode) {
        let (dir, mut node) = node(1, &[1, 2, 3]);
        node.tick(1_000).unwrap();
        node.handle_vote_response(2, &VoteResponse { term: 1, granted: true })
            .unwrap();
        node.handle_append_response(2, &acked(1)).unwrap();
        node.take_messages();
        (dir, node)
    }

    fn entry(term: u64, index: u64) -> Entry {
        Entry::new(term, index, EntryKind::NoOp)
    }

    fn append_request(term: u64, prev: (u64, u64), entries: Vec<Entry>, commit_index: u64) -> AppendRequest {
        AppendRequest {
            term,
            leader: 1,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            commit_index,
        }
    }

    #[test]
    fn new_node_is_inactive_until_opened() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), "raft", 16, Box::new(InMemoryMetaStorage::new())).unwrap();
        let config = ServerConfig::new(1, "a").with_members(members(&[1, 2, 3]));
        let mut node = RaftNode::new(&config, Arc::new(log)).unwrap();

        assert_eq!(node.role(), RoleKind::Inactive);
        assert_eq!(node.next_deadline(), None);

        node.open(0);
        assert_eq!(node.role(), RoleKind::Follower);
        assert!(node.next_deadline().unwrap() <= 300);
    }

    #[test]
    fn single_member_elects_itself_and_commits() {
        let (_dir, mut node) = node(1, &[1]);

        node.tick(1_000).unwrap();

        assert_eq!(node.role(), RoleKind::Leader);
        assert_eq!(node.term(), 1);
        assert_eq!(node.commit_index(), 1);

        let session = node.register("client", 0).unwrap();
        assert_eq!(session, 2);
        assert_eq!(node.commit_index(), 2);

        let entries = node.get_entries_to_apply().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[1].kind,
            EntryKind::Register { timeout: 5_000, .. }
        ));
        assert_eq!(entries[1].timestamp, 1_000);
        assert!(node.get_entries_to_apply().unwrap().is_empty());

        // nobody else can have been elected, so reads need no round trip
        let read = node.read().unwrap();
        assert_eq!(reads(&mut node), vec![(read, Some(2))]);
    }

    #[test]
    fn election_timeout_starts_candidacy() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);

        node.tick(1_000).unwrap();

        assert_eq!(node.role(), RoleKind::Candidate);
        assert_eq!(node.voted_for(), Some(1));
        assert_eq!(node.log().load_term_and_vote(), (1, Some(1)));
        let targets: Vec<u64> = node.take_messages().into_iter().map(|(to, _)| to).collect();
        assert_eq!(targets, vec![2, 3]);
    }

    #[test]
    fn majority_of_votes_wins() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        node.tick(1_000).unwrap();
        node.take_messages();

        node.handle_vote_response(2, &VoteResponse { term: 1, granted: true })
            .unwrap();

        assert_eq!(node.role(), RoleKind::Leader);
        assert_eq!(node.leader(), Some(1));
        // the no-op goes out to both followers
        let sent = appends(&mut node);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.entries.len(), 1);
    }

    #[test]
    fn one_vote_per_term() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        let request = |candidate| VoteRequest {
            term: 1,
            candidate,
            last_log_index: 0,
            last_log_term: 0,
        };

        assert!(node.handle_vote_request(&request(2)).unwrap().granted);
        assert!(!node.handle_vote_request(&request(3)).unwrap().granted);
        assert!(node.handle_vote_request(&request(2)).unwrap().granted);
        assert_eq!(node.log().load_term_and_vote(), (1, Some(2)));
    }

    #[test]
    fn vote_denied_to_stale_log() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        node.handle_append(&append_request(2, (0, 0), vec![entry(1, 1), entry(2, 2)], 0))
            .unwrap();

        let response = node
            .handle_vote_request(&VoteRequest {
                term: 3,
                candidate: 3,
                last_log_index: 5,
                last_log_term: 1,
            })
            .unwrap();

        assert!(!response.granted);
        assert_eq!(response.term, 3);
        assert_eq!(node.voted_for(), None);
    }

    #[test]
    fn vote_denied_to_unknown_candidate() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        let response = node
            .handle_vote_request(&VoteRequest {
                term: 1,
                candidate: 9,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!response.granted);
    }

    #[test]
    fn higher_term_response_steps_leader_down() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        node.tick(1_000).unwrap();
        node.handle_vote_response(2, &VoteResponse { term: 1, granted: true })
            .unwrap();
        node.take_messages();

        node.handle_append_response(
            3,
            &AppendResponse {
                term: 4,
                success: false,
                last_log_index: 0,
            },
        )
        .unwrap();

        assert_eq!(node.role(), RoleKind::Follower);
        assert_eq!(node.term(), 4);
        assert_eq!(node.voted_for(), None);
    }

    #[test]
    fn append_from_old_term_is_rejected() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        node.handle_vote_request(&VoteRequest {
            term: 3,
            candidate: 2,
            last_log_index: 0,
            last_log_term: 0,
        })
        .unwrap();

        let response = node
            .handle_append(&append_request(2, (0, 0), vec![entry(2, 1)], 0))
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.term, 3);
        assert_eq!(node.last_log_index(), 0);
    }

    #[test]
    fn follower_skips_slots_compacted_on_the_leader() {
        let (_dir, mut node) = node(2, &[1, 2, 3]);

        let response = node
            .handle_append(&append_request(1, (0, 0), vec![entry(1, 1), entry(1, 4)], 4))
            .unwrap();

        assert!(response.success);
        assert_eq!(response.last_log_index, 4);
        assert!(!node.log().contains(2));
        assert!(!node.log().contains(3));
        assert_eq!(node.commit_index(), 4);
        assert_eq!(node.leader(), Some(1));
        let applied: Vec<u64> = node.get_entries_to_apply().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(applied, vec![1, 4]);
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let (_dir, mut node) = node(2, &[1, 2, 3]);
        node.handle_append(&append_request(1, (0, 0), vec![entry(1, 1), entry(1, 2), entry(1, 3)], 1))
            .unwrap();

        let response = node
            .handle_append(&append_request(2, (1, 1), vec![entry(2, 2)], 2))
            .unwrap();

        assert!(response.success);
        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.log().term(2), Some(2));
        assert_eq!(node.commit_index(), 2);
    }

    #[test]
    fn mismatch_returns_hint() {
        let (_dir, mut node) = node(2, &[1, 2, 3]);
        node.handle_append(&append_request(1, (0, 0), vec![entry(1, 1), entry(1, 2)], 0))
            .unwrap();

        let past_end = node
            .handle_append(&append_request(1, (6, 1), vec![entry(1, 7)], 0))
            .unwrap();
        assert!(!past_end.success);
        assert_eq!(past_end.last_log_index, 2);

        let wrong_term = node
            .handle_append(&append_request(3, (2, 3), vec![], 0))
            .unwrap();
        assert!(!wrong_term.success);
        assert_eq!(wrong_term.last_log_index, 1);
    }

    #[test]
    fn commit_is_capped_by_what_the_request_covers() {
        let (_dir, mut node) = node(2, &[1, 2, 3]);
        node.handle_append(&append_request(1, (0, 0), vec![entry(1, 1), entry(1, 2), entry(1, 3)], 0))
            .unwrap();

        node.handle_append(&append_request(1, (1, 1), vec![], 3)).unwrap();

        assert_eq!(node.commit_index(), 1);
    }

    #[test]
    fn leader_backs_off_next_index_on_rejection() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        node.tick(1_000).unwrap();
        node.handle_vote_response(2, &VoteResponse { term: 1, granted: true })
            .unwrap();
        node.register("a", 0).unwrap();
        node.take_messages();

        node.handle_append_response(
            2,
            &AppendResponse {
                term: 1,
                success: false,
                last_log_index: 0,
            },
        )
        .unwrap();

        assert_eq!(node.cluster().member(2).unwrap().next_index(), 1);
        let resent = appends(&mut node);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].1.prev_log_index, 0);
    }

    #[test]
    fn quorum_of_acks_commits_current_term_entries() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        node.tick(1_000).unwrap();
        node.handle_vote_response(2, &VoteResponse { term: 1, granted: true })
            .unwrap();
        node.take_messages();

        node.handle_append_response(
            2,
            &AppendResponse {
                term: 1,
                success: true,
                last_log_index: 1,
            },
        )
        .unwrap();

        assert_eq!(node.commit_index(), 1);
        assert_eq!(node.cluster().member(2).unwrap().match_index(), 1);
        assert_eq!(node.cluster().member(3).unwrap().match_index(), 0);
    }

    #[test]
    fn read_waits_for_a_quorum_to_answer_after_it_started() {
        let (_dir, mut node) = leader();

        let read = node.read().unwrap();
        // 3 still owes an answer for the no-op, so only 2 gets a heartbeat
        let sent: Vec<u64> = appends(&mut node).into_iter().map(|(to, _)| to).collect();
        assert_eq!(sent, vec![2]);
        assert!(reads(&mut node).is_empty());

        // answering an append sent before the read proves nothing about now
        node.handle_append_response(3, &acked(1)).unwrap();
        assert!(reads(&mut node).is_empty());
        let sent: Vec<u64> = appends(&mut node).into_iter().map(|(to, _)| to).collect();
        assert_eq!(sent, vec![3]);

        node.handle_append_response(2, &acked(1)).unwrap();
        assert_eq!(reads(&mut node), vec![(read, Some(1))]);
    }

    #[test]
    fn deposed_leader_fails_pending_reads() {
        let (_dir, mut node) = leader();
        let read = node.read().unwrap();

        node.handle_append_response(
            2,
            &AppendResponse {
                term: 2,
                success: false,
                last_log_index: 0,
            },
        )
        .unwrap();

        assert_eq!(node.role(), RoleKind::Follower);
        assert_eq!(reads(&mut node), vec![(read, None)]);
        assert!(matches!(node.read(), Err(RaftError::NoLeader { .. })));
    }

    #[test]
    fn leader_cut_off_from_its_quorum_steps_down() {
        let (_dir, mut node) = leader();

        // 2 answered during the first period
        node.tick(1_300).unwrap();
        assert_eq!(node.role(), RoleKind::Leader);

        let read = node.read().unwrap();
        node.tick(1_450).unwrap();
        assert_eq!(node.role(), RoleKind::Leader);
        assert!(reads(&mut node).is_empty());

        // nobody answered during the second one
        node.tick(1_600).unwrap();
        assert_eq!(node.role(), RoleKind::Follower);
        assert_eq!(node.leader(), None);
        assert_eq!(reads(&mut node), vec![(read, None)]);
    }

    #[test]
    fn join_request_is_answered_at_commit() {
        let (_dir, mut node) = node(1, &[1]);
        node.tick(1_000).unwrap();

        let reply = node
            .handle_join(&JoinRequest {
                member: Member::passive(2, "127.0.0.1:5002"),
            })
            .unwrap();

        // a single voter commits the change right away
        let Reply::AtCommit(index) = reply else {
            panic!("expected the join to wait for commit");
        };
        assert!(node.cluster().contains(2));
        let completions = node.take_completions();
        assert!(matches!(
            &completions[..],
            [Completion::Configuration { index: done, response }] if *done == index && response.status == Status::Ok
        ));

        // joining again is a no-op
        let again = node
            .handle_join(&JoinRequest {
                member: Member::passive(2, "127.0.0.1:5002"),
            })
            .unwrap();
        assert!(matches!(again, Reply::Now(ref response) if response.status == Status::Ok));
    }

    #[test]
    fn second_change_conflicts_with_pending_one() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        node.tick(1_000).unwrap();
        node.handle_vote_response(2, &VoteResponse { term: 1, granted: true })
            .unwrap();

        let first = node.handle_leave(&LeaveRequest { member: 3 }).unwrap();
        assert!(matches!(first, Reply::AtCommit(_)));

        let second = node
            .handle_join(&JoinRequest {
                member: Member::passive(4, "d"),
            })
            .unwrap();
        let Reply::Now(response) = second else {
            panic!("expected an immediate rejection");
        };
        assert_eq!(response.error, Some(crate::error::ErrorKind::ConfigurationConflict));
    }

    #[test]
    fn follower_rejects_membership_changes() {
        let (_dir, mut node) = node(2, &[1, 2]);
        node.handle_append(&append_request(1, (0, 0), vec![], 0)).unwrap();

        let reply = node.handle_leave(&LeaveRequest { member: 1 }).unwrap();

        let Reply::Now(response) = reply else {
            panic!("expected an immediate answer");
        };
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.leader, Some(1));
    }

    #[test]
    fn outsider_joins_through_known_members() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), "raft", 16, Box::new(InMemoryMetaStorage::new())).unwrap();
        let config = ServerConfig::new(4, "127.0.0.1:5004").with_members(members(&[1, 2]));
        let mut node = RaftNode::new(&config, Arc::new(log)).unwrap();
        node.open(0);
        assert_eq!(node.role(), RoleKind::Join);

        node.tick(0).unwrap();
        let sent = node.take_messages();
        assert!(matches!(&sent[..], [(1, Request::Join(JoinRequest { member }))] if member.id == 4));

        // rejected with a leader hint: that leader is asked next
        node.handle_configuration_response(
            1,
            &ConfigurationResponse::error(0, Some(2), &RaftError::NoLeader { leader: Some(2) }),
        )
        .unwrap();
        node.tick(1).unwrap();
        let sent = node.take_messages();
        assert_eq!(sent[0].0, 2);

        let mut joined = members(&[1, 2]);
        joined.push(Member::passive(4, "127.0.0.1:5004"));
        node.handle_configuration_response(2, &ConfigurationResponse::ok(1, Some(2), 3, joined))
            .unwrap();

        assert_eq!(node.role(), RoleKind::Follower);
        assert_eq!(node.leader(), Some(2));
        assert_eq!(node.take_completions(), vec![Completion::Joined(true)]);
        assert!(!node.cluster().is_local_active());
    }

    #[test]
    fn join_gives_up_after_timeout() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), "raft", 16, Box::new(InMemoryMetaStorage::new())).unwrap();
        let config = ServerConfig::new(4, "d").with_members(members(&[1]));
        let mut node = RaftNode::new(&config, Arc::new(log)).unwrap();
        node.open(0);

        node.tick(0).unwrap();
        let (to, request) = node.take_messages().remove(0);
        node.handle_failure(to, &request);
        node.tick(5_000).unwrap();

        assert_eq!(node.role(), RoleKind::Inactive);
        assert_eq!(node.take_completions(), vec![Completion::Joined(false)]);
    }

    #[test]
    fn follower_leave_asks_the_leader_first() {
        let (_dir, mut node) = node(2, &[1, 2, 3]);
        node.handle_append(&append_request(1, (0, 0), vec![], 0)).unwrap();

        node.leave().unwrap();
        assert_eq!(node.role(), RoleKind::Leave);
        node.tick(1).unwrap();

        let sent = node.take_messages();
        assert!(matches!(&sent[..], [(1, Request::Leave(LeaveRequest { member: 2 }))]));

        node.handle_configuration_response(1, &ConfigurationResponse::ok(1, Some(1), 5, members(&[1, 3])))
            .unwrap();
        assert_eq!(node.role(), RoleKind::Inactive);
        assert_eq!(node.take_completions(), vec![Completion::Left { committed: true }]);
    }

    #[test]
    fn leave_times_out_into_inactive() {
        let (_dir, mut node) = node(2, &[1, 2, 3]);
        node.leave().unwrap();
        node.tick(1).unwrap();
        let sent = node.take_messages();
        assert_eq!(sent.len(), 1);

        node.tick(5_001).unwrap();

        assert_eq!(node.role(), RoleKind::Inactive);
        assert_eq!(node.take_completions(), vec![Completion::Left { committed: false }]);
    }

    #[test]
    fn single_leader_renounces_immediately() {
        let (_dir, mut node) = node(1, &[1]);
        node.tick(1_000).unwrap();

        node.leave().unwrap();

        assert_eq!(node.role(), RoleKind::Inactive);
        assert!(node
            .take_completions()
            .contains(&Completion::Left { committed: true }));
    }

    #[test]
    fn renouncing_leader_waits_for_its_removal_to_commit() {
        let (_dir, mut node) = node(1, &[1, 2, 3]);
        node.tick(1_000).unwrap();
        node.handle_vote_response(2, &VoteResponse { term: 1, granted: true })
            .unwrap();
        node.take_messages();

        node.leave().unwrap();
        assert_eq!(node.role(), RoleKind::Renounce);
        assert!(node.register("a", 0).is_ok());

        node.handle_append_response(
            2,
            &AppendResponse {
                term: 1,
                success: true,
                last_log_index: 1,
            },
        )
        .unwrap();
        assert_eq!(node.role(), RoleKind::Renounce);

        // the follower acks the removal entry and the register after it
        let last = node.last_log_index();
        node.take_messages();
        node.handle_append_response(
            2,
            &AppendResponse {
                term: 1,
                success: true,
                last_log_index: last,
            },
        )
        .unwrap();

        assert_eq!(node.role(), RoleKind::Inactive);
        assert!(!node.cluster().contains(1));
    }

    #[test]
    fn restart_restores_term_vote_and_configuration() {
        let dir = tempdir().unwrap();
        {
            let log = Log::open(
                dir.path(),
                "raft",
                16,
                Box::new(raft_storage::FileMetaStorage::open(dir.path()).unwrap()),
            )
            .unwrap();
            let config = ServerConfig::new(1, "a").with_members(members(&[1]));
            let mut node = RaftNode::new(&config, Arc::new(log)).unwrap();
            node.open(0);
            node.tick(1_000).unwrap();
            node.handle_join(&JoinRequest {
                member: Member::passive(2, "b"),
            })
            .unwrap();
            node.log().flush().unwrap();
        }

        let log = Log::open(
            dir.path(),
            "raft",
            16,
            Box::new(raft_storage::FileMetaStorage::open(dir.path()).unwrap()),
        )
        .unwrap();
        let config = ServerConfig::new(1, "a").with_members(members(&[1]));
        let node = RaftNode::new(&config, Arc::new(log)).unwrap();

        assert_eq!(node.term(), 1);
        assert_eq!(node.voted_for(), Some(1));
        assert!(node.cluster().contains(2));
        assert_eq!(node.cluster().version(), 2);
    }

    fn file_log(dir: &Path) -> Arc<Log> {
        let meta = raft_storage::FileMetaStorage::open(dir).unwrap();
        Arc::new(Log::open(dir, "raft", 16, Box::new(meta)).unwrap())
    }

    /// leaves a flushed log whose last entry removes 3 but never committed
    fn uncommitted_removal(dir: &Path) -> ServerConfig {
        let config = ServerConfig::new(1, "a").with_members(members(&[1, 2, 3]));
        let mut node = RaftNode::new(&config, file_log(dir)).unwrap();
        node.open(0);
        node.tick(1_000).unwrap();
        node.handle_vote_response(2, &VoteResponse { term: 1, granted: true })
            .unwrap();
        node.handle_append_response(2, &acked(1)).unwrap();
        let reply = node.handle_leave(&LeaveRequest { member: 3 }).unwrap();
        assert!(matches!(reply, Reply::AtCommit(2)));
        node.log().flush().unwrap();
        config
    }

    #[test]
    fn restart_keeps_an_uncommitted_configuration_pending() {
        let dir = tempdir().unwrap();
        let config = uncommitted_removal(dir.path());

        let mut node = RaftNode::new(&config, file_log(dir.path())).unwrap();
        assert_eq!(node.log().commit_index(), 1);
        assert!(node.cluster().contains(3));
        assert_eq!(node.quorum_size(), 2);
        assert_eq!(node.cluster().version(), 0);

        // a new leader that never saw the removal overwrites it
        node.open(0);
        let response = node
            .handle_append(&AppendRequest {
                leader: 2,
                ..append_request(2, (1, 1), vec![entry(2, 2)], 2)
            })
            .unwrap();

        assert!(response.success);
        assert_eq!(node.commit_index(), 2);
        assert_eq!(node.log().term(2), Some(2));
        assert!(node.cluster().contains(3));
        assert_eq!(node.quorum_size(), 2);
        assert_eq!(node.cluster().version(), 0);
    }

    #[test]
    fn pending_configuration_from_before_a_restart_applies_when_it_commits() {
        let dir = tempdir().unwrap();
        let config = uncommitted_removal(dir.path());

        let mut node = RaftNode::new(&config, file_log(dir.path())).unwrap();
        node.open(0);
        node.handle_append(&AppendRequest {
            leader: 2,
            ..append_request(2, (2, 1), Vec::new(), 2)
        })
        .unwrap();

        assert!(!node.cluster().contains(3));
        assert_eq!(node.cluster().version(), 2);
    }
}
