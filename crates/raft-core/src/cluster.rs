//! # cluster
//!
//! why: single owner of membership and per-member replication progress
//! relations: read by every role in node.rs, mutated by the leader and by committed configuration entries
//! what: MemberState, MemberStatus, ClusterConfiguration, Cluster (quorum math, progress tracking)

use raft_storage::{ConfigurationChange, Member, MemberType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reachability as last observed by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Available,
    Unavailable,
}

/// failures in a row before a member is reported unavailable
const UNAVAILABLE_AFTER: u32 = 3;

/// A member plus the leader's view of its replication progress.
#[derive(Debug, Clone)]
pub struct MemberState {
    member: Member,
    pub(crate) match_index: u64,
    pub(crate) next_index: u64,
    /// last index covered by the outstanding append
    pub(crate) sent_index: u64,
    status: MemberStatus,
    failures: u32,
    /// an append or vote is outstanding
    pub(crate) in_flight: bool,
    /// earliest time (ms) the next attempt may start
    pub(crate) retry_at: u64,
    /// read round the outstanding append was sent in
    pub(crate) sent_round: u64,
    /// highest read round the member has answered in this term
    pub(crate) acked_round: u64,
    /// answered the leader since its last quorum check
    pub(crate) recent: bool,
}

impl MemberState {
    fn new(member: Member) -> Self {
        Self {
            member,
            match_index: 0,
            next_index: 1,
            sent_index: 0,
            status: MemberStatus::Available,
            failures: 0,
            in_flight: false,
            retry_at: 0,
            sent_round: 0,
            acked_round: 0,
            recent: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.member.id
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn member_type(&self) -> MemberType {
        self.member.member_type
    }

    pub fn match_index(&self) -> u64 {
        self.match_index
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn status(&self) -> MemberStatus {
        self.status
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn succeeded(&mut self) {
        self.in_flight = false;
        self.failures = 0;
        self.retry_at = 0;
        self.status = MemberStatus::Available;
    }

    /// Records a failed attempt and schedules the retry with exponential backoff.
    pub(crate) fn failed(&mut self, now: u64, base: u64, max: u64) {
        self.in_flight = false;
        self.failures = self.failures.saturating_add(1);
        let shift = self.failures.min(16);
        self.retry_at = now + base.saturating_mul(1 << shift).min(max);
        if self.failures >= UNAVAILABLE_AFTER {
            self.status = MemberStatus::Unavailable;
        }
    }

    /// The member answered an append of the current term.
    pub(crate) fn answered(&mut self) {
        self.acked_round = self.acked_round.max(self.sent_round);
        self.recent = true;
    }

    fn reset(&mut self, next_index: u64) {
        self.match_index = 0;
        self.next_index = next_index;
        self.sent_index = 0;
        self.in_flight = false;
        self.failures = 0;
        self.retry_at = 0;
        self.status = MemberStatus::Available;
        self.sent_round = 0;
        self.acked_round = 0;
        self.recent = false;
    }
}

/// A membership snapshot, versioned by the index of its configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub version: u64,
    pub members: Vec<Member>,
}

impl ClusterConfiguration {
    /// Applies `change` and returns the resulting member list.
    pub fn apply(members: &[Member], change: &ConfigurationChange) -> Vec<Member> {
        let mut next: Vec<Member> = members.to_vec();
        match change {
            ConfigurationChange::Join(member) => {
                if let Some(existing) = next.iter_mut().find(|m| m.id == member.id) {
                    existing.address = member.address.clone();
                } else {
                    next.push(member.clone());
                }
            }
            ConfigurationChange::Leave(id) => next.retain(|m| m.id != *id),
            ConfigurationChange::Promote(id) => {
                if let Some(member) = next.iter_mut().find(|m| m.id == *id) {
                    member.member_type = MemberType::Active;
                }
            }
        }
        next.sort_by_key(|m| m.id);
        next
    }
}

/// The local server's view of the cluster.
#[derive(Debug, Clone)]
pub struct Cluster {
    local: u64,
    version: u64,
    members: BTreeMap<u64, MemberState>,
}

impl Cluster {
    pub fn new(local: u64, members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            local,
            version: 0,
            members: members
                .into_iter()
                .map(|member| (member.id, MemberState::new(member)))
                .collect(),
        }
    }

    pub fn local_id(&self) -> u64 {
        self.local
    }

    /// Index of the configuration entry currently in effect, 0 for the initial one.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn configuration(&self) -> ClusterConfiguration {
        ClusterConfiguration {
            version: self.version,
            members: self.members.values().map(|state| state.member.clone()).collect(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberState> {
        self.members.values()
    }

    pub fn member(&self, id: u64) -> Option<&MemberState> {
        self.members.get(&id)
    }

    pub(crate) fn member_mut(&mut self, id: u64) -> Option<&mut MemberState> {
        self.members.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.contains_key(&id)
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.members
            .get(&id)
            .is_some_and(|state| state.member_type() == MemberType::Active)
    }

    /// Whether the local server votes and counts towards quorum.
    pub fn is_local_active(&self) -> bool {
        self.is_active(self.local)
    }

    pub fn active_count(&self) -> usize {
        self.members
            .values()
            .filter(|state| state.member_type() == MemberType::Active)
            .count()
    }

    /// Voting members other than the local server.
    pub fn remote_active(&self) -> Vec<u64> {
        self.members
            .values()
            .filter(|state| state.id() != self.local && state.member_type() == MemberType::Active)
            .map(MemberState::id)
            .collect()
    }

    /// Members the leader replicates to: everyone but the local server and reserves.
    pub fn replication_targets(&self) -> Vec<u64> {
        self.members
            .values()
            .filter(|state| state.id() != self.local && state.member_type() != MemberType::Reserve)
            .map(MemberState::id)
            .collect()
    }

    /// Strict majority of active members.
    pub fn quorum(&self) -> usize {
        self.active_count() / 2 + 1
    }

    /// The highest value reached by a quorum of active members, the local
    /// server contributing `local`.
    fn quorum_value(&self, local: u64, value: impl Fn(&MemberState) -> u64) -> u64 {
        let mut values: Vec<u64> = self
            .members
            .values()
            .filter(|state| state.member_type() == MemberType::Active)
            .map(|state| if state.id() == self.local { local } else { value(state) })
            .collect();
        if values.is_empty() {
            return 0;
        }
        values.sort_unstable_by(|a, b| b.cmp(a));
        values[self.quorum() - 1]
    }

    /// Highest index stored on a quorum of active members, counting the
    /// local server as holding `local_last_index`.
    pub fn quorum_index(&self, local_last_index: u64) -> u64 {
        self.quorum_value(local_last_index, |state| state.match_index)
    }

    /// Highest read round answered by a quorum, the leader having seen `round`.
    pub fn quorum_round(&self, round: u64) -> u64 {
        self.quorum_value(round, |state| state.acked_round)
    }

    /// Whether a quorum, the leader included, answered since the last call.
    /// Starts the next period.
    pub(crate) fn check_quorum(&mut self) -> bool {
        let heard = self.quorum_value(1, |state| u64::from(state.recent)) == 1;
        for state in self.members.values_mut() {
            state.recent = false;
        }
        heard
    }

    /// Resets replication progress for a new leadership term.
    pub(crate) fn reset_progress(&mut self, next_index: u64) {
        for state in self.members.values_mut() {
            state.reset(next_index);
        }
    }

    /// Installs a new member list. Progress of members that remain is kept.
    /// Configurations older than the current one are ignored.
    pub(crate) fn configure(&mut self, version: u64, members: &[Member], next_index: u64) -> bool {
        if version < self.version {
            return false;
        }

        let mut next = BTreeMap::new();
        for member in members {
            let state = match self.members.remove(&member.id) {
                Some(mut state) => {
                    state.member = member.clone();
                    state
                }
                None => {
                    let mut state = MemberState::new(member.clone());
                    state.next_index = next_index;
                    state
                }
            };
            next.insert(member.id, state);
        }

        self.members = next;
        self.version = version;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ids: &[u64]) -> Cluster {
        Cluster::new(1, ids.iter().map(|&id| Member::active(id, format!("127.0.0.1:{}", 5000 + id))))
    }

    #[test]
    fn quorum_counts_only_active_members() {
        let mut cluster = cluster(&[1, 2, 3]);
        assert_eq!(cluster.quorum(), 2);

        let members = ClusterConfiguration::apply(
            &cluster.configuration().members,
            &ConfigurationChange::Join(Member::passive(4, "127.0.0.1:5004")),
        );
        cluster.configure(5, &members, 1);

        assert_eq!(cluster.quorum(), 2);
        assert_eq!(cluster.replication_targets(), vec![2, 3, 4]);
        assert_eq!(cluster.remote_active(), vec![2, 3]);
    }

    #[test]
    fn quorum_index_is_majority_match() {
        let mut cluster = cluster(&[1, 2, 3, 4, 5]);
        for (id, matched) in [(2, 7), (3, 4), (4, 2), (5, 9)] {
            cluster.member_mut(id).unwrap().match_index = matched;
        }
        // local 10, remotes 9, 7, 4, 2 -> third highest is 7
        assert_eq!(cluster.quorum_index(10), 7);
    }

    #[test]
    fn read_rounds_and_contact_need_a_quorum() {
        let mut cluster = cluster(&[1, 2, 3, 4, 5]);
        for (id, round) in [(2, 3), (3, 2), (4, 1)] {
            let state = cluster.member_mut(id).unwrap();
            state.sent_round = round;
            state.answered();
        }

        // local 4, remotes 3, 2, 1, 0 -> third highest is 2
        assert_eq!(cluster.quorum_round(4), 2);
        assert!(cluster.check_quorum());
        // nobody answered in the new period
        assert!(!cluster.check_quorum());

        cluster.member_mut(5).unwrap().answered();
        cluster.member_mut(2).unwrap().answered();
        assert!(cluster.check_quorum());
    }

    #[test]
    fn configure_keeps_progress_of_remaining_members() {
        let mut cluster = cluster(&[1, 2, 3]);
        cluster.member_mut(2).unwrap().match_index = 6;

        let members = ClusterConfiguration::apply(&cluster.configuration().members, &ConfigurationChange::Leave(3));
        assert!(cluster.configure(8, &members, 9));

        assert_eq!(cluster.member(2).unwrap().match_index(), 6);
        assert!(!cluster.contains(3));
        assert_eq!(cluster.version(), 8);
        assert!(!cluster.configure(4, &[], 1));
    }

    #[test]
    fn promote_makes_member_active() {
        let members = vec![Member::active(1, "a"), Member::passive(2, "b")];
        let next = ClusterConfiguration::apply(&members, &ConfigurationChange::Promote(2));
        assert_eq!(next[1].member_type, MemberType::Active);
    }

    #[test]
    fn repeated_failures_back_off_and_mark_unavailable() {
        let mut cluster = cluster(&[1, 2]);
        let state = cluster.member_mut(2).unwrap();

        state.failed(1_000, 50, 2_000);
        assert_eq!(state.retry_at, 1_100);
        state.failed(1_000, 50, 2_000);
        state.failed(1_000, 50, 2_000);
        assert_eq!(state.status(), MemberStatus::Unavailable);
        state.failed(1_000, 50, 2_000);
        assert_eq!(state.retry_at, 1_800);
        state.failed(1_000, 50, 2_000);
        assert_eq!(state.retry_at, 2_600);
        state.failed(1_000, 50, 2_000);
        assert_eq!(state.retry_at, 3_000);

        state.succeeded();
        assert_eq!(state.status(), MemberStatus::Available);
        assert_eq!(state.failures(), 0);
    }
}
