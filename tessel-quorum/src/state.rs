//! Master election state machine.
//!
//! A pure, tick-driven `{Follower, Candidate, Leader}` machine. It takes
//! messages and ticks as input and returns outputs; the caller performs all
//! I/O. Transitions happen only on three triggers: election timeout, a
//! majority of granted votes, or observing a higher term.
//!
//! Safety rules:
//! - a candidate wins only with votes from a strict majority of the
//!   configured voters,
//! - a vote is granted only to a candidate whose applied cluster-state
//!   version is at least the voter's own,
//! - a leader that cannot hear from a majority within one election timeout
//!   steps down (check-quorum), so a minority partition never keeps a master,
//! - elections are preceded by a pre-vote round, so an isolated node does
//!   not inflate its term and disrupt the majority when it reconnects.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tessel_core::{NodeId, StateVersion, TermId};
use tracing::{debug, info};

use crate::config::QuorumConfig;
use crate::message::{Heartbeat, HeartbeatAck, QuorumMessage, RequestVote, VoteResponse};

/// Election role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuorumRole {
    /// Passive; follows the current master if there is one.
    #[default]
    Follower,
    /// Collecting votes for the current term.
    Candidate,
    /// Elected master for the current term.
    Leader,
}

/// Term and vote that must survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistentVote {
    /// Latest term seen.
    pub term: TermId,
    /// Candidate voted for in `term`.
    pub voted_for: Option<NodeId>,
}

/// Output actions from the quorum state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumOutput {
    /// Persist term/vote before sending any message produced in the same step.
    PersistVote(PersistentVote),
    /// Send a message to another voter.
    Send(QuorumMessage),
    /// This node won an election.
    BecameMaster {
        /// Winning term.
        term: TermId,
        /// Highest cluster-state version reported by any voter.
        max_seen_version: StateVersion,
    },
    /// This node lost its master role.
    SteppedDown {
        /// Term in which it stepped down.
        term: TermId,
    },
    /// The known master changed (or became unknown).
    MasterChanged {
        /// New master, if any.
        master: Option<NodeId>,
        /// Current term.
        term: TermId,
    },
    /// A follower acknowledged a version older than the master's.
    FollowerBehind {
        /// Lagging follower.
        node: NodeId,
        /// Version it reported.
        version: StateVersion,
    },
}

/// A master-eligible node's view of the election.
#[derive(Debug)]
pub struct QuorumNode {
    config: QuorumConfig,
    rng: StdRng,

    // Persistent state.
    term: TermId,
    voted_for: Option<NodeId>,

    // Volatile state.
    role: QuorumRole,
    leader: Option<NodeId>,
    state_version: StateVersion,
    max_seen_version: StateVersion,

    // Election state.
    votes: HashSet<NodeId>,
    pre_votes: HashSet<NodeId>,
    election_elapsed: u32,
    election_timeout: u32,

    // Leader state.
    heartbeat_elapsed: u32,
    quorum_check_elapsed: u32,
    acks: HashSet<NodeId>,
}

impl QuorumNode {
    /// Creates a fresh node at term 0.
    #[must_use]
    pub fn new(config: QuorumConfig) -> Self {
        Self::restore(config, PersistentVote::default())
    }

    /// Creates a node from persisted term/vote.
    #[must_use]
    pub fn restore(config: QuorumConfig, vote: PersistentVote) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let mut node = Self {
            config,
            rng,
            term: vote.term,
            voted_for: vote.voted_for,
            role: QuorumRole::Follower,
            leader: None,
            state_version: StateVersion::new(0),
            max_seen_version: StateVersion::new(0),
            votes: HashSet::new(),
            pre_votes: HashSet::new(),
            election_elapsed: 0,
            election_timeout: 0,
            heartbeat_elapsed: 0,
            quorum_check_elapsed: 0,
            acks: HashSet::new(),
        };
        node.reset_election_timer();
        node
    }

    /// Returns this node's ID.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Returns the current term.
    #[must_use]
    pub const fn term(&self) -> TermId {
        self.term
    }

    /// Returns the current role.
    #[must_use]
    pub const fn role(&self) -> QuorumRole {
        self.role
    }

    /// Returns true if this node is the elected master.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.role == QuorumRole::Leader
    }

    /// Returns the master this node currently follows, if any.
    #[must_use]
    pub const fn current_master(&self) -> Option<NodeId> {
        self.leader
    }

    /// Returns the persistent part of the state.
    #[must_use]
    pub const fn persistent_vote(&self) -> PersistentVote {
        PersistentVote {
            term: self.term,
            voted_for: self.voted_for,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &QuorumConfig {
        &self.config
    }

    /// Records the latest cluster-state version applied locally.
    pub fn observe_state_version(&mut self, version: StateVersion) {
        if version > self.state_version {
            self.state_version = version;
        }
        if version > self.max_seen_version {
            self.max_seen_version = version;
        }
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) -> Vec<QuorumOutput> {
        if self.role == QuorumRole::Leader {
            return self.tick_leader();
        }

        self.election_elapsed += 1;
        if self.election_elapsed >= self.election_timeout {
            return self.start_pre_vote();
        }
        Vec::new()
    }

    /// Handles an incoming message.
    pub fn handle_message(&mut self, message: QuorumMessage) -> Vec<QuorumOutput> {
        // Pre-vote traffic never changes term or vote.
        match message {
            QuorumMessage::RequestVote(req) if req.pre_vote => {
                return self.handle_pre_vote(req);
            }
            QuorumMessage::VoteResponse(resp) if resp.pre_vote && resp.granted => {
                return self.handle_pre_vote_response(resp);
            }
            _ => {}
        }

        let mut outputs = Vec::new();
        let msg_term = message.term();
        if msg_term > self.term {
            if let QuorumMessage::RequestVote(req) = message {
                if self.in_lease() {
                    debug!(
                        node = %self.config.node_id,
                        candidate = %req.candidate,
                        "ignoring vote request while master is live"
                    );
                    return vec![self.vote_response(req.candidate, false, false)];
                }
            }
            let leader = match message {
                QuorumMessage::Heartbeat(hb) => Some(hb.leader),
                _ => None,
            };
            outputs.extend(self.become_follower(msg_term, leader));
        }

        match message {
            QuorumMessage::RequestVote(req) => outputs.extend(self.handle_request_vote(req)),
            QuorumMessage::VoteResponse(resp) => outputs.extend(self.handle_vote_response(resp)),
            QuorumMessage::Heartbeat(hb) => outputs.extend(self.handle_heartbeat(hb)),
            QuorumMessage::HeartbeatAck(ack) => outputs.extend(self.handle_heartbeat_ack(ack)),
        }
        outputs
    }

    fn tick_leader(&mut self) -> Vec<QuorumOutput> {
        let mut outputs = Vec::new();

        self.heartbeat_elapsed += 1;
        if self.heartbeat_elapsed >= self.config.heartbeat_tick {
            self.heartbeat_elapsed = 0;
            outputs.extend(self.broadcast_heartbeat());
        }

        self.quorum_check_elapsed += 1;
        if self.quorum_check_elapsed >= self.config.election_tick {
            self.quorum_check_elapsed = 0;
            let reachable = self.acks.len() + 1;
            self.acks.clear();
            if reachable < self.config.quorum_size() {
                info!(
                    node = %self.config.node_id,
                    term = self.term.get(),
                    reachable,
                    quorum = self.config.quorum_size(),
                    "lost quorum, stepping down"
                );
                self.role = QuorumRole::Follower;
                self.leader = None;
                self.reset_election_timer();
                outputs.push(QuorumOutput::SteppedDown { term: self.term });
                outputs.push(QuorumOutput::MasterChanged {
                    master: None,
                    term: self.term,
                });
            }
        }
        outputs
    }

    fn start_pre_vote(&mut self) -> Vec<QuorumOutput> {
        let mut outputs = Vec::new();
        self.reset_election_timer();

        if self.leader.take().is_some() {
            outputs.push(QuorumOutput::MasterChanged {
                master: None,
                term: self.term,
            });
        }

        self.pre_votes.clear();
        self.pre_votes.insert(self.config.node_id);
        if self.pre_votes.len() >= self.config.quorum_size() {
            outputs.extend(self.start_election());
            return outputs;
        }

        debug!(node = %self.config.node_id, term = self.term.get(), "starting pre-vote");
        let probe_term = self.term.next();
        for peer in self.config.peers() {
            outputs.push(QuorumOutput::Send(QuorumMessage::RequestVote(RequestVote {
                term: probe_term,
                candidate: self.config.node_id,
                to: peer,
                state_version: self.state_version,
                pre_vote: true,
            })));
        }
        outputs
    }

    fn start_election(&mut self) -> Vec<QuorumOutput> {
        let prev_term = self.term;
        let mut outputs = Vec::new();

        self.term = self.term.next();
        self.role = QuorumRole::Candidate;
        self.voted_for = Some(self.config.node_id);
        self.leader = None;
        self.pre_votes.clear();
        self.votes.clear();
        self.votes.insert(self.config.node_id);
        self.reset_election_timer();

        // Postcondition: term incremented, we voted for ourselves.
        debug_assert!(self.term.get() == prev_term.get() + 1);
        debug_assert!(self.voted_for == Some(self.config.node_id));

        info!(node = %self.config.node_id, term = self.term.get(), "starting election");
        outputs.push(QuorumOutput::PersistVote(self.persistent_vote()));

        for peer in self.config.peers() {
            outputs.push(QuorumOutput::Send(QuorumMessage::RequestVote(RequestVote {
                term: self.term,
                candidate: self.config.node_id,
                to: peer,
                state_version: self.state_version,
                pre_vote: false,
            })));
        }

        if self.votes.len() >= self.config.quorum_size() {
            outputs.extend(self.become_leader());
        }
        outputs
    }

    fn become_leader(&mut self) -> Vec<QuorumOutput> {
        // Precondition: a strict majority of configured voters agreed.
        debug_assert!(self.votes.len() >= self.config.quorum_size());

        self.role = QuorumRole::Leader;
        self.leader = Some(self.config.node_id);
        self.heartbeat_elapsed = 0;
        self.quorum_check_elapsed = 0;
        self.acks.clear();

        info!(
            node = %self.config.node_id,
            term = self.term.get(),
            votes = self.votes.len(),
            max_seen_version = self.max_seen_version.get(),
            "became master"
        );

        let mut outputs = vec![
            QuorumOutput::BecameMaster {
                term: self.term,
                max_seen_version: self.max_seen_version,
            },
            QuorumOutput::MasterChanged {
                master: Some(self.config.node_id),
                term: self.term,
            },
        ];
        outputs.extend(self.broadcast_heartbeat());
        outputs
    }

    fn become_follower(&mut self, term: TermId, leader: Option<NodeId>) -> Vec<QuorumOutput> {
        let mut outputs = Vec::new();
        let was_leader = self.role == QuorumRole::Leader;

        if term > self.term {
            self.term = term;
            self.voted_for = None;
            outputs.push(QuorumOutput::PersistVote(self.persistent_vote()));
        }
        self.role = QuorumRole::Follower;
        self.votes.clear();
        self.pre_votes.clear();

        if was_leader {
            info!(node = %self.config.node_id, term = self.term.get(), "stepping down");
            outputs.push(QuorumOutput::SteppedDown { term: self.term });
        }
        if self.leader != leader {
            self.leader = leader;
            outputs.push(QuorumOutput::MasterChanged {
                master: leader,
                term: self.term,
            });
        }
        outputs
    }

    fn handle_pre_vote(&self, req: RequestVote) -> Vec<QuorumOutput> {
        let granted = req.term > self.term
            && !self.in_lease()
            && req.state_version >= self.state_version
            && self.config.is_voter(req.candidate);
        let term = if granted { req.term } else { self.term };
        vec![QuorumOutput::Send(QuorumMessage::VoteResponse(VoteResponse {
            term,
            from: self.config.node_id,
            to: req.candidate,
            granted,
            pre_vote: true,
            state_version: self.state_version,
        }))]
    }

    fn handle_pre_vote_response(&mut self, resp: VoteResponse) -> Vec<QuorumOutput> {
        if self.role == QuorumRole::Leader
            || self.pre_votes.is_empty()
            || resp.term != self.term.next()
            || !self.config.is_voter(resp.from)
        {
            return Vec::new();
        }
        self.note_version(resp.state_version);
        self.pre_votes.insert(resp.from);
        if self.pre_votes.len() >= self.config.quorum_size() {
            return self.start_election();
        }
        Vec::new()
    }

    fn handle_request_vote(&mut self, req: RequestVote) -> Vec<QuorumOutput> {
        let mut outputs = Vec::new();

        let can_vote = match self.voted_for {
            None => true,
            Some(id) => id == req.candidate,
        };
        let granted = req.term == self.term
            && self.role != QuorumRole::Leader
            && self.leader.is_none()
            && can_vote
            && req.state_version >= self.state_version
            && self.config.is_voter(req.candidate);

        if granted {
            self.voted_for = Some(req.candidate);
            self.election_elapsed = 0;
            outputs.push(QuorumOutput::PersistVote(self.persistent_vote()));
        }
        debug!(
            node = %self.config.node_id,
            candidate = %req.candidate,
            term = self.term.get(),
            granted,
            "vote request"
        );
        outputs.push(self.vote_response(req.candidate, granted, false));
        outputs
    }

    fn handle_vote_response(&mut self, resp: VoteResponse) -> Vec<QuorumOutput> {
        if self.role != QuorumRole::Candidate || resp.term != self.term || resp.pre_vote {
            return Vec::new();
        }
        self.note_version(resp.state_version);
        if resp.granted && self.config.is_voter(resp.from) {
            self.votes.insert(resp.from);
            if self.votes.len() >= self.config.quorum_size() {
                return self.become_leader();
            }
        }
        Vec::new()
    }

    fn handle_heartbeat(&mut self, hb: Heartbeat) -> Vec<QuorumOutput> {
        let mut outputs = Vec::new();
        if hb.term == self.term && self.role != QuorumRole::Leader {
            outputs.extend(self.become_follower(hb.term, Some(hb.leader)));
            self.election_elapsed = 0;
            self.note_version(hb.state_version);
        }
        // A stale master learns our term from the ack and steps down.
        outputs.push(QuorumOutput::Send(QuorumMessage::HeartbeatAck(HeartbeatAck {
            term: self.term,
            from: self.config.node_id,
            to: hb.leader,
            state_version: self.state_version,
        })));
        outputs
    }

    fn handle_heartbeat_ack(&mut self, ack: HeartbeatAck) -> Vec<QuorumOutput> {
        if self.role != QuorumRole::Leader || ack.term != self.term {
            return Vec::new();
        }
        if self.config.is_voter(ack.from) {
            self.acks.insert(ack.from);
        }
        if ack.state_version < self.state_version {
            return vec![QuorumOutput::FollowerBehind {
                node: ack.from,
                version: ack.state_version,
            }];
        }
        Vec::new()
    }

    fn broadcast_heartbeat(&self) -> Vec<QuorumOutput> {
        self.config
            .peers()
            .into_iter()
            .map(|peer| {
                QuorumOutput::Send(QuorumMessage::Heartbeat(Heartbeat {
                    term: self.term,
                    leader: self.config.node_id,
                    to: peer,
                    state_version: self.state_version,
                }))
            })
            .collect()
    }

    fn vote_response(&self, candidate: NodeId, granted: bool, pre_vote: bool) -> QuorumOutput {
        QuorumOutput::Send(QuorumMessage::VoteResponse(VoteResponse {
            term: self.term,
            from: self.config.node_id,
            to: candidate,
            granted,
            pre_vote,
            state_version: self.state_version,
        }))
    }

    /// True while this node trusts a live master.
    fn in_lease(&self) -> bool {
        self.role == QuorumRole::Leader
            || (self.leader.is_some() && self.election_elapsed < self.config.election_tick)
    }

    fn note_version(&mut self, version: StateVersion) {
        if version > self.max_seen_version {
            self.max_seen_version = version;
        }
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        let jitter = if self.config.jitter_ticks == 0 {
            0
        } else {
            self.rng.gen_range(0..self.config.jitter_ticks)
        };
        // Lower node ids time out first: this is the tie-break between
        // otherwise equal candidates.
        self.election_timeout = self.config.election_tick
            + self.config.rank() * self.config.rank_step_ticks
            + jitter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ids: &[u64]) -> Vec<QuorumNode> {
        let voters: Vec<NodeId> = ids.iter().copied().map(NodeId::new).collect();
        ids.iter()
            .map(|&id| QuorumNode::new(QuorumConfig::new(NodeId::new(id), voters.clone())))
            .collect()
    }

    /// Delivers messages among `nodes` until quiet; `link` decides reachability.
    fn deliver(
        nodes: &mut [QuorumNode],
        mut pending: Vec<QuorumMessage>,
        link: &dyn Fn(NodeId, NodeId) -> bool,
    ) {
        let mut rounds = 0;
        while let Some(msg) = pending.pop() {
            rounds += 1;
            assert!(rounds < 10_000, "message storm");
            if !link(msg.from(), msg.to()) {
                continue;
            }
            if let Some(node) = nodes.iter_mut().find(|n| n.node_id() == msg.to()) {
                for out in node.handle_message(msg) {
                    if let QuorumOutput::Send(m) = out {
                        pending.push(m);
                    }
                }
            }
        }
    }

    fn run_ticks(
        nodes: &mut [QuorumNode],
        ticks: u32,
        link: &dyn Fn(NodeId, NodeId) -> bool,
    ) {
        for _ in 0..ticks {
            let mut pending = Vec::new();
            for node in nodes.iter_mut() {
                for out in node.tick() {
                    if let QuorumOutput::Send(m) = out {
                        pending.push(m);
                    }
                }
            }
            deliver(nodes, pending, link);
        }
    }

    fn all_links(_: NodeId, _: NodeId) -> bool {
        true
    }

    fn leaders(nodes: &[QuorumNode]) -> Vec<NodeId> {
        nodes.iter().filter(|n| n.is_master()).map(QuorumNode::node_id).collect()
    }

    #[test]
    fn test_new_node_is_follower() {
        let node = QuorumNode::new(QuorumConfig::new(NodeId::new(1), vec![NodeId::new(1)]));
        assert_eq!(node.role(), QuorumRole::Follower);
        assert_eq!(node.term(), TermId::new(0));
        assert!(node.current_master().is_none());
    }

    #[test]
    fn test_single_voter_elects_itself() {
        let mut nodes = cluster(&[1]);
        run_ticks(&mut nodes, 20, &all_links);
        assert_eq!(leaders(&nodes), vec![NodeId::new(1)]);
        assert_eq!(nodes[0].term(), TermId::new(1));
    }

    #[test]
    fn test_three_voters_elect_lowest_id() {
        let mut nodes = cluster(&[1, 2, 3]);
        run_ticks(&mut nodes, 40, &all_links);

        assert_eq!(leaders(&nodes), vec![NodeId::new(1)]);
        for node in &nodes {
            assert_eq!(node.current_master(), Some(NodeId::new(1)));
        }
    }

    #[test]
    fn test_minority_partition_never_elects() {
        let mut nodes = cluster(&[1, 2, 3]);
        // Node 1 is isolated; 2 and 3 can talk.
        let link = |a: NodeId, b: NodeId| a.get() != 1 && b.get() != 1;
        run_ticks(&mut nodes, 80, &link);

        let elected = leaders(&nodes);
        assert_eq!(elected.len(), 1);
        assert_ne!(elected[0], NodeId::new(1));
        // Pre-vote keeps the isolated node from inflating its term.
        assert_eq!(nodes[0].term(), TermId::new(0));
    }

    #[test]
    fn test_master_steps_down_without_quorum() {
        let mut nodes = cluster(&[1, 2, 3]);
        run_ticks(&mut nodes, 40, &all_links);
        assert!(nodes[0].is_master());

        let isolate_one = |a: NodeId, b: NodeId| a.get() != 1 && b.get() != 1;
        run_ticks(&mut nodes, 80, &isolate_one);

        assert!(!nodes[0].is_master());
        assert!(nodes[0].current_master().is_none());
        let elected = leaders(&nodes);
        assert_eq!(elected.len(), 1);
        assert_ne!(elected[0], NodeId::new(1));
    }

    #[test]
    fn test_vote_refused_to_stale_candidate() {
        let mut node =
            QuorumNode::new(QuorumConfig::new(NodeId::new(1), cluster_ids(&[1, 2, 3])));
        node.observe_state_version(StateVersion::new(10));

        let outputs = node.handle_message(QuorumMessage::RequestVote(RequestVote {
            term: TermId::new(1),
            candidate: NodeId::new(2),
            to: NodeId::new(1),
            state_version: StateVersion::new(9),
            pre_vote: false,
        }));

        let granted = outputs.iter().find_map(|o| match o {
            QuorumOutput::Send(QuorumMessage::VoteResponse(r)) => Some(r.granted),
            _ => None,
        });
        assert_eq!(granted, Some(false));
    }

    #[test]
    fn test_vote_not_granted_twice_in_term() {
        let mut node =
            QuorumNode::new(QuorumConfig::new(NodeId::new(1), cluster_ids(&[1, 2, 3])));
        let request = |candidate: u64| {
            QuorumMessage::RequestVote(RequestVote {
                term: TermId::new(1),
                candidate: NodeId::new(candidate),
                to: NodeId::new(1),
                state_version: StateVersion::new(0),
                pre_vote: false,
            })
        };

        let first = node.handle_message(request(2));
        assert!(first
            .iter()
            .any(|o| matches!(o, QuorumOutput::PersistVote(v) if v.voted_for == Some(NodeId::new(2)))));

        let second = node.handle_message(request(3));
        let granted = second.iter().find_map(|o| match o {
            QuorumOutput::Send(QuorumMessage::VoteResponse(r)) => Some(r.granted),
            _ => None,
        });
        assert_eq!(granted, Some(false));
    }

    #[test]
    fn test_new_master_reports_max_seen_version() {
        let mut node =
            QuorumNode::new(QuorumConfig::new(NodeId::new(1), cluster_ids(&[1, 2, 3])));

        let mut ticks = 0;
        while node.tick().is_empty() {
            ticks += 1;
            assert!(ticks < 100, "election timeout never fired");
        }

        let pre = VoteResponse {
            term: TermId::new(1),
            from: NodeId::new(2),
            to: NodeId::new(1),
            granted: true,
            pre_vote: true,
            state_version: StateVersion::new(3),
        };
        node.handle_message(QuorumMessage::VoteResponse(pre));
        assert_eq!(node.role(), QuorumRole::Candidate);
        assert_eq!(node.term(), TermId::new(1));

        let vote = VoteResponse {
            pre_vote: false,
            state_version: StateVersion::new(7),
            ..pre
        };
        let outputs = node.handle_message(QuorumMessage::VoteResponse(vote));
        assert!(outputs.contains(&QuorumOutput::BecameMaster {
            term: TermId::new(1),
            max_seen_version: StateVersion::new(7),
        }));
        assert!(node.is_master());
    }

    #[test]
    fn test_restore_keeps_term_and_vote() {
        let vote = PersistentVote {
            term: TermId::new(5),
            voted_for: Some(NodeId::new(2)),
        };
        let node = QuorumNode::restore(
            QuorumConfig::new(NodeId::new(1), cluster_ids(&[1, 2, 3])),
            vote,
        );
        assert_eq!(node.persistent_vote(), vote);
    }

    fn cluster_ids(ids: &[u64]) -> Vec<NodeId> {
        ids.iter().copied().map(NodeId::new).collect()
    }
}
