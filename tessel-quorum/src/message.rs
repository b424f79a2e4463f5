//! Quorum RPC message types.
//!
//! Every message carries the sender's term. Vote and heartbeat traffic also
//! carries the sender's last applied cluster-state version so that voters can
//! refuse candidates that are behind and a new master knows the highest
//! version any voter has seen.

use tessel_core::{NodeId, StateVersion, TermId};

/// Messages exchanged between master-eligible nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumMessage {
    /// Candidate asks for a vote.
    RequestVote(RequestVote),
    /// Voter answers a vote request.
    VoteResponse(VoteResponse),
    /// Master asserts its leadership.
    Heartbeat(Heartbeat),
    /// Follower acknowledges a heartbeat.
    HeartbeatAck(HeartbeatAck),
}

impl QuorumMessage {
    /// Returns the source node ID of this message.
    #[must_use]
    pub const fn from(&self) -> NodeId {
        match self {
            Self::RequestVote(r) => r.candidate,
            Self::VoteResponse(r) => r.from,
            Self::Heartbeat(r) => r.leader,
            Self::HeartbeatAck(r) => r.from,
        }
    }

    /// Returns the destination node ID of this message.
    #[must_use]
    pub const fn to(&self) -> NodeId {
        match self {
            Self::RequestVote(r) => r.to,
            Self::VoteResponse(r) => r.to,
            Self::Heartbeat(r) => r.to,
            Self::HeartbeatAck(r) => r.to,
        }
    }

    /// Returns the term of this message.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::RequestVote(r) => r.term,
            Self::VoteResponse(r) => r.term,
            Self::Heartbeat(r) => r.term,
            Self::HeartbeatAck(r) => r.term,
        }
    }
}

/// Vote request from a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVote {
    /// Candidate's term.
    pub term: TermId,
    /// Candidate requesting the vote.
    pub candidate: NodeId,
    /// Target voter.
    pub to: NodeId,
    /// Highest cluster-state version the candidate has applied.
    pub state_version: StateVersion,
    /// Pre-vote probe: asks whether a real vote would be granted at `term`
    /// without changing any voter state.
    pub pre_vote: bool,
}

/// Answer to a [`RequestVote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteResponse {
    /// Voter's current term.
    pub term: TermId,
    /// Voter.
    pub from: NodeId,
    /// Candidate.
    pub to: NodeId,
    /// True if the vote was granted.
    pub granted: bool,
    /// Answer to a pre-vote probe.
    pub pre_vote: bool,
    /// Highest cluster-state version the voter has applied.
    pub state_version: StateVersion,
}

/// Leadership heartbeat from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Master's term.
    pub term: TermId,
    /// The master.
    pub leader: NodeId,
    /// Target follower.
    pub to: NodeId,
    /// Latest version the master has published.
    pub state_version: StateVersion,
}

/// Follower's answer to a [`Heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    /// Follower's term.
    pub term: TermId,
    /// Follower.
    pub from: NodeId,
    /// Master.
    pub to: NodeId,
    /// Highest version the follower has applied.
    pub state_version: StateVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let msg = QuorumMessage::RequestVote(RequestVote {
            term: TermId::new(4),
            candidate: NodeId::new(1),
            to: NodeId::new(2),
            state_version: StateVersion::new(9),
            pre_vote: false,
        });
        assert_eq!(msg.from(), NodeId::new(1));
        assert_eq!(msg.to(), NodeId::new(2));
        assert_eq!(msg.term(), TermId::new(4));
    }
}
