//! Membership directory.
//!
//! Tracks every node that has joined, its roles and attributes, and its
//! liveness as derived from heartbeat timestamps. The directory runs on the
//! master; its contents are published to the rest of the cluster inside the
//! cluster state.
//!
//! Liveness transitions are driven only by [`MembershipDirectory::heartbeat`]
//! and [`MembershipDirectory::sweep`], both of which take an explicit
//! timestamp.

use std::collections::BTreeMap;

use tessel_core::{Limits, Liveness, Millis, NodeId, NodeInfo, NodeStats};
use thiserror::Error;
use tracing::{info, warn};

/// Errors returned by the membership directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    /// The node has never joined, or was removed.
    #[error("unknown node: {node}")]
    UnknownNode {
        /// The node.
        node: NodeId,
    },

    /// The node was declared left and must join again.
    #[error("node {node} has left the cluster and must rejoin")]
    MustRejoin {
        /// The node.
        node: NodeId,
    },
}

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The directory is at its node limit.
    DirectoryFull,
    /// A live node with the same id but different roles is already a member.
    IdConflict,
}

/// Result of a join handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The node is now a member.
    Accepted,
    /// The node was refused.
    Rejected(RejectReason),
}

/// Liveness change observed by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node joined (or rejoined after leaving).
    Joined(NodeId),
    /// A joining node sent its first heartbeat.
    Activated(NodeId),
    /// A suspected node heartbeated again.
    Recovered(NodeId),
    /// A node missed heartbeats.
    Suspected(NodeId),
    /// A node is considered gone; its copies must be reallocated.
    Left(NodeId),
    /// A left node was dropped from the directory after the grace period.
    Removed(NodeId),
}

impl MembershipEvent {
    /// The node the event is about.
    #[must_use]
    pub const fn node(self) -> NodeId {
        match self {
            Self::Joined(n)
            | Self::Activated(n)
            | Self::Recovered(n)
            | Self::Suspected(n)
            | Self::Left(n)
            | Self::Removed(n) => n,
        }
    }

    /// Returns true if allocation must be recomputed after this event.
    #[must_use]
    pub const fn affects_allocation(self) -> bool {
        !matches!(self, Self::Suspected(_) | Self::Removed(_))
    }
}

/// Liveness timings of the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipTimings {
    /// Silence after which an alive node becomes suspected.
    pub suspect_after_ms: Millis,
    /// Silence after which a suspected node is considered left.
    pub leave_after_ms: Millis,
    /// Time a left node stays in the directory before removal.
    pub removal_grace_ms: Millis,
    /// Maximum number of members.
    pub max_nodes: u32,
}

impl MembershipTimings {
    /// Derives timings from the system limits.
    #[must_use]
    pub const fn from_limits(limits: &Limits) -> Self {
        Self {
            suspect_after_ms: limits.suspect_after_ms,
            leave_after_ms: limits.leave_after_ms,
            removal_grace_ms: limits.removal_grace_ms,
            max_nodes: limits.max_nodes,
        }
    }
}

impl Default for MembershipTimings {
    fn default() -> Self {
        Self::from_limits(&Limits::new())
    }
}

/// The set of known nodes and their liveness.
#[derive(Debug, Clone)]
pub struct MembershipDirectory {
    timings: MembershipTimings,
    nodes: BTreeMap<NodeId, NodeInfo>,
    left_at: BTreeMap<NodeId, Millis>,
}

impl MembershipDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub const fn new(timings: MembershipTimings) -> Self {
        Self {
            timings,
            nodes: BTreeMap::new(),
            left_at: BTreeMap::new(),
        }
    }

    /// Rebuilds a directory from a published node list.
    ///
    /// Used by a newly elected master: heartbeat timestamps are reset to
    /// `now_ms` so that nodes are not declared dead for the time the
    /// previous master was in charge.
    #[must_use]
    pub fn from_nodes(
        timings: MembershipTimings,
        nodes: impl IntoIterator<Item = NodeInfo>,
        now_ms: Millis,
    ) -> Self {
        let mut dir = Self::new(timings);
        for mut node in nodes {
            node.last_heartbeat_ms = now_ms;
            if node.liveness == Liveness::Left {
                dir.left_at.insert(node.id, now_ms);
            }
            dir.nodes.insert(node.id, node);
        }
        dir
    }

    /// Handles a join handshake.
    pub fn join(&mut self, mut info: NodeInfo, now_ms: Millis) -> (JoinOutcome, Option<MembershipEvent>) {
        let id = info.id;

        if let Some(existing) = self.nodes.get(&id) {
            if existing.liveness != Liveness::Left && existing.roles != info.roles {
                warn!(node = %id, "join rejected: id held by a live node with other roles");
                return (JoinOutcome::Rejected(RejectReason::IdConflict), None);
            }
        } else if self.nodes.len() >= self.timings.max_nodes as usize {
            warn!(node = %id, max = self.timings.max_nodes, "join rejected: directory full");
            return (JoinOutcome::Rejected(RejectReason::DirectoryFull), None);
        }

        // A live node rejoining (e.g. after a restart) keeps its liveness.
        let rejoin_live = self
            .nodes
            .get(&id)
            .is_some_and(|n| n.liveness != Liveness::Left);
        info.last_heartbeat_ms = now_ms;
        if rejoin_live {
            info.liveness = Liveness::Alive;
        } else {
            info.liveness = Liveness::Joining;
        }
        self.left_at.remove(&id);
        self.nodes.insert(id, info);

        if rejoin_live {
            return (JoinOutcome::Accepted, None);
        }
        info!(node = %id, "node joined");
        (JoinOutcome::Accepted, Some(MembershipEvent::Joined(id)))
    }

    /// Records a heartbeat.
    ///
    /// # Errors
    /// Returns an error if the node is unknown or has been declared left.
    pub fn heartbeat(
        &mut self,
        node: NodeId,
        stats: NodeStats,
        now_ms: Millis,
    ) -> Result<Option<MembershipEvent>, MembershipError> {
        let info = self
            .nodes
            .get_mut(&node)
            .ok_or(MembershipError::UnknownNode { node })?;

        if info.liveness == Liveness::Left {
            return Err(MembershipError::MustRejoin { node });
        }

        info.last_heartbeat_ms = info.last_heartbeat_ms.max(now_ms);
        info.stats = stats;

        let event = match info.liveness {
            Liveness::Joining => Some(MembershipEvent::Activated(node)),
            Liveness::Suspected => {
                info!(node = %node, "suspected node recovered");
                Some(MembershipEvent::Recovered(node))
            }
            Liveness::Alive | Liveness::Left => None,
        };
        info.liveness = Liveness::Alive;
        Ok(event)
    }

    /// Applies heartbeat timeouts at `now_ms`.
    pub fn sweep(&mut self, now_ms: Millis) -> Vec<MembershipEvent> {
        let mut events = Vec::new();

        for (id, info) in &mut self.nodes {
            let silent = now_ms.saturating_sub(info.last_heartbeat_ms);
            match info.liveness {
                Liveness::Joining | Liveness::Alive if silent >= self.timings.leave_after_ms => {
                    info.liveness = Liveness::Left;
                    self.left_at.insert(*id, now_ms);
                    events.push(MembershipEvent::Left(*id));
                }
                Liveness::Joining | Liveness::Alive if silent >= self.timings.suspect_after_ms => {
                    info.liveness = Liveness::Suspected;
                    events.push(MembershipEvent::Suspected(*id));
                }
                Liveness::Suspected if silent >= self.timings.leave_after_ms => {
                    info.liveness = Liveness::Left;
                    self.left_at.insert(*id, now_ms);
                    events.push(MembershipEvent::Left(*id));
                }
                _ => {}
            }
        }

        let grace = self.timings.removal_grace_ms;
        let expired: Vec<NodeId> = self
            .left_at
            .iter()
            .filter(|(_, &at)| now_ms.saturating_sub(at) >= grace)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            self.left_at.remove(&id);
            self.nodes.remove(&id);
            events.push(MembershipEvent::Removed(id));
        }

        for event in &events {
            match event {
                MembershipEvent::Suspected(n) => warn!(node = %n, "node suspected"),
                MembershipEvent::Left(n) => warn!(node = %n, "node left"),
                MembershipEvent::Removed(n) => info!(node = %n, "node removed"),
                _ => {}
            }
        }
        events
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&node)
    }

    /// All known nodes, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Number of known nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no node has joined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
