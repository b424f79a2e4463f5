//! In-process cluster harness.
//!
//! A [`TestCluster`] runs a set of [`TesselNode`]s over one [`LocalNetwork`]
//! with a shared [`ManualClock`]. Time only moves in [`TestCluster::step`]:
//! the clock advances one tick interval and every live node ticks once,
//! masters last so that membership sweeps see this step's heartbeats. After
//! every step the [`PropertyChecker`] records what each live node applied.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tessel_core::{Millis, NodeId, NodeRoles, TermId};
use tessel_lifecycle::InMemoryRepository;
use tessel_routing::{ClusterState, Health};
use tessel_server::{
    ClusterStateStore, LocalNetwork, LocalTransport, ManualClock, NodeConfig,
    SimulatedStateStorage, TesselNode,
};
use tracing::info;

use crate::properties::{NodeObservation, PropertyChecker};

/// Steps `run_until` takes before giving up.
pub const STEPS_MAX_DEFAULT: usize = 1_000;

/// Clock value the cluster starts at.
pub const START_MS: Millis = 1_000;

/// Node type used by every harness.
pub type Node = TesselNode<LocalTransport>;

/// Cluster shape.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    nodes: u64,
    voters: u64,
    roles: BTreeMap<u64, NodeRoles>,
    seed: u64,
}

impl ClusterBuilder {
    /// `nodes` nodes; the first `voters` are master-eligible.
    #[must_use]
    pub fn new(nodes: u64, voters: u64) -> Self {
        assert!(voters >= 1 && voters <= nodes, "need 1 <= voters <= nodes");
        Self {
            nodes,
            voters,
            roles: BTreeMap::new(),
            seed: 42,
        }
    }

    /// Overrides the roles of node `id`.
    #[must_use]
    pub fn with_roles(mut self, id: u64, roles: NodeRoles) -> Self {
        self.roles.insert(id, roles);
        self
    }

    /// Sets the election jitter seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Starts the cluster. No node has ticked yet.
    #[must_use]
    pub fn build(self) -> TestCluster {
        let voters: Vec<NodeId> = (1..=self.voters).map(NodeId::new).collect();
        let mut cluster = TestCluster {
            network: LocalNetwork::new(),
            clock: ManualClock::new(START_MS),
            repository: Arc::new(InMemoryRepository::new(self.seed)),
            voters,
            roles: self.roles,
            seed: self.seed,
            storages: BTreeMap::new(),
            nodes: BTreeMap::new(),
            crashed: BTreeSet::new(),
            checker: PropertyChecker::new(),
        };
        for id in (1..=self.nodes).map(NodeId::new) {
            let storage = SimulatedStateStorage::new(self.seed ^ id.get());
            let node = cluster.start(id, storage.clone());
            cluster.storages.insert(id, storage);
            cluster.nodes.insert(id, node);
        }
        cluster
    }
}

/// A running in-process cluster.
pub struct TestCluster {
    network: Arc<LocalNetwork>,
    clock: ManualClock,
    repository: Arc<InMemoryRepository>,
    voters: Vec<NodeId>,
    roles: BTreeMap<u64, NodeRoles>,
    seed: u64,
    storages: BTreeMap<NodeId, SimulatedStateStorage>,
    nodes: BTreeMap<NodeId, Node>,
    crashed: BTreeSet<NodeId>,
    checker: PropertyChecker,
}

impl TestCluster {
    fn start(&self, id: NodeId, storage: SimulatedStateStorage) -> Node {
        let mut config = NodeConfig::for_testing(id, self.voters.clone())
            .with_seed(self.seed.wrapping_mul(31).wrapping_add(id.get()));
        if let Some(roles) = self.roles.get(&id.get()) {
            config = config.with_roles(*roles);
        }
        let node = TesselNode::with_store(
            config,
            Arc::new(self.network.endpoint(id)),
            Arc::new(self.clock.clone()),
            self.repository.clone(),
            ClusterStateStore::new(Box::new(storage)),
        )
        .expect("valid node config");
        self.network.attach(id, node.handler());
        node
    }

    /// The node with id `id`.
    ///
    /// # Panics
    /// Panics if no such node exists.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(&id).expect("unknown node")
    }

    /// Ids of nodes that have not crashed.
    #[must_use]
    pub fn live(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| !self.crashed.contains(id))
            .collect()
    }

    /// The network, for partitions.
    #[must_use]
    pub const fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// The shared clock.
    #[must_use]
    pub const fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// The snapshot repository shared by every node.
    #[must_use]
    pub const fn repository(&self) -> &Arc<InMemoryRepository> {
        &self.repository
    }

    /// The property checker.
    #[must_use]
    pub const fn checker(&self) -> &PropertyChecker {
        &self.checker
    }

    /// Mutable access to the property checker.
    pub fn checker_mut(&mut self) -> &mut PropertyChecker {
        &mut self.checker
    }

    /// Live nodes acting as master.
    #[must_use]
    pub fn masters(&self) -> Vec<NodeId> {
        self.live()
            .into_iter()
            .filter(|id| self.node(*id).is_master())
            .collect()
    }

    /// The single live master, if exactly one exists.
    #[must_use]
    pub fn master(&self) -> Option<NodeId> {
        match self.masters().as_slice() {
            [master] => Some(*master),
            _ => None,
        }
    }

    /// The master's applied cluster state.
    ///
    /// # Panics
    /// Panics if there is no single master.
    #[must_use]
    pub fn master_state(&self) -> Arc<ClusterState> {
        self.node(self.master().expect("no single master")).cluster_state()
    }

    /// Advances the clock one tick interval and ticks every live node once.
    pub async fn step(&mut self) {
        let interval = self
            .nodes
            .values()
            .next()
            .map_or(50, |n| n.config().tick_interval_ms);
        self.clock.advance(interval);

        let live = self.live();
        let (masters, others): (Vec<NodeId>, Vec<NodeId>) =
            live.into_iter().partition(|id| self.node(*id).is_master());
        for id in others.into_iter().chain(masters) {
            self.node(id).tick().await;
        }
        self.record();
    }

    /// Steps `count` times.
    pub async fn run(&mut self, count: usize) {
        for _ in 0..count {
            self.step().await;
        }
    }

    fn record(&mut self) {
        let states: Vec<(NodeId, Arc<ClusterState>, bool, Option<TermId>)> = self
            .live()
            .into_iter()
            .map(|id| {
                let node = self.node(id);
                (id, node.cluster_state(), node.is_master(), node.term())
            })
            .collect();
        self.checker.record(states.iter().map(|(node, state, is_master, term)| {
            NodeObservation {
                node: *node,
                state: state.as_ref(),
                term: *term,
                is_master: *is_master,
            }
        }));
    }

    /// Steps until `done` holds or `max_steps` pass. Returns whether it held.
    pub async fn run_until(&mut self, max_steps: usize, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            self.step().await;
        }
        done(self)
    }

    /// Waits for one master that every live node follows and whose state
    /// lists every live node.
    ///
    /// # Panics
    /// Panics if the cluster does not settle.
    pub async fn elect(&mut self) -> NodeId {
        let settled = self
            .run_until(STEPS_MAX_DEFAULT, |c| {
                let Some(master) = c.master() else {
                    return false;
                };
                let state = c.node(master).cluster_state();
                c.live().iter().all(|id| {
                    c.node(*id).current_master() == Some(master) && state.nodes.contains_key(id)
                })
            })
            .await;
        assert!(settled, "cluster never settled on a master");
        let master = self.master().expect("settled");
        info!(master = %master, "cluster settled");
        master
    }

    /// Waits until every live node reports `health`.
    ///
    /// # Panics
    /// Panics if it does not happen in time.
    pub async fn wait_health(&mut self, health: Health) {
        let reached = self
            .run_until(STEPS_MAX_DEFAULT, |c| {
                c.live().iter().all(|id| c.node(*id).cluster_health() == health)
            })
            .await;
        assert!(reached, "cluster never reached {health:?}");
    }

    /// Cuts a node off and stops ticking it.
    pub fn crash(&mut self, id: NodeId) {
        info!(node = %id, "crashing node");
        self.network.isolate(id);
        self.crashed.insert(id);
    }

    /// Reconnects a crashed node's original process and resumes ticking it,
    /// as after a network outage.
    pub fn revive(&mut self, id: NodeId) {
        info!(node = %id, "reviving node");
        self.network.reconnect(id);
        self.crashed.remove(&id);
    }

    /// Replaces a crashed node with a fresh process over the same persisted
    /// state, reconnects it and recovers.
    ///
    /// # Panics
    /// Panics if recovery fails.
    pub async fn restart(&mut self, id: NodeId) {
        info!(node = %id, "restarting node");
        let storage = self.storages.get(&id).expect("unknown node").clone();
        self.network.detach(id);
        let node = self.start(id, storage);
        self.network.reconnect(id);
        node.recover().await.expect("recovery succeeds");
        self.nodes.insert(id, node);
        self.crashed.remove(&id);
    }

    /// Splits the cluster in two.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        info!(?left, ?right, "partitioning");
        self.network.partition(left, right);
    }

    /// Restores every link. Crashed nodes stay isolated.
    pub fn heal(&self) {
        self.network.heal();
        for id in &self.crashed {
            self.network.isolate(*id);
        }
    }
}
