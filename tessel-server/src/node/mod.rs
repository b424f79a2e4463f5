//! A Tessel node.
//!
//! [`TesselNode`] ties the subsystems together on one process: the quorum
//! state machine (master-eligible nodes only), the applied cluster-state
//! view, local shard copies and, while elected, the master's membership
//! directory, allocator and lifecycle engine.
//!
//! All background work happens in [`TesselNode::tick`]. Request handlers
//! only touch local state and, on the master, publish new cluster states;
//! they never wait on a tick. No std mutex is held across an await.

mod master;
mod shards;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tessel_core::{
    IndexId, LifecyclePolicy, Millis, NodeId, NodeInfo, NodeStats, ShardId,
    StateVersion, TermId,
};
use tessel_lifecycle::SnapshotRepository;
use tessel_quorum::{JoinOutcome, PersistentVote, QuorumMessage, QuorumNode, QuorumOutput};
use tessel_replication::{
    Checkpoint, Document, Operation, Query, ReadRequest, ReadResponse, ReplicationError,
    ScatterGather, Scorer, TermScorer, WriteConsistency, DOC_ID_BYTES_MAX, TOP_K_MAX,
};
use tessel_routing::{
    Allocator, ClusterState, ClusterStateView, Health, Rebalancer, ShardRouter, StaleVersion,
};
use tracing::{debug, error, info, trace, warn};

use crate::api::{IndexSpec, WriteAck, WriteRequest};
use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::error::{ApiError, ApiResult};
use crate::state_store::{
    ClusterStateStore, PersistedState, SimulatedStateStorage, StateStoreResult,
};
use crate::transport::{
    ClusterRequest, ClusterResponse, ClusterTransport, RequestHandler, ShardRpc,
};

use self::master::MasterState;
use self::shards::{LocalShard, TaskKind};

/// Mutable node state. Guarded by one mutex that is never held across an
/// await.
struct NodeState<C: ClusterTransport> {
    quorum: Option<QuorumNode>,
    view: ClusterStateView,
    /// Publication received but not yet committed by the master.
    staged: Option<Arc<ClusterState>>,
    master: Option<MasterState>,
    /// Election won but master duties not yet assumed.
    pending_master: Option<(TermId, StateVersion)>,
    /// Quorum messages waiting for the next tick.
    outbox: Vec<QuorumMessage>,
    /// Voters whose state version lags the master's.
    behind: BTreeSet<NodeId>,
    /// Master learned from publications and redirects (non-voters).
    master_hint: Option<NodeId>,
    joined_master: Option<NodeId>,
    last_master_contact_ms: Option<Millis>,
    last_heartbeat_sent_ms: Option<Millis>,
    disk_used_ratio: f64,
    shards: BTreeMap<ShardId, LocalShard<C>>,
    attempts: BTreeMap<(ShardId, NodeId, TaskKind), Millis>,
}

struct NodeInner<C: ClusterTransport> {
    config: NodeConfig,
    transport: Arc<C>,
    rpc: Arc<ShardRpc<C>>,
    clock: Arc<dyn Clock>,
    repository: Arc<dyn SnapshotRepository>,
    scorer: Arc<dyn Scorer>,
    allocator: Allocator,
    rebalancer: Rebalancer,
    router: ShardRouter,
    scatter: ScatterGather<ShardRpc<C>>,
    store: Mutex<ClusterStateStore>,
    /// Serializes every master-side cluster-state change.
    publish_lock: tokio::sync::Mutex<()>,
    state: Mutex<NodeState<C>>,
}

/// Handle to a running node. Clones share the node.
pub struct TesselNode<C: ClusterTransport> {
    inner: Arc<NodeInner<C>>,
}

impl<C: ClusterTransport> Clone for TesselNode<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ClusterTransport> std::fmt::Debug for TesselNode<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TesselNode")
            .field("node_id", &self.inner.config.node_id)
            .finish_non_exhaustive()
    }
}

impl<C: ClusterTransport> TesselNode<C> {
    /// Creates a node. The cluster state is persisted under
    /// `config.data_dir`, or kept in memory when none is set.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: NodeConfig,
        transport: Arc<C>,
        clock: Arc<dyn Clock>,
        repository: Arc<dyn SnapshotRepository>,
    ) -> ApiResult<Self> {
        let store = match &config.data_dir {
            Some(dir) => ClusterStateStore::open_dir(dir),
            None => ClusterStateStore::new(Box::new(SimulatedStateStorage::new(config.seed))),
        };
        Self::with_store(config, transport, clock, repository, store)
    }

    /// Creates a node persisting its cluster state to `store`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn with_store(
        config: NodeConfig,
        transport: Arc<C>,
        clock: Arc<dyn Clock>,
        repository: Arc<dyn SnapshotRepository>,
        store: ClusterStateStore,
    ) -> ApiResult<Self> {
        config.validate()?;
        if transport.local_node() != config.node_id {
            return Err(ApiError::InvalidArgument {
                name: "transport",
                reason: format!(
                    "endpoint of {} used by {}",
                    transport.local_node(),
                    config.node_id
                ),
            });
        }

        let rpc = Arc::new(ShardRpc::new(Arc::clone(&transport)));
        let state = NodeState {
            quorum: config.quorum_config().map(QuorumNode::new),
            view: ClusterStateView::default(),
            staged: None,
            master: None,
            pending_master: None,
            outbox: Vec::new(),
            behind: BTreeSet::new(),
            master_hint: None,
            joined_master: None,
            last_master_contact_ms: None,
            last_heartbeat_sent_ms: None,
            disk_used_ratio: 0.0,
            shards: BTreeMap::new(),
            attempts: BTreeMap::new(),
        };
        info!(
            node = %config.node_id,
            voter = config.is_voter(),
            roles = ?config.roles,
            "node created"
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                allocator: Allocator::new(config.allocator.clone()),
                rebalancer: Rebalancer::new(config.rebalance),
                router: ShardRouter::new(),
                scatter: ScatterGather::new(Arc::clone(&rpc)),
                rpc,
                transport,
                clock,
                repository,
                scorer: Arc::new(TermScorer),
                store: Mutex::new(store),
                publish_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(state),
                config,
            }),
        })
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// The request handler to attach to the transport.
    #[must_use]
    pub fn handler(&self) -> Weak<dyn RequestHandler> {
        let weak: Weak<NodeInner<C>> = Arc::downgrade(&self.inner);
        weak
    }

    /// The latest applied cluster state.
    #[must_use]
    pub fn cluster_state(&self) -> Arc<ClusterState> {
        self.inner.lock().view.current()
    }

    /// Health derived from the applied shard map.
    #[must_use]
    pub fn cluster_health(&self) -> Health {
        self.inner.lock().view.current().health()
    }

    /// The master this node currently follows.
    #[must_use]
    pub fn current_master(&self) -> Option<NodeId> {
        let now = self.inner.clock.now_ms();
        self.inner.current_master_at(&self.inner.lock(), now)
    }

    /// Returns true if this node is the elected master and has taken over
    /// master duties.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.inner.lock().master.is_some()
    }

    /// Election term, for master-eligible nodes.
    #[must_use]
    pub fn term(&self) -> Option<TermId> {
        self.inner.lock().quorum.as_ref().map(QuorumNode::term)
    }

    /// Sets the disk usage reported with heartbeats.
    pub fn set_disk_used_ratio(&self, ratio: f64) {
        self.inner.lock().disk_used_ratio = ratio.clamp(0.0, 1.0);
    }

    /// Shards with a local copy.
    #[must_use]
    pub fn local_shards(&self) -> Vec<ShardId> {
        self.inner.lock().shards.keys().copied().collect()
    }

    /// A document from the local copy of `shard`.
    #[must_use]
    pub fn local_document(&self, shard: ShardId, doc_id: &str) -> Option<Document> {
        let engine = self.inner.engine(shard)?;
        let engine = engine.read().expect("engine lock poisoned");
        engine.get(doc_id)
    }

    /// The checkpoint of the local copy of `shard`.
    #[must_use]
    pub fn local_checkpoint(&self, shard: ShardId) -> Option<Checkpoint> {
        let engine = self.inner.engine(shard)?;
        let checkpoint = engine.read().expect("engine lock poisoned").checkpoint();
        Some(checkpoint)
    }

    /// Creates an index through the master.
    ///
    /// # Errors
    /// `AlreadyExists` if the name is taken, `NoMaster` if no master is
    /// reachable, `InvalidArgument` for out-of-range settings.
    pub async fn create_index(
        &self,
        name: &str,
        primary_shards: u32,
        replicas: u32,
        policy: LifecyclePolicy,
    ) -> ApiResult<IndexId> {
        let spec = IndexSpec::new(name, primary_shards, replicas).with_policy(policy);
        self.inner.validate_index(&spec)?;

        let master = self.current_master().ok_or(ApiError::NoMaster)?;
        match self
            .inner
            .transport
            .send(master, ClusterRequest::CreateIndex(spec))
            .await
        {
            Ok(ClusterResponse::IndexCreated(id)) => Ok(id),
            Ok(ClusterResponse::Api(e)) => Err(e),
            Ok(ClusterResponse::NotMaster { .. }) => Err(ApiError::NoMaster),
            Ok(other) => Err(ApiError::internal(format!("unexpected response {other:?}"))),
            Err(e) => {
                debug!(master = %master, error = %e, "master unreachable");
                Err(ApiError::NoMaster)
            }
        }
    }

    /// Writes one document operation. `routing_key` selects the shard.
    ///
    /// # Errors
    /// `NoMaster` while no master is known, `IndexNotFound`,
    /// `PrimaryUnavailable` if the shard's primary cannot be reached,
    /// `Timeout` if the consistency level was not met in time or the primary
    /// did not answer before the deadline. A timed-out write may still have
    /// been applied.
    pub async fn write(
        &self,
        index: &str,
        routing_key: &[u8],
        op: Operation,
        consistency: WriteConsistency,
        timeout: Option<Duration>,
    ) -> ApiResult<WriteAck> {
        let limits = &self.inner.config.limits;
        if op.doc_id().is_empty() || op.doc_id().len() > DOC_ID_BYTES_MAX {
            return Err(ApiError::InvalidArgument {
                name: "doc_id",
                reason: format!("must be 1..={DOC_ID_BYTES_MAX} bytes"),
            });
        }
        if op.source_len() > limits.max_document_bytes as usize {
            return Err(ApiError::InvalidArgument {
                name: "source",
                reason: format!("exceeds {} bytes", limits.max_document_bytes),
            });
        }
        if self.current_master().is_none() {
            return Err(ApiError::NoMaster);
        }

        let timeout = effective_timeout(limits, timeout);
        let route = ShardRouter::route_write(&self.cluster_state(), index, routing_key)?;
        let request = WriteRequest {
            shard: route.shard,
            op,
            consistency,
            timeout,
        };
        let forwarded = self
            .inner
            .transport
            .send(route.primary, ClusterRequest::Write(request));
        match tokio::time::timeout(timeout, forwarded).await {
            Ok(Ok(ClusterResponse::Written(ack))) => Ok(ack),
            Ok(Ok(ClusterResponse::Api(e))) => Err(e),
            Ok(Ok(other)) => Err(ApiError::internal(format!("unexpected response {other:?}"))),
            Ok(Err(e)) => Err(ApiError::unreachable_primary(route.shard, route.primary, &e)),
            Err(_) => {
                debug!(shard = %route.shard, primary = %route.primary, "write not answered before deadline");
                Err(ApiError::Timeout {
                    missing: Vec::new(),
                })
            }
        }
    }

    /// Runs `query` over every shard of `index`.
    ///
    /// Reads do not need a master; they use the latest applied state.
    ///
    /// # Errors
    /// `IndexNotFound`, `InvalidArgument` for malformed queries, or
    /// `Timeout` listing the missing shards when partial results are not
    /// allowed.
    pub async fn read(
        &self,
        index: &str,
        query: Query,
        timeout: Option<Duration>,
        partial_results_allowed: bool,
    ) -> ApiResult<ReadResponse> {
        validate_query(&query)?;
        let state = self.cluster_state();
        let routing = ShardRouter::resolve(&state, index)?;
        let targets = self.inner.router.read_targets(routing);
        let request = ReadRequest {
            query,
            timeout: effective_timeout(&self.inner.config.limits, timeout),
            partial_results_allowed,
        };
        self.inner
            .scatter
            .execute(targets, &request)
            .await
            .map_err(|e| match e {
                ReplicationError::Timeout { missing } => ApiError::Timeout { missing },
                other => ApiError::internal(other),
            })
    }

    /// Joins the current master, discovering it through the voters if
    /// needed. Returns the master.
    ///
    /// # Errors
    /// `NoMaster` if no master accepted the join.
    pub async fn join(&self) -> ApiResult<NodeId> {
        let now = self.inner.clock.now_ms();
        self.inner.heartbeat_master(now).await;
        let state = self.inner.lock();
        match (self.inner.current_master_at(&state, now), state.joined_master) {
            (Some(master), Some(joined)) if master == joined => Ok(master),
            _ => Err(ApiError::NoMaster),
        }
    }

    /// Runs one round of background work: election, membership, master
    /// duties and local shard maintenance.
    pub async fn tick(&self) {
        self.inner.tick().await;
    }

    /// Reloads the persisted cluster state and vote, then fetches newer
    /// states from reachable peers. Returns the version now applied.
    ///
    /// # Errors
    /// Returns an error if the persisted state is unreadable.
    pub async fn recover(&self) -> ApiResult<StateVersion> {
        let persisted = self.inner.store.lock().expect("store lock poisoned").load()?;
        if let Some(persisted) = persisted {
            let mut state = self.inner.lock();
            if let Some(config) = self.inner.config.quorum_config() {
                state.quorum = Some(QuorumNode::restore(config, persisted.vote));
            }
            let version = persisted.state.version;
            match self.inner.install(&mut state, Arc::new(persisted.state)) {
                Ok(()) => info!(
                    node = %self.node_id(),
                    version = version.get(),
                    term = persisted.vote.term.get(),
                    "restored persisted cluster state"
                ),
                Err(stale) => debug!(offered = %stale.offered, current = %stale.current, "persisted state not newer"),
            }
        }

        for peer in self.inner.peers() {
            self.inner.fetch_state_from(peer).await;
        }
        Ok(self.inner.lock().view.version())
    }
}

impl<C: ClusterTransport> NodeInner<C> {
    fn lock(&self) -> std::sync::MutexGuard<'_, NodeState<C>> {
        self.state.lock().expect("node state lock poisoned")
    }

    fn me(&self) -> NodeId {
        self.config.node_id
    }

    fn info(&self) -> NodeInfo {
        NodeInfo::new(self.me(), self.config.roles, self.config.attributes.clone())
    }

    fn current_master_at(&self, state: &NodeState<C>, now: Millis) -> Option<NodeId> {
        if let Some(quorum) = &state.quorum {
            return quorum.current_master();
        }
        let fresh = state
            .last_master_contact_ms
            .is_some_and(|t| now.saturating_sub(t) < self.config.limits.leave_after_ms);
        if fresh {
            state.master_hint
        } else {
            None
        }
    }

    /// Voters and known nodes other than this one.
    fn peers(&self) -> Vec<NodeId> {
        let known: Vec<NodeId> = self.lock().view.current().nodes.keys().copied().collect();
        let mut peers: BTreeSet<NodeId> = self.config.voters.iter().copied().collect();
        peers.extend(known);
        peers.remove(&self.me());
        peers.into_iter().collect()
    }

    fn validate_index(&self, spec: &IndexSpec) -> ApiResult<()> {
        let limits = &self.config.limits;
        if spec.name.is_empty() || spec.name.len() > limits.max_index_name_bytes as usize {
            return Err(ApiError::InvalidArgument {
                name: "name",
                reason: format!("must be 1..={} bytes", limits.max_index_name_bytes),
            });
        }
        limits.check_index_shape(spec.primary_shards, spec.replicas)?;
        spec.policy.validate()?;
        Ok(())
    }

    fn persist(&self, vote: PersistentVote, state: &ClusterState) -> StateStoreResult<()> {
        self.store.lock().expect("store lock poisoned").save(&PersistedState {
            vote,
            state: state.clone(),
        })
    }

    /// Applies `state` locally if it is newer than the current one.
    fn install(
        &self,
        guard: &mut NodeState<C>,
        state: Arc<ClusterState>,
    ) -> Result<(), StaleVersion> {
        guard.view.apply(Arc::clone(&state))?;
        if let Some(quorum) = guard.quorum.as_mut() {
            quorum.observe_state_version(state.version);
        }
        if state.master.is_some() {
            guard.master_hint = state.master;
        }
        self.reconcile_shards(&mut guard.shards, &state);
        debug!(
            node = %self.me(),
            version = state.version.get(),
            term = state.term.get(),
            "applied cluster state"
        );
        Ok(())
    }

    /// Applies and persists a state received from another node.
    fn accept_state(&self, state: Arc<ClusterState>) -> StateVersion {
        let mut guard = self.lock();
        if let Err(stale) = self.install(&mut guard, Arc::clone(&state)) {
            trace!(offered = %stale.offered, current = %stale.current, "ignoring stale cluster state");
            return stale.current;
        }
        let vote = guard
            .quorum
            .as_ref()
            .map(QuorumNode::persistent_vote)
            .unwrap_or_default();
        if let Err(e) = self.persist(vote, &state) {
            warn!(node = %self.me(), version = state.version.get(), error = %e, "failed to persist cluster state");
        }
        state.version
    }

    /// Fetches the latest state of `peer`. Returns true if it was newer.
    async fn fetch_state_from(&self, peer: NodeId) -> bool {
        let before = self.lock().view.version();
        match self.transport.send(peer, ClusterRequest::FetchState).await {
            Ok(ClusterResponse::State(state)) if state.version > before => {
                self.accept_state(state) > before
            }
            Ok(_) => false,
            Err(e) => {
                trace!(peer = %peer, error = %e, "state fetch failed");
                false
            }
        }
    }

    async fn tick(&self) {
        let now = self.clock.now_ms();
        self.tick_quorum().await;

        let pending = self.lock().pending_master.take();
        if let Some((term, max_seen)) = pending {
            self.assume_master(term, max_seen, now).await;
        }

        self.heartbeat_master(now).await;
        self.master_tick(now).await;
        self.shard_tick(now).await;
    }

    /// Advances the election clock and flushes queued quorum messages.
    async fn tick_quorum(&self) {
        let (messages, behind, current) = {
            let mut guard = self.lock();
            let outputs = match guard.quorum.as_mut() {
                Some(quorum) => quorum.tick(),
                None => return,
            };
            self.process_quorum_outputs(&mut guard, outputs);
            let behind = if guard.master.is_some() {
                std::mem::take(&mut guard.behind)
            } else {
                guard.behind.clear();
                BTreeSet::new()
            };
            (std::mem::take(&mut guard.outbox), behind, guard.view.current())
        };

        let sends = messages
            .into_iter()
            .map(|message| self.transport.send(message.to(), ClusterRequest::Quorum(message)));
        for result in join_all(sends).await {
            if let Err(e) = result {
                trace!(node = %self.me(), error = %e, "quorum message dropped");
            }
        }

        for node in behind {
            debug!(node = %node, version = current.version.get(), "re-sending cluster state to lagging voter");
            if let Err(e) = self
                .transport
                .send(node, ClusterRequest::CatchUp(Arc::clone(&current)))
                .await
            {
                trace!(node = %node, error = %e, "state push failed");
            }
        }
    }

    fn process_quorum_outputs(&self, guard: &mut NodeState<C>, outputs: Vec<QuorumOutput>) {
        let mut vote_unpersisted = false;
        for output in outputs {
            match output {
                QuorumOutput::PersistVote(vote) => {
                    let current = guard.view.current();
                    if let Err(e) = self.persist(vote, &current) {
                        error!(node = %self.me(), term = vote.term.get(), error = %e, "failed to persist vote");
                        vote_unpersisted = true;
                    }
                }
                QuorumOutput::Send(message) => {
                    if !vote_unpersisted {
                        guard.outbox.push(message);
                    }
                }
                QuorumOutput::BecameMaster {
                    term,
                    max_seen_version,
                } => {
                    guard.pending_master = Some((term, max_seen_version));
                }
                QuorumOutput::SteppedDown { term } => {
                    if guard.master.take().is_some() {
                        info!(node = %self.me(), term = term.get(), "stepped down from master duties");
                    }
                    guard.pending_master = None;
                }
                QuorumOutput::MasterChanged { master, term } => {
                    debug!(node = %self.me(), master = ?master, term = term.get(), "master changed");
                    if master != guard.joined_master {
                        guard.joined_master = None;
                    }
                }
                QuorumOutput::FollowerBehind { node, version } => {
                    trace!(node = %node, version = version.get(), "voter behind");
                    guard.behind.insert(node);
                }
            }
        }
    }

    /// Joins the master if needed and sends a heartbeat when one is due.
    async fn heartbeat_master(&self, now: Millis) {
        let (master, joined, due) = {
            let guard = self.lock();
            let due = guard.last_heartbeat_sent_ms.map_or(true, |t| {
                now.saturating_sub(t) >= self.config.limits.heartbeat_interval_ms
            });
            (self.current_master_at(&guard, now), guard.joined_master, due)
        };

        let Some(master) = master else {
            if !self.config.is_voter() {
                self.discover_master(now).await;
            }
            return;
        };
        if joined != Some(master) {
            if !self.join_master(master, now).await {
                return;
            }
        } else if !due {
            return;
        }
        self.send_heartbeat(master, now).await;
    }

    /// Asks the voters who the master is, joining it if one answers.
    async fn discover_master(&self, now: Millis) {
        for &seed in &self.config.voters {
            if seed == self.me() {
                continue;
            }
            if self.join_master(seed, now).await {
                self.send_heartbeat(seed, now).await;
                return;
            }
            let hint = self.lock().master_hint;
            if let Some(master) = hint.filter(|&m| m != seed) {
                if self.join_master(master, now).await {
                    self.send_heartbeat(master, now).await;
                    return;
                }
            }
        }
    }

    async fn join_master(&self, master: NodeId, now: Millis) -> bool {
        match self.transport.send(master, ClusterRequest::Join(self.info())).await {
            Ok(ClusterResponse::Joined(JoinOutcome::Accepted)) => {
                let mut guard = self.lock();
                guard.joined_master = Some(master);
                guard.master_hint = Some(master);
                guard.last_master_contact_ms = Some(now);
                info!(node = %self.me(), master = %master, "joined cluster");
                true
            }
            Ok(ClusterResponse::Joined(JoinOutcome::Rejected(reason))) => {
                warn!(node = %self.me(), master = %master, reason = ?reason, "join rejected");
                false
            }
            Ok(ClusterResponse::NotMaster { master: hint }) => {
                let mut guard = self.lock();
                guard.joined_master = None;
                if hint.is_some() {
                    guard.master_hint = hint;
                }
                false
            }
            Ok(other) => {
                debug!(master = %master, response = ?other, "unexpected join response");
                false
            }
            Err(e) => {
                trace!(master = %master, error = %e, "join failed");
                false
            }
        }
    }

    async fn send_heartbeat(&self, master: NodeId, now: Millis) {
        let heartbeat = {
            let mut guard = self.lock();
            guard.last_heartbeat_sent_ms = Some(now);
            self.heartbeat_body(&guard)
        };
        let local_version = heartbeat.version;

        match self
            .transport
            .send(master, ClusterRequest::Heartbeat(heartbeat))
            .await
        {
            Ok(ClusterResponse::HeartbeatAck { version }) => {
                self.lock().last_master_contact_ms = Some(now);
                if version > local_version {
                    self.fetch_state_from(master).await;
                }
            }
            Ok(ClusterResponse::MustRejoin) => {
                info!(node = %self.me(), master = %master, "master asked for a rejoin");
                self.lock().joined_master = None;
            }
            Ok(ClusterResponse::NotMaster { master: hint }) => {
                let mut guard = self.lock();
                guard.joined_master = None;
                if hint.is_some() {
                    guard.master_hint = hint;
                }
            }
            Ok(other) => debug!(master = %master, response = ?other, "unexpected heartbeat response"),
            Err(e) => trace!(master = %master, error = %e, "heartbeat failed"),
        }
    }

    /// Sends `request` to the master. Returns true if it was accepted.
    async fn report(&self, request: ClusterRequest) -> bool {
        let kind = request.kind();
        let master = {
            let now = self.clock.now_ms();
            self.current_master_at(&self.lock(), now)
        };
        let Some(master) = master else {
            debug!(kind, "no master to report to");
            return false;
        };
        match self.transport.send(master, request).await {
            Ok(ClusterResponse::Ack) => true,
            Ok(other) => {
                debug!(kind, master = %master, response = ?other, "report refused");
                false
            }
            Err(e) => {
                debug!(kind, master = %master, error = %e, "report failed");
                false
            }
        }
    }

    fn handle_quorum(&self, message: QuorumMessage) -> ClusterResponse {
        let mut guard = self.lock();
        let outputs = match guard.quorum.as_mut() {
            Some(quorum) => quorum.handle_message(message),
            None => return ClusterResponse::Ack,
        };
        self.process_quorum_outputs(&mut guard, outputs);
        ClusterResponse::Ack
    }

    /// Stages a publication. Voters refuse states from a term older than
    /// the one they have seen, so a deposed master cannot gather a majority.
    fn handle_publish(&self, from: NodeId, state: Arc<ClusterState>) -> ClusterResponse {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        let current = guard.view.version();
        let term = guard.quorum.as_ref().map(QuorumNode::term);
        if state.version <= current || term.is_some_and(|t| state.term < t) {
            trace!(
                from = %from,
                offered = %state.version,
                term = state.term.get(),
                "refusing publication"
            );
            return ClusterResponse::PublishRejected { current };
        }
        if state.master == Some(from) {
            guard.last_master_contact_ms = Some(now);
        }
        if let Some(quorum) = guard.quorum.as_mut() {
            quorum.observe_state_version(state.version);
        }
        let version = state.version;
        guard.staged = Some(state);
        ClusterResponse::Published { version }
    }

    fn handle_commit(&self, term: TermId, version: StateVersion) -> ClusterResponse {
        let staged = {
            let mut guard = self.lock();
            match guard.staged.take() {
                Some(state) if state.term == term && state.version == version => Some(state),
                other => {
                    guard.staged = other;
                    None
                }
            }
        };
        let current = match staged {
            Some(state) => self.accept_state(state),
            None => {
                debug!(node = %self.me(), version = version.get(), "commit for an unknown publication");
                self.lock().view.version()
            }
        };
        ClusterResponse::Published { version: current }
    }
}

#[async_trait]
impl<C: ClusterTransport> RequestHandler for NodeInner<C> {
    async fn handle(&self, from: NodeId, request: ClusterRequest) -> ClusterResponse {
        match request {
            ClusterRequest::Quorum(message) => self.handle_quorum(message),
            ClusterRequest::Join(info) => self.handle_join(info),
            ClusterRequest::Heartbeat(heartbeat) => self.handle_heartbeat(heartbeat),
            ClusterRequest::Publish(state) => self.handle_publish(from, state),
            ClusterRequest::Commit { term, version } => self.handle_commit(term, version),
            ClusterRequest::CatchUp(state) => ClusterResponse::Published {
                version: self.accept_state(state),
            },
            ClusterRequest::FetchState => ClusterResponse::State(self.lock().view.current()),
            ClusterRequest::CreateIndex(spec) => match self.create_index_on_master(spec).await {
                Ok(id) => ClusterResponse::IndexCreated(id),
                Err(e) => ClusterResponse::Api(e),
            },
            ClusterRequest::ShardStarted { shard, node } => {
                self.on_shard_event(|next, allocator| allocator.on_shard_started(next, shard, node))
                    .await
            }
            ClusterRequest::ShardFailed { shard, node } => {
                self.on_shard_event(|next, allocator| allocator.on_shard_failed(next, shard, node))
                    .await
            }
            ClusterRequest::ShardSnapshotted { shard } => {
                self.on_shard_event(|next, allocator| allocator.on_shard_snapshotted(next, shard))
                    .await
            }
            ClusterRequest::Write(request) => self.handle_write(request).await,
            ClusterRequest::Replicate {
                shard,
                primary_term,
                ops,
            } => self.handle_replicate(shard, primary_term, &ops),
            ClusterRequest::Checkpoint { shard } => self.handle_checkpoint(shard),
            ClusterRequest::Reset {
                shard,
                primary_term,
            } => self.handle_reset(shard, primary_term),
            ClusterRequest::Query { shard, query } => self.handle_query(shard, &query),
        }
    }
}

/// Clamps a caller timeout into the configured range.
fn effective_timeout(limits: &tessel_core::Limits, timeout: Option<Duration>) -> Duration {
    let requested = timeout.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    Duration::from_millis(limits.effective_timeout_ms(requested))
}

fn validate_query(query: &Query) -> ApiResult<()> {
    match query {
        Query::Search { k, .. } if *k == 0 || *k > TOP_K_MAX => Err(ApiError::InvalidArgument {
            name: "k",
            reason: format!("must be 1..={TOP_K_MAX}"),
        }),
        Query::Histogram { interval, .. } if !(interval.is_finite() && *interval > 0.0) => {
            Err(ApiError::InvalidArgument {
                name: "interval",
                reason: "must be positive".to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Default heartbeat payload stats.
const fn node_stats(disk_used_ratio: f64) -> NodeStats {
    NodeStats { disk_used_ratio }
}
