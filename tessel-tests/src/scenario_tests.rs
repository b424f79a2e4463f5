//! The documented cluster scenarios.

use tessel_core::{
    IndexId, LifecyclePhase, LifecyclePolicy, NodeId, NodeRoles, ShardId, ShardOrdinal, DAY_MS,
};
use tessel_replication::{Query, WriteConsistency};
use tessel_routing::{CopyRole, CopyState, Health, UnassignedReason, Veto};

use crate::cluster::{ClusterBuilder, TestCluster, STEPS_MAX_DEFAULT};
use crate::scenarios::{clusters, docs, policies};

fn cluster((nodes, voters): (u64, u64)) -> TestCluster {
    ClusterBuilder::new(nodes, voters).build()
}

async fn create(
    cluster: &TestCluster,
    via: NodeId,
    name: &str,
    primaries: u32,
    replicas: u32,
    policy: LifecyclePolicy,
) -> IndexId {
    cluster
        .node(via)
        .create_index(name, primaries, replicas, policy)
        .await
        .expect("index created")
}

/// Waits until every primary of every index is active, then starts a fresh
/// health window.
async fn wait_primaries_active(cluster: &mut TestCluster) {
    let active = cluster
        .run_until(STEPS_MAX_DEFAULT, |c| {
            c.live()
                .iter()
                .all(|id| c.node(*id).cluster_health() != Health::Red)
        })
        .await;
    assert!(active, "primaries never became active");
    cluster.checker_mut().reset_health();
}

// ----------------------------------------------------------------------------
// Scenario A
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_a_losing_two_non_masters_keeps_master() {
    let mut cluster = cluster(clusters::FIVE_NODE);
    let master = cluster.elect().await;
    let index = create(&cluster, master, "logs", 2, 2, LifecyclePolicy::keep_hot("hot")).await;
    cluster.wait_health(Health::Green).await;

    let term = cluster.node(master).term();
    let terms_before = cluster.checker().master_terms();
    let victims: Vec<NodeId> = cluster
        .live()
        .into_iter()
        .rev()
        .filter(|id| *id != master)
        .take(2)
        .collect();
    cluster.checker_mut().reset_health();
    for victim in &victims {
        cluster.crash(*victim);
    }

    // The departed copies are replaced on the three survivors.
    let recovered = cluster
        .run_until(STEPS_MAX_DEFAULT, |c| {
            let state = c.node(master).cluster_state();
            state.health() == Health::Green
                && victims.iter().all(|v| state.shard_map.shards_on(*v).is_empty())
        })
        .await;
    assert!(recovered, "replicas never reassigned");

    assert_eq!(cluster.master(), Some(master));
    assert_eq!(cluster.node(master).term(), term);
    assert_eq!(cluster.checker().master_terms(), terms_before);
    assert!(cluster.checker().worst_health() <= Some(Health::Yellow));

    let state = cluster.master_state();
    let routing = state.shard_map.index(index).expect("index kept");
    assert_eq!(routing.groups.len(), 2);
    for group in &routing.groups {
        assert_eq!(group.active_nodes().len(), 3);
    }
    cluster.checker().assert_ok();
}

// ----------------------------------------------------------------------------
// Scenario B
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_b_unplaceable_replicas_stay_yellow() {
    // Nodes 1 and 2 hold data; node 3 only votes.
    let mut cluster = ClusterBuilder::new(3, 3)
        .with_roles(3, NodeRoles::MASTER_ONLY)
        .build();
    let master = cluster.elect().await;

    // Node 2 is over the disk watermark, so only node 1 takes copies.
    // A few heartbeat intervals carry the usage to the master's directory.
    cluster.node(NodeId::new(2)).set_disk_used_ratio(0.95);
    cluster.run(10).await;

    let index = create(&cluster, master, "logs", 3, 1, LifecyclePolicy::keep_hot("hot")).await;
    wait_primaries_active(&mut cluster).await;
    cluster.run(50).await;

    let state = cluster.master_state();
    assert_eq!(state.health(), Health::Yellow);
    assert_eq!(cluster.checker().worst_health(), Some(Health::Yellow));
    let routing = state.shard_map.index(index).expect("index exists");
    for group in &routing.groups {
        let primary = group.primary().expect("primary");
        assert_eq!(primary.node, Some(NodeId::new(1)));
        assert!(primary.state.is_active());

        let replica = group.replicas().next().expect("replica");
        assert_eq!(replica.state, CopyState::Unassigned);
        let Some(UnassignedReason::NoEligibleNode { vetoes }) = &replica.unassigned_reason else {
            panic!("replica left unassigned without a reason: {replica:?}");
        };
        assert!(vetoes.contains(&Veto::SameShard));
        assert!(vetoes.contains(&Veto::DiskWatermark));
        assert!(vetoes.contains(&Veto::NotDataNode));
    }
    cluster.checker().assert_ok();
}

#[tokio::test]
async fn test_scenario_b_more_replicas_than_data_nodes_stays_yellow() {
    let mut cluster = ClusterBuilder::new(3, 3)
        .with_roles(3, NodeRoles::MASTER_ONLY)
        .build();
    let master = cluster.elect().await;

    let index = create(&cluster, master, "logs", 3, 2, LifecyclePolicy::keep_hot("hot")).await;
    wait_primaries_active(&mut cluster).await;
    cluster.wait_health(Health::Yellow).await;
    cluster.run(50).await;

    let state = cluster.master_state();
    assert_eq!(cluster.checker().worst_health(), Some(Health::Yellow));
    for group in &state.shard_map.index(index).expect("index exists").groups {
        assert_eq!(group.active_nodes().len(), 2);
        assert_eq!(
            group
                .copies
                .iter()
                .filter(|c| c.state == CopyState::Unassigned)
                .count(),
            1
        );
    }
    cluster.checker().assert_ok();
}

// ----------------------------------------------------------------------------
// Scenario C
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_c_write_survives_down_replica_which_resyncs() {
    let mut cluster = cluster(clusters::THREE_PLUS_TWO);
    let master = cluster.elect().await;
    let index = create(&cluster, master, "logs", 3, 2, LifecyclePolicy::keep_hot("hot")).await;
    cluster.wait_health(Health::Green).await;

    let shard = ShardId::new(index, ShardOrdinal::new(2));
    let key = docs::key_for_ordinal(2, 3);
    let group = cluster
        .master_state()
        .shard_map
        .group(shard)
        .expect("group")
        .clone();
    let primary = group.active_primary_node().expect("primary");
    let down = group
        .replicas()
        .filter_map(|c| c.node)
        .find(|n| *n != master)
        .or_else(|| group.replicas().find_map(|c| c.node))
        .expect("replica");
    let coordinator = cluster
        .live()
        .into_iter()
        .find(|n| *n != down)
        .expect("coordinator");

    cluster.crash(down);
    let ack = cluster
        .node(coordinator)
        .write(
            "logs",
            key.as_bytes(),
            docs::index(&key, "written while a replica was down"),
            WriteConsistency::AllInSync,
            None,
        )
        .await
        .expect("write acknowledged by primary and remaining replica");
    assert_eq!(ack.shard, shard);

    // The surviving copies hold the write; the down replica was marked
    // out of sync before the acknowledgement.
    assert!(cluster.node(primary).local_document(shard, &key).is_some());
    let stale = cluster
        .master_state()
        .shard_map
        .group(shard)
        .and_then(|g| g.copy_on(down).cloned())
        .expect("down replica still assigned");
    assert_eq!(stale.role, CopyRole::Replica);
    assert_eq!(stale.state, CopyState::Initializing);

    cluster.revive(down);
    let resynced = cluster
        .run_until(STEPS_MAX_DEFAULT, |c| {
            let in_sync = c
                .master_state()
                .shard_map
                .group(shard)
                .and_then(|g| g.copy_on(down).map(|copy| copy.state == CopyState::InSync))
                .unwrap_or(false);
            in_sync && c.node(down).local_document(shard, &key).is_some()
        })
        .await;
    assert!(resynced, "down replica never resynced");

    let checkpoint = cluster.node(down).local_checkpoint(shard).expect("copy");
    assert_eq!(checkpoint.max_seq_no, ack.seq_no);
    cluster.checker().assert_ok();
}

// ----------------------------------------------------------------------------
// Scenario D
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_d_lifecycle_never_skips_warm() {
    let mut cluster = cluster(clusters::THREE_NODE);
    let master = cluster.elect().await;
    let index = create(&cluster, master, "logs", 1, 1, policies::hot_warm_delete()).await;
    cluster.wait_health(Health::Green).await;
    cluster
        .node(master)
        .write(
            "logs",
            b"a",
            docs::index("a", "first entry"),
            WriteConsistency::AllInSync,
            None,
        )
        .await
        .expect("write acknowledged");

    let hot = cluster.master_state().lifecycle.get(&index).map(|r| r.phase);
    assert_eq!(hot, Some(LifecyclePhase::Hot));

    // Day 31: both the warm and the delete thresholds have passed.
    cluster.clock().advance(31 * DAY_MS);
    let mut phases = vec![LifecyclePhase::Hot];
    let mut saw_read_only_warm = false;
    for _ in 0..STEPS_MAX_DEFAULT {
        cluster.step().await;
        let state = cluster.master_state();
        match state.lifecycle.get(&index) {
            Some(record) => {
                if phases.last() != Some(&record.phase) {
                    phases.push(record.phase);
                }
                if record.phase == LifecyclePhase::Warm {
                    let meta = &state.shard_map.index(index).expect("warm index").meta;
                    saw_read_only_warm |= meta.read_only && meta.replicas == 0;
                }
            }
            None => {
                assert!(state.shard_map.index(index).is_none());
                phases.push(LifecyclePhase::Deleted);
                break;
            }
        }
    }

    assert_eq!(
        phases,
        vec![LifecyclePhase::Hot, LifecyclePhase::Warm, LifecyclePhase::Deleted]
    );
    assert!(saw_read_only_warm, "warm actions never published");

    // Every node drops its copies.
    let dropped = cluster
        .run_until(STEPS_MAX_DEFAULT, |c| {
            c.live().iter().all(|id| c.node(*id).local_shards().is_empty())
        })
        .await;
    assert!(dropped);

    let result = cluster
        .node(master)
        .read("logs", Query::Search { text: "entry".to_string(), k: 5 }, None, false)
        .await;
    assert!(result.is_err());
    cluster.checker().assert_ok();
}
