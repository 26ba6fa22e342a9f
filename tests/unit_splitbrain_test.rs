// tests/unit_splitbrain_test.rs

//! Split-brain guard scenarios: timeline, priority and node-id tie-breaks
//! with two primaries, and the unconditional stop with three.

mod common;

use common::*;
use replguard::core::link::Connector;
use replguard::core::metastore::MetaStore as _;
use replguard::core::splitbrain::SplitBrainGuard;
use replguard::core::types::{BrainSplitAction, NodeType, RecoveryType};
use std::sync::Arc;

/// Two-primary cluster: nodes 1 and 4 both believe they are primary.
fn two_primary_cluster() -> Arc<SimCluster> {
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 100));
    cluster.add_node(node_record(4, NodeType::Primary, None, 100));
    for id in [1, 4] {
        cluster.with_node(id, |n| {
            n.recovery = RecoveryType::Primary;
            n.repl.in_recovery = false;
            n.identity.timeline = 7;
        });
    }
    cluster
}

async fn run_guard(cluster: &Arc<SimCluster>, local_id: i32) -> BrainSplitAction {
    let connector: Arc<dyn Connector> = Arc::new(SimConnector {
        cluster: cluster.clone(),
    });
    let local = connector.connect(&conninfo_for(local_id)).await.unwrap();
    let local_node = cluster.record_of(local_id);
    let all_nodes = local.get_all_nodes().await.unwrap();

    SplitBrainGuard {
        connector: &connector,
        local: &local,
        local_node: &local_node,
    }
    .check(&all_nodes)
    .await
    .expect("guard runs")
}

#[tokio::test]
async fn equal_timeline_and_priority_higher_id_loses() {
    let cluster = two_primary_cluster();

    // Node 4 has the higher id and must stand down.
    assert_eq!(run_guard(&cluster, 4).await, BrainSplitAction::DoRejoin);
    // Node 1 keeps the primary role.
    assert_eq!(run_guard(&cluster, 1).await, BrainSplitAction::DoNothing);
}

#[tokio::test]
async fn lower_timeline_always_loses() {
    let cluster = two_primary_cluster();
    cluster.set_timeline(1, 6);

    assert_eq!(run_guard(&cluster, 1).await, BrainSplitAction::DoRejoin);
    assert_eq!(run_guard(&cluster, 4).await, BrainSplitAction::DoNothing);
}

#[tokio::test]
async fn lower_priority_loses_on_equal_timeline() {
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 50));
    cluster.add_node(node_record(4, NodeType::Primary, None, 100));
    for id in [1, 4] {
        cluster.with_node(id, |n| {
            n.recovery = RecoveryType::Primary;
            n.repl.in_recovery = false;
            n.identity.timeline = 7;
        });
    }

    assert_eq!(run_guard(&cluster, 1).await, BrainSplitAction::DoRejoin);
    assert_eq!(run_guard(&cluster, 4).await, BrainSplitAction::DoNothing);
}

#[tokio::test]
async fn three_primaries_stop_everywhere() {
    let cluster = SimCluster::new();
    for id in [1, 2, 3] {
        cluster.add_node(node_record(id, NodeType::Primary, None, 100));
        cluster.with_node(id, |n| {
            n.recovery = RecoveryType::Primary;
            n.repl.in_recovery = false;
        });
    }

    for id in [1, 2, 3] {
        assert_eq!(run_guard(&cluster, id).await, BrainSplitAction::DoStop);
    }
}

#[tokio::test]
async fn healthy_cluster_takes_no_action() {
    let cluster = three_node_cluster();
    assert_eq!(run_guard(&cluster, 1).await, BrainSplitAction::DoNothing);
}

#[tokio::test]
async fn witnesses_and_unreachable_peers_are_ignored() {
    let cluster = two_primary_cluster();
    cluster.add_node(node_record(5, NodeType::Witness, Some(1), 0));
    // The competing primary is unreachable; nothing can be decided about
    // it, so no action is taken.
    cluster.set_reachable(4, false);

    assert_eq!(run_guard(&cluster, 1).await, BrainSplitAction::DoNothing);
}

#[tokio::test]
async fn unknown_remote_timeline_keeps_local_primary_active() {
    // A diverged system identifier makes the timeline comparison
    // meaningless; the guard must not act on it.
    let cluster = two_primary_cluster();
    cluster.with_node(4, |n| n.identity.identifier = 9_999_999_999);

    assert_eq!(run_guard(&cluster, 1).await, BrainSplitAction::DoNothing);
}
