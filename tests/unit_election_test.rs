// tests/unit_election_test.rs

//! Promotion-candidate election scenarios driven against the simulated
//! cluster: LSN comparison, priority and node-id tie-breaks, quorum and
//! visibility vetoes, and the location gate.

mod common;

use common::*;
use replguard::core::election::ElectionCoordinator;
use replguard::core::link::Connector;
use replguard::core::types::{ElectionResult, NodeType};
use std::sync::Arc;

async fn run_election(
    cluster: &Arc<SimCluster>,
    local_id: i32,
    upstream_id: i32,
    tweak: impl FnOnce(&mut replguard::config::Config),
) -> replguard::core::election::ElectionOutcome {
    let mut cfg = test_config(local_id);
    tweak(&mut cfg);

    let connector: Arc<dyn Connector> = Arc::new(SimConnector {
        cluster: cluster.clone(),
    });
    let runner: Arc<dyn replguard::core::command::CommandRunner> = RecordingRunner::new();
    let local = connector.connect(&conninfo_for(local_id)).await.unwrap();
    let local_node = cluster.record_of(local_id);
    let upstream_node = cluster.record_of(upstream_id);

    ElectionCoordinator {
        cfg: &cfg,
        connector: &connector,
        runner: &runner,
        local: &local,
        local_node: &local_node,
        upstream_node: &upstream_node,
    }
    .run()
    .await
    .expect("election runs")
}

#[tokio::test]
async fn equal_lsn_lower_node_id_wins() {
    // Both standbys at 0/200 with equal priority: node 2 must win on the
    // lower node id, from either node's point of view.
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Won);

    let outcome = run_election(&cluster, 3, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Lost);
}

#[tokio::test]
async fn higher_receive_lsn_wins_regardless_of_id() {
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);
    cluster.set_receive_lsn(2, "0/150".parse().unwrap());
    cluster.set_receive_lsn(3, "0/200".parse().unwrap());

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Lost);

    let outcome = run_election(&cluster, 3, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Won);
}

#[tokio::test]
async fn equal_lsn_higher_priority_wins() {
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 100));
    cluster.add_node(node_record(2, NodeType::Standby, Some(1), 50));
    cluster.add_node(node_record(3, NodeType::Standby, Some(1), 100));
    cluster.set_receive_lsn(2, "0/200".parse().unwrap());
    cluster.set_receive_lsn(3, "0/200".parse().unwrap());
    cluster.set_reachable(1, false);

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Lost);

    let outcome = run_election(&cluster, 3, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Won);
}

#[tokio::test]
async fn minority_partition_cancels_election() {
    // Five nodes; the candidate can only see itself and one of its four
    // siblings, so no promotion may happen.
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 100));
    for id in 2..=5 {
        cluster.add_node(node_record(id, NodeType::Standby, Some(1), 100));
        cluster.set_receive_lsn(id, "0/200".parse().unwrap());
    }
    cluster.set_reachable(1, false);
    cluster.set_reachable(4, false);
    cluster.set_reachable(5, false);

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Cancelled);
    assert!(outcome.degraded);
    assert_eq!(outcome.new_primary_id, None);
}

#[tokio::test]
async fn visibility_consensus_cancels_when_sibling_sees_primary() {
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);
    cluster.set_upstream_last_seen(3, 1);

    let outcome = run_election(&cluster, 2, 1, |cfg| {
        cfg.primary_visibility_consensus = true;
    })
    .await;
    assert_eq!(outcome.result, ElectionResult::Cancelled);
    assert!(outcome.degraded);
}

#[tokio::test]
async fn without_consensus_option_visibility_does_not_cancel() {
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);
    cluster.set_upstream_last_seen(3, 1);

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Won);
}

#[tokio::test]
async fn node_outside_primary_location_is_not_candidate() {
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 100));
    let mut remote = node_record(2, NodeType::Standby, Some(1), 100);
    remote.location = "dc2".to_string();
    cluster.add_node(remote);
    cluster.add_node(node_record(3, NodeType::Standby, Some(1), 100));
    cluster.set_receive_lsn(2, "0/400".parse().unwrap());
    cluster.set_receive_lsn(3, "0/200".parse().unwrap());
    cluster.set_reachable(1, false);

    // Node 2 has the highest LSN but sits in another location.
    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::NotCandidate);
}

#[tokio::test]
async fn invisible_primary_location_is_treated_as_network_split() {
    // The primary lives in dc1; the only other dc1 node is unreachable
    // from here. Even with a quorum of dc2 nodes visible, no election may
    // proceed: this looks like a network split between the locations.
    let cluster = SimCluster::new();
    let mut primary = node_record(1, NodeType::Primary, None, 100);
    primary.location = "dc1".to_string();
    cluster.add_node(primary);
    for id in [2, 3, 5] {
        let mut standby = node_record(id, NodeType::Standby, Some(1), 100);
        standby.location = "dc2".to_string();
        cluster.add_node(standby);
        cluster.set_receive_lsn(id, "0/200".parse().unwrap());
    }
    let mut dc1_standby = node_record(4, NodeType::Standby, Some(1), 100);
    dc1_standby.location = "dc1".to_string();
    cluster.add_node(dc1_standby);
    cluster.set_receive_lsn(4, "0/200".parse().unwrap());

    cluster.set_reachable(1, false);
    cluster.set_reachable(4, false);
    // A leftover intent must be cleared when voting status is reset.
    cluster.seed_follow_intent(2, 5, 1);

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Cancelled);
    assert!(outcome.degraded);
    assert_eq!(outcome.new_primary_id, None);
    assert!(cluster.follow_intent(2).is_none());

    // With the dc1 standby reachable again the split suspicion is gone,
    // and only the location gate keeps this node from promoting itself.
    cluster.set_reachable(4, true);
    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::NotCandidate);
    assert!(!outcome.degraded);
}

#[tokio::test]
async fn sole_node_in_other_location_goes_degraded() {
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 100));
    let mut remote = node_record(2, NodeType::Standby, Some(1), 100);
    remote.location = "dc2".to_string();
    cluster.add_node(remote);
    cluster.set_receive_lsn(2, "0/200".parse().unwrap());
    cluster.set_reachable(1, false);

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::NotCandidate);
    assert!(outcome.degraded);
}

#[tokio::test]
async fn zero_priority_node_loses_by_default() {
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 100));
    cluster.add_node(node_record(2, NodeType::Standby, Some(1), 0));
    cluster.add_node(node_record(3, NodeType::Standby, Some(1), 100));
    cluster.set_receive_lsn(2, "0/200".parse().unwrap());
    cluster.set_receive_lsn(3, "0/200".parse().unwrap());
    cluster.set_reachable(1, false);

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Lost);

    // And the zero-priority sibling is never selected by others.
    let outcome = run_election(&cluster, 3, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Won);
}

#[tokio::test]
async fn manual_failover_mode_is_not_candidate() {
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);

    let outcome = run_election(&cluster, 2, 1, |cfg| {
        cfg.failover = replguard::config::FailoverMode::Manual;
    })
    .await;
    assert_eq!(outcome.result, ElectionResult::NotCandidate);
}

#[tokio::test]
async fn witness_is_never_a_candidate_but_counts_for_quorum() {
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 100));
    cluster.add_node(node_record(2, NodeType::Standby, Some(1), 100));
    cluster.add_node(node_record(4, NodeType::Witness, Some(1), 0));
    cluster.set_receive_lsn(2, "0/200".parse().unwrap());
    cluster.set_reachable(1, false);

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Won);
}

#[tokio::test]
async fn out_of_band_primary_cancels_with_follow_target() {
    // Node 3 was promoted outside the failover mechanism; node 2 should
    // cancel its election and follow node 3.
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);
    // Instance-level promotion only: the metadata still shows node 3 as a
    // standby of node 1, which is exactly the out-of-band case.
    cluster.with_node(3, |n| {
        n.recovery = replguard::core::types::RecoveryType::Primary;
        n.repl.in_recovery = false;
        n.current_lsn = "0/300".parse().unwrap();
    });

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Cancelled);
    assert_eq!(outcome.new_primary_id, Some(3));
}

#[tokio::test]
async fn rogue_primary_behind_local_position_is_ignored() {
    // The rogue primary's position is behind ours; we cannot attach to it.
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);
    cluster.set_receive_lsn(2, "0/400".parse().unwrap());
    cluster.with_node(3, |n| {
        n.recovery = replguard::core::types::RecoveryType::Primary;
        n.repl.in_recovery = false;
        n.current_lsn = "0/300".parse().unwrap();
    });

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    // Node 3 is skipped as a rogue primary; node 2 wins among the rest.
    assert_eq!(outcome.result, ElectionResult::Won);
    assert_eq!(outcome.new_primary_id, None);
}

#[tokio::test]
async fn validation_command_failure_forces_rerun() {
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);

    let mut cfg = test_config(2);
    cfg.failover_validation_command = "validate-node %n %a".to_string();

    let connector: Arc<dyn Connector> = Arc::new(SimConnector {
        cluster: cluster.clone(),
    });
    let runner = RecordingRunner::new();
    runner.script("validate-node", 1);
    let runner_dyn: Arc<dyn replguard::core::command::CommandRunner> = runner.clone();
    let local = connector.connect(&conninfo_for(2)).await.unwrap();
    let local_node = cluster.record_of(2);
    let upstream_node = cluster.record_of(1);

    let outcome = ElectionCoordinator {
        cfg: &cfg,
        connector: &connector,
        runner: &runner_dyn,
        local: &local,
        local_node: &local_node,
        upstream_node: &upstream_node,
    }
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.result, ElectionResult::Rerun);
    assert!(runner.ran_command_containing("validate-node 2 node2"));
}

#[tokio::test]
async fn paused_replay_is_resumed_before_candidacy() {
    let cluster = three_node_cluster();
    cluster.set_reachable(1, false);
    cluster.with_node(2, |n| {
        n.repl.wal_replay_paused = true;
        n.repl.last_wal_replay_lsn = "0/100".parse().unwrap();
    });

    let outcome = run_election(&cluster, 2, 1, |_| {}).await;
    assert_eq!(outcome.result, ElectionResult::Won);
    assert!(!cluster.with_node(2, |n| n.repl.wal_replay_paused));
}
