// tests/unit_peer_test.rs

mod common;

use common::*;
use replguard::core::link::Connector;
use replguard::core::peer::{PeerClient, ReconnectPolicy};
use replguard::core::types::{NodeStatus, NodeType, RecoveryType};
use std::sync::Arc;
use std::time::Duration;

fn peer_for(cluster: &Arc<SimCluster>, node_id: i32, attempts: u32) -> (PeerClient, Arc<RecordingRunner>) {
    let runner = RecordingRunner::new();
    let connector: Arc<dyn Connector> = Arc::new(SimConnector {
        cluster: cluster.clone(),
    });
    let peer = PeerClient::new(
        cluster.record_of(node_id),
        connector,
        runner.clone(),
        String::new(),
        "-q".to_string(),
        ReconnectPolicy {
            attempts,
            interval: Duration::from_millis(5),
        },
    );
    (peer, runner)
}

#[tokio::test]
async fn status_starts_unknown_and_tracks_probes() {
    let cluster = three_node_cluster();
    let (peer, _) = peer_for(&cluster, 3, 2);

    assert_eq!(peer.last_known_status(), NodeStatus::Unknown);
    assert!(!peer.reachable());

    peer.ensure_connected().await.unwrap();
    assert_eq!(peer.last_known_status(), NodeStatus::Up);
    assert!(peer.reachable());
}

#[tokio::test]
async fn reconnect_attempts_are_capped() {
    let cluster = three_node_cluster();
    cluster.set_reachable(3, false);
    let (peer, _) = peer_for(&cluster, 3, 3);

    assert!(peer.ensure_connected().await.is_err());
    assert_eq!(peer.last_known_status(), NodeStatus::Down);
}

#[tokio::test]
async fn recovery_probe_reports_unknown_for_dead_peer() {
    let cluster = three_node_cluster();
    let (peer, _) = peer_for(&cluster, 3, 1);

    assert_eq!(peer.is_in_recovery().await, RecoveryType::Standby);

    cluster.set_reachable(3, false);
    peer.mark_down();
    assert_eq!(peer.is_in_recovery().await, RecoveryType::Unknown);
}

#[tokio::test]
async fn replication_info_flows_through_cached_link() {
    let cluster = three_node_cluster();
    cluster.set_receive_lsn(3, "0/5000".parse().unwrap());
    let (peer, _) = peer_for(&cluster, 3, 1);

    let info = peer.replication_info().await.unwrap();
    assert_eq!(info.last_wal_receive_lsn, "0/5000".parse().unwrap());
    assert!(info.in_recovery);
}

#[tokio::test]
async fn remote_commands_target_the_peer_host() {
    let cluster = three_node_cluster();
    let (peer, runner) = peer_for(&cluster, 3, 1);

    let out = peer.run_remote("systemctl status db").await.unwrap();
    assert!(out.success());
    assert!(runner.ran_command_containing("node3: systemctl status db"));
}

#[tokio::test]
async fn witness_records_are_carried_like_any_peer() {
    let cluster = three_node_cluster();
    cluster.add_node(node_record(9, NodeType::Witness, Some(1), 0));
    let (peer, _) = peer_for(&cluster, 9, 1);
    peer.ensure_connected().await.unwrap();
    assert_eq!(peer.record.node_type, NodeType::Witness);
}
