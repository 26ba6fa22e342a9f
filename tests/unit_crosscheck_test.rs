// tests/unit_crosscheck_test.rs

mod common;

use common::*;
use replguard::core::crosscheck::{
    ReachabilityCube, ReachabilityStatus, fetch_matrix, parse_matrix,
};
use replguard::core::link::Connector;
use replguard::core::peer::{PeerClient, ReconnectPolicy};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn matrix_is_fetched_over_the_shell_transport() {
    let cluster = three_node_cluster();
    let runner = RecordingRunner::new();
    runner.script_output("matrix --csv", "3,1,0\n3,2,-1\n");

    let connector: Arc<dyn Connector> = Arc::new(SimConnector {
        cluster: cluster.clone(),
    });
    let peer = PeerClient::new(
        cluster.record_of(3),
        connector,
        runner.clone(),
        "admin".to_string(),
        "-q".to_string(),
        ReconnectPolicy {
            attempts: 1,
            interval: Duration::from_millis(5),
        },
    );

    let entries = fetch_matrix(&peer, "cluster-ctl matrix --csv").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].source, 3);
    assert_eq!(entries[0].status, ReachabilityStatus::Up);
    assert_eq!(entries[1].status, ReachabilityStatus::Down);
}

#[tokio::test]
async fn cube_assembles_per_observer_views() {
    let observed_by_2 = parse_matrix("2,1,0\n2,3,0\n").unwrap();
    let observed_by_3 = parse_matrix("3,1,-1\n3,2,0\n").unwrap();

    let mut cube = ReachabilityCube::new(vec![1, 2, 3]);
    cube.absorb(2, &observed_by_2);
    cube.absorb(3, &observed_by_3);

    // The two surviving nodes disagree about the primary.
    assert_eq!(cube.get(2, 2, 1), ReachabilityStatus::Up);
    assert_eq!(cube.get(3, 3, 1), ReachabilityStatus::Down);
    assert_eq!(cube.get(1, 1, 2), ReachabilityStatus::Unknown);
}
