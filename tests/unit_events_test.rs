// tests/unit_events_test.rs

mod common;

use common::*;
use replguard::core::events::EventBus;
use replguard::core::link::Connector;
use replguard::core::types::EventKind;

#[tokio::test]
async fn events_are_recorded_and_forwarded() {
    let cluster = three_node_cluster();
    let connector = SimConnector {
        cluster: cluster.clone(),
    };
    let link = connector.connect(&conninfo_for(1)).await.unwrap();
    let runner = RecordingRunner::new();

    let bus = EventBus::new(
        2,
        "node2".to_string(),
        "notify-hook --node %n --event %e --ok %s".to_string(),
        &[],
        runner.clone(),
    );
    bus.emit(
        Some(&link),
        EventKind::FailoverPromote,
        true,
        "node 2 promoted to primary",
    )
    .await;

    let events = cluster.events_for(1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::FailoverPromote);
    assert_eq!(events[0].node_id, 2);
    assert!(events[0].success);
    assert!(runner.ran_command_containing("notify-hook --node 2 --event failover_promote --ok 1"));
}

#[tokio::test]
async fn hook_failures_are_swallowed() {
    let runner = RecordingRunner::new();
    runner.script("notify-hook", 1);
    let bus = EventBus::new(2, "node2".to_string(), "notify-hook %e".to_string(), &[], runner.clone());
    // No store available and the hook fails; emit must still return.
    bus.emit(None, EventKind::PromoteError, false, "promote command failed")
        .await;
    assert!(runner.ran_command_containing("notify-hook promote_error"));
}

#[tokio::test]
async fn event_kind_filter_limits_hook_invocations() {
    let runner = RecordingRunner::new();
    let bus = EventBus::new(
        2,
        "node2".to_string(),
        "notify-hook %e".to_string(),
        &["failover_promote".to_string()],
        runner.clone(),
    );

    bus.emit(None, EventKind::DaemonStart, true, "starting").await;
    bus.emit(None, EventKind::FailoverPromote, true, "promoted").await;

    let commands = runner.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains("failover_promote"));
}

#[tokio::test]
async fn store_failure_does_not_block_hook() {
    let cluster = three_node_cluster();
    let connector = SimConnector {
        cluster: cluster.clone(),
    };
    let link = connector.connect(&conninfo_for(1)).await.unwrap();
    cluster.set_reachable(1, false);

    let runner = RecordingRunner::new();
    let bus = EventBus::new(2, "node2".to_string(), "notify-hook %e".to_string(), &[], runner.clone());
    bus.emit(
        Some(&link),
        EventKind::UpstreamDisconnect,
        true,
        "unable to connect to upstream",
    )
    .await;

    assert!(runner.ran_command_containing("notify-hook upstream_disconnect"));
}
