// tests/unit_probe_test.rs

mod common;

use common::RecordingRunner;
use replguard::core::probe::{DiskProbe, HealthProbe, InterfaceProbe};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn disk_probe_passes_on_writable_directory() {
    let dir = tempfile::tempdir().unwrap();
    let runner = RecordingRunner::new();
    let probe = DiskProbe::new(
        dir.path(),
        Duration::from_millis(200),
        3,
        runner.clone() as Arc<dyn replguard::core::command::CommandRunner>,
        "stop-db".to_string(),
        "kill-db".to_string(),
    );
    assert!(probe.healthy().await);
    assert!(runner.commands().is_empty());
}

#[tokio::test]
async fn disk_probe_stops_database_on_persistent_failure() {
    let runner = RecordingRunner::new();
    let probe = DiskProbe::new(
        "/nonexistent/replguard-test-data",
        Duration::from_millis(20),
        2,
        runner.clone() as Arc<dyn replguard::core::command::CommandRunner>,
        "stop-db".to_string(),
        "kill-db".to_string(),
    );
    assert!(!probe.healthy().await);
    // Fast stop succeeded (scripted default 0), so no forcible kill.
    assert!(runner.ran_command_containing("stop-db"));
    assert!(!runner.ran_command_containing("kill-db"));
}

#[tokio::test]
async fn disk_probe_escalates_to_forcible_stop() {
    let runner = RecordingRunner::new();
    runner.script("stop-db", 1);
    let probe = DiskProbe::new(
        "/nonexistent/replguard-test-data",
        Duration::from_millis(20),
        1,
        runner.clone() as Arc<dyn replguard::core::command::CommandRunner>,
        "stop-db".to_string(),
        "kill-db".to_string(),
    );
    assert!(!probe.healthy().await);
    assert!(runner.ran_command_containing("kill-db"));
}

#[tokio::test]
async fn interface_probe_reads_carrier_state() {
    let root = tempfile::tempdir().unwrap();
    let iface = root.path().join("eth0");
    std::fs::create_dir_all(&iface).unwrap();

    std::fs::write(iface.join("carrier"), "1\n").unwrap();
    let probe = InterfaceProbe::with_sys_root("eth0".to_string(), root.path());
    assert!(probe.carrier_up().await);

    std::fs::write(iface.join("carrier"), "0\n").unwrap();
    assert!(!probe.carrier_up().await);
}

#[tokio::test]
async fn interface_probe_defaults_to_up() {
    // No interface configured at all.
    let probe = InterfaceProbe::new(String::new());
    assert!(probe.carrier_up().await);

    // Configured but the carrier file cannot be read.
    let root = tempfile::tempdir().unwrap();
    let probe = InterfaceProbe::with_sys_root("eth9".to_string(), root.path());
    assert!(probe.carrier_up().await);
}
