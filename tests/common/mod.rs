// tests/common/mod.rs

//! Scripted in-memory doubles for the database-link, metadata-store and
//! command-runner seams, plus a small cluster simulator that the failover
//! scenario tests drive deterministically.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use replguard::config::Config;
use replguard::core::command::{CommandOutput, CommandRunner};
use replguard::core::errors::{ReplGuardError, Result};
use replguard::core::link::{Connector, DbLink};
use replguard::core::metastore::MetaStore;
use replguard::core::types::{
    Event, FollowNotification, Lsn, NodeId, NodeRecord, NodeType, RecoveryType, ReplInfo,
    SystemIdentity, Term, TimelineId,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Mutable, observable state of one simulated database instance.
pub struct SimNode {
    pub record: NodeRecord,
    pub reachable: bool,
    pub auth_rejected: bool,
    pub daemon_running: bool,
    pub recovery: RecoveryType,
    pub repl: ReplInfo,
    pub identity: SystemIdentity,
    pub current_lsn: Lsn,
    pub wal_receiver_pid: Option<i32>,
    pub fork_points: HashMap<TimelineId, Lsn>,
    pub sync_standby_names: String,
    pub attached_standbys: i64,
    // Per-database metadata state.
    pub follow_intent: Option<FollowNotification>,
    pub events: Vec<Event>,
    pub registered_daemon: Option<(NodeId, i64)>,
}

impl SimNode {
    fn new(record: NodeRecord) -> Self {
        let is_standby = record.node_type != NodeType::Primary;
        Self {
            record,
            reachable: true,
            auth_rejected: false,
            daemon_running: true,
            recovery: if is_standby {
                RecoveryType::Standby
            } else {
                RecoveryType::Primary
            },
            repl: ReplInfo {
                in_recovery: is_standby,
                ..ReplInfo::default()
            },
            identity: SystemIdentity {
                identifier: 7_000_000_001,
                timeline: 1,
            },
            current_lsn: Lsn::INVALID,
            wal_receiver_pid: None,
            fork_points: HashMap::new(),
            sync_standby_names: String::new(),
            attached_standbys: 0,
            follow_intent: None,
            events: Vec::new(),
            registered_daemon: Some((0, 0)),
        }
    }
}

struct SimInner {
    nodes: HashMap<String, SimNode>,
    records: Vec<NodeRecord>,
    term: Term,
}

/// A cluster of simulated nodes sharing one metadata table, addressed by
/// conninfo exactly like the real thing.
pub struct SimCluster {
    inner: Mutex<SimInner>,
}

pub fn conninfo_for(node_id: NodeId) -> String {
    format!("postgres://repl@node{node_id}/cluster")
}

pub fn node_record(
    node_id: NodeId,
    node_type: NodeType,
    upstream: Option<NodeId>,
    priority: i32,
) -> NodeRecord {
    NodeRecord {
        node_id,
        name: format!("node{node_id}"),
        node_type,
        upstream_node_id: upstream,
        location: "default".to_string(),
        priority,
        active: true,
        conninfo: conninfo_for(node_id),
        repluser: "repl".to_string(),
    }
}

impl SimCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SimInner {
                nodes: HashMap::new(),
                records: Vec::new(),
                term: 1,
            }),
        })
    }

    pub fn add_node(self: &Arc<Self>, record: NodeRecord) {
        let mut inner = self.inner.lock();
        inner.records.push(record.clone());
        inner.records.sort_by_key(|r| r.node_id);
        inner.nodes.insert(record.conninfo.clone(), SimNode::new(record));
    }

    pub fn with_node<R>(&self, node_id: NodeId, f: impl FnOnce(&mut SimNode) -> R) -> R {
        let conninfo = conninfo_for(node_id);
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(&conninfo)
            .unwrap_or_else(|| panic!("no sim node {node_id}"));
        f(node)
    }

    pub fn set_reachable(&self, node_id: NodeId, reachable: bool) {
        self.with_node(node_id, |n| n.reachable = reachable);
    }

    pub fn set_receive_lsn(&self, node_id: NodeId, lsn: Lsn) {
        self.with_node(node_id, |n| {
            n.repl.last_wal_receive_lsn = lsn;
            n.repl.last_wal_replay_lsn = lsn;
        });
    }

    pub fn set_upstream_last_seen(&self, node_id: NodeId, seconds: i64) {
        self.with_node(node_id, |n| n.repl.upstream_last_seen = seconds);
    }

    pub fn set_timeline(&self, node_id: NodeId, timeline: TimelineId) {
        self.with_node(node_id, |n| n.identity.timeline = timeline);
    }

    /// Flips a node into primary mode, both at the instance level and in
    /// the shared metadata, the way a successful promote command would.
    pub fn promote(&self, node_id: NodeId) {
        let conninfo = conninfo_for(node_id);
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(&conninfo) {
            node.recovery = RecoveryType::Primary;
            node.repl.in_recovery = false;
        }
        for record in inner.records.iter_mut() {
            if record.node_id == node_id {
                record.node_type = NodeType::Primary;
                record.upstream_node_id = None;
            }
        }
        let records = inner.records.clone();
        for node in inner.nodes.values_mut() {
            node.record = records
                .iter()
                .find(|r| r.node_id == node.record.node_id)
                .cloned()
                .unwrap_or_else(|| node.record.clone());
        }
    }

    pub fn term(&self) -> Term {
        self.inner.lock().term
    }

    pub fn set_term(&self, term: Term) {
        self.inner.lock().term = term;
    }

    pub fn follow_intent(&self, node_id: NodeId) -> Option<FollowNotification> {
        self.with_node(node_id, |n| n.follow_intent)
    }

    pub fn seed_follow_intent(&self, node_id: NodeId, target_id: NodeId, term: Term) {
        self.with_node(node_id, |n| {
            n.follow_intent = Some(FollowNotification { target_id, term })
        });
    }

    pub fn events_for(&self, node_id: NodeId) -> Vec<Event> {
        self.with_node(node_id, |n| n.events.clone())
    }

    pub fn record_of(&self, node_id: NodeId) -> NodeRecord {
        self.inner
            .lock()
            .records
            .iter()
            .find(|r| r.node_id == node_id)
            .cloned()
            .unwrap_or_else(|| panic!("no record for node {node_id}"))
    }
}

/// Connector handing out links into the simulated cluster.
pub struct SimConnector {
    pub cluster: Arc<SimCluster>,
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, conninfo: &str) -> Result<Arc<dyn DbLink>> {
        let inner = self.cluster.inner.lock();
        let node = inner
            .nodes
            .get(conninfo)
            .ok_or_else(|| ReplGuardError::DbConnect {
                conninfo: conninfo.to_string(),
                detail: "unknown host".to_string(),
            })?;
        if node.auth_rejected {
            return Err(ReplGuardError::AuthRejected {
                conninfo: conninfo.to_string(),
            });
        }
        if !node.reachable {
            return Err(ReplGuardError::DbConnect {
                conninfo: conninfo.to_string(),
                detail: "connection refused".to_string(),
            });
        }
        drop(inner);
        Ok(Arc::new(SimLink {
            cluster: self.cluster.clone(),
            conninfo: conninfo.to_string(),
        }))
    }
}

/// A link to one simulated node. Every operation re-checks reachability so
/// tests can kill a node mid-flight.
pub struct SimLink {
    cluster: Arc<SimCluster>,
    conninfo: String,
}

impl SimLink {
    fn read<R>(&self, f: impl FnOnce(&SimNode) -> R) -> Result<R> {
        let inner = self.cluster.inner.lock();
        let node = inner
            .nodes
            .get(&self.conninfo)
            .ok_or_else(|| ReplGuardError::MetaQuery("node vanished".to_string()))?;
        if !node.reachable {
            return Err(ReplGuardError::MetaQuery("connection lost".to_string()));
        }
        Ok(f(node))
    }

    fn write<R>(&self, f: impl FnOnce(&mut SimNode) -> R) -> Result<R> {
        let mut inner = self.cluster.inner.lock();
        let node = inner
            .nodes
            .get_mut(&self.conninfo)
            .ok_or_else(|| ReplGuardError::MetaQuery("node vanished".to_string()))?;
        if !node.reachable {
            return Err(ReplGuardError::MetaQuery("connection lost".to_string()));
        }
        Ok(f(node))
    }

    fn check_reachable(&self) -> Result<()> {
        self.read(|_| ())
    }
}

#[async_trait]
impl MetaStore for SimLink {
    async fn get_all_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.check_reachable()?;
        Ok(self.cluster.inner.lock().records.clone())
    }

    async fn get_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>> {
        self.check_reachable()?;
        Ok(self
            .cluster
            .inner
            .lock()
            .records
            .iter()
            .find(|r| r.node_id == node_id)
            .cloned())
    }

    async fn get_active_siblings(
        &self,
        self_id: NodeId,
        upstream_id: NodeId,
    ) -> Result<Vec<NodeRecord>> {
        self.check_reachable()?;
        Ok(self
            .cluster
            .inner
            .lock()
            .records
            .iter()
            .filter(|r| {
                r.active && r.node_id != self_id && r.upstream_node_id == Some(upstream_id)
            })
            .cloned()
            .collect())
    }

    async fn update_upstream(&self, node_id: NodeId, new_upstream: Option<NodeId>) -> Result<()> {
        self.check_reachable()?;
        let mut inner = self.cluster.inner.lock();
        for record in inner.records.iter_mut() {
            if record.node_id == node_id {
                record.upstream_node_id = new_upstream;
            }
        }
        Ok(())
    }

    async fn update_active(&self, node_id: NodeId, active: bool) -> Result<()> {
        self.check_reachable()?;
        let mut inner = self.cluster.inner.lock();
        for record in inner.records.iter_mut() {
            if record.node_id == node_id {
                record.active = active;
            }
        }
        Ok(())
    }

    async fn update_type_primary(&self, node_id: NodeId) -> Result<()> {
        self.check_reachable()?;
        let mut inner = self.cluster.inner.lock();
        for record in inner.records.iter_mut() {
            if record.node_id == node_id {
                record.node_type = NodeType::Primary;
                record.upstream_node_id = None;
            }
        }
        Ok(())
    }

    async fn get_current_term(&self) -> Result<Term> {
        self.check_reachable()?;
        Ok(self.cluster.inner.lock().term)
    }

    async fn increment_term(&self) -> Result<Term> {
        self.check_reachable()?;
        let mut inner = self.cluster.inner.lock();
        inner.term += 1;
        Ok(inner.term)
    }

    async fn get_new_primary(&self) -> Result<Option<FollowNotification>> {
        self.read(|n| n.follow_intent)
    }

    async fn notify_follow_primary(&self, target_id: NodeId, term: Term) -> Result<()> {
        self.write(|n| n.follow_intent = Some(FollowNotification { target_id, term }))
    }

    async fn reset_voting_status(&self) -> Result<()> {
        self.write(|n| n.follow_intent = None)
    }

    async fn register_daemon(&self, node_id: NodeId, pid: u32) -> Result<()> {
        self.write(|n| n.registered_daemon = Some((node_id, pid as i64)))
    }

    async fn registered_daemon_pid(&self) -> Result<Option<i32>> {
        self.read(|n| {
            if n.daemon_running {
                n.registered_daemon.map(|(_, pid)| pid as i32)
            } else {
                None
            }
        })
    }

    async fn registered_node_id(&self) -> Result<Option<NodeId>> {
        self.read(|n| n.registered_daemon.map(|(id, _)| id))
    }

    async fn unregister_daemon(&self, _node_id: NodeId) -> Result<()> {
        self.write(|n| n.registered_daemon = None)
    }

    async fn record_event(&self, event: &Event) -> Result<()> {
        let event = event.clone();
        self.write(|n| n.events.push(event))
    }

    async fn append_monitoring_row(
        &self,
        _row: &replguard::core::types::MonitoringRow,
    ) -> Result<()> {
        self.check_reachable()
    }

    async fn replace_nodes(&self, nodes: &[NodeRecord]) -> Result<()> {
        self.check_reachable()?;
        let mut inner = self.cluster.inner.lock();
        inner.records = nodes.to_vec();
        inner.records.sort_by_key(|r| r.node_id);
        Ok(())
    }
}

#[async_trait]
impl DbLink for SimLink {
    fn conninfo(&self) -> &str {
        &self.conninfo
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn recovery_type(&self) -> Result<RecoveryType> {
        self.read(|n| n.recovery)
    }

    async fn replication_info(&self, _node_type: NodeType) -> Result<ReplInfo> {
        self.read(|n| n.repl.clone())
    }

    async fn node_current_lsn(&self) -> Result<Lsn> {
        self.read(|n| {
            if n.current_lsn.is_valid() {
                n.current_lsn
            } else {
                n.repl.last_wal_receive_lsn
            }
        })
    }

    async fn system_identity(&self) -> Result<SystemIdentity> {
        self.read(|n| n.identity)
    }

    async fn timeline_fork_point(&self, timeline: TimelineId) -> Result<Option<Lsn>> {
        self.read(|n| n.fork_points.get(&timeline).copied())
    }

    async fn resume_wal_replay(&self) -> Result<()> {
        self.write(|n| n.repl.wal_replay_paused = false)
    }

    async fn wal_receiver_pid(&self) -> Result<Option<i32>> {
        self.read(|n| n.wal_receiver_pid)
    }

    async fn disable_wal_receiver(&self) -> Result<()> {
        self.write(|n| n.wal_receiver_pid = None)
    }

    async fn enable_wal_receiver(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn sync_standby_names(&self) -> Result<String> {
        self.read(|n| n.sync_standby_names.clone())
    }

    async fn attached_standby_count(&self) -> Result<i64> {
        self.read(|n| n.attached_standbys)
    }
}

type CommandHook = Box<dyn Fn(&str) + Send + Sync>;

/// Records every command and scripts exit codes by substring match.
pub struct RecordingRunner {
    log: Mutex<Vec<String>>,
    rules: Mutex<Vec<(String, i32)>>,
    outputs: Mutex<Vec<(String, String)>>,
    hooks: Mutex<Vec<(String, CommandHook)>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Commands containing `needle` will exit with `status`.
    pub fn script(&self, needle: &str, status: i32) {
        self.rules.lock().push((needle.to_string(), status));
    }

    /// Commands containing `needle` will produce `stdout`.
    pub fn script_output(&self, needle: &str, stdout: &str) {
        self.outputs
            .lock()
            .push((needle.to_string(), stdout.to_string()));
    }

    /// Runs `hook` whenever an executed command contains `needle`; used to
    /// make a scripted promote/follow actually mutate the simulator.
    pub fn on_command(&self, needle: &str, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.lock().push((needle.to_string(), Box::new(hook)));
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn ran_command_containing(&self, needle: &str) -> bool {
        self.log.lock().iter().any(|c| c.contains(needle))
    }

    fn execute(&self, command: &str) -> CommandOutput {
        self.log.lock().push(command.to_string());
        for (needle, hook) in self.hooks.lock().iter() {
            if command.contains(needle.as_str()) {
                hook(command);
            }
        }
        let status = self
            .rules
            .lock()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, status)| *status)
            .unwrap_or(0);
        let stdout = self
            .outputs
            .lock()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| "ok\n".to_string());
        CommandOutput {
            status,
            stdout,
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run_local(&self, command: &str) -> Result<CommandOutput> {
        Ok(self.execute(command))
    }

    async fn run_remote(
        &self,
        _user: &str,
        host: &str,
        _ssh_options: &str,
        command: &str,
    ) -> Result<CommandOutput> {
        Ok(self.execute(&format!("{host}: {command}")))
    }
}

/// A minimal valid configuration for the given node, with short timeouts so
/// tests run quickly.
pub fn test_config(node_id: NodeId) -> Config {
    let toml = format!(
        r#"
node_id = {node_id}
conninfo = "{conninfo}"
data_directory = "/var/lib/db/data"
promote_command = "cluster-ctl promote"
follow_command = "cluster-ctl follow --upstream %n"
rejoin_command = "cluster-ctl rejoin --donor %d"
primary_notification_timeout = "2s"
election_rerun_interval = "1s"
standby_startup_timeout = "3s"
reconnect_attempts = 2
reconnect_interval = "10ms"
"#,
        conninfo = conninfo_for(node_id),
    );
    toml::from_str(&toml).expect("valid test config")
}

/// A three-node cluster: node 1 is the primary, nodes 2 and 3 are standbys
/// attached to it, both with daemons running and equal receive positions.
pub fn three_node_cluster() -> Arc<SimCluster> {
    let cluster = SimCluster::new();
    cluster.add_node(node_record(1, NodeType::Primary, None, 100));
    cluster.add_node(node_record(2, NodeType::Standby, Some(1), 100));
    cluster.add_node(node_record(3, NodeType::Standby, Some(1), 100));
    cluster.set_receive_lsn(2, "0/200".parse().unwrap());
    cluster.set_receive_lsn(3, "0/200".parse().unwrap());
    cluster
}
