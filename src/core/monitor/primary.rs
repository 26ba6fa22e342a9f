// src/core/monitor/primary.rs

//! The monitor loop run while the local node is the cluster primary.
//!
//! Watches the local instance (database, disk, network interface), manages
//! sync/async degradation of a sole synchronous standby, and periodically
//! invokes the split-brain guard. A primary that loses its own database is
//! stopped, stripped of the virtual IP and offered back to the cluster as a
//! standby through the auto-rejoin flow.

use crate::config::Config;
use crate::core::command::rejoin_command;
use crate::core::errors::{ReplGuardError, Result};
use crate::core::link::{Connector as _, DbLink};
use crate::core::metastore::MetaStore as _;
use crate::core::monitor::{DegradedTracker, MonitorOutcome, StatusTimer, try_reconnect};
use crate::core::probe::{DbPingProbe, DiskProbe, InterfaceProbe};
use crate::core::splitbrain::SplitBrainGuard;
use crate::core::types::{
    BrainSplitAction, EventKind, MonitoringState, NodeRecord, NodeStatus, NodeType, RecoveryType,
};
use crate::core::vip;
use crate::daemon::context::DaemonContext;
use crate::daemon::signals::Wake;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct SyncState {
    switched_async: bool,
    unreachable_since: Option<Instant>,
}

pub struct PrimaryMonitor {
    ctx: Arc<DaemonContext>,
    local: Arc<dyn DbLink>,
    local_node: NodeRecord,
    nodes: Vec<NodeRecord>,
    degraded: DegradedTracker,
    sync_state: SyncState,
    reload_seen: u64,
    inactive_warned: bool,
}

impl PrimaryMonitor {
    pub fn new(ctx: Arc<DaemonContext>, local: Arc<dyn DbLink>, local_node: NodeRecord) -> Self {
        let cfg = ctx.config();
        Self {
            ctx,
            local,
            local_node,
            nodes: Vec::new(),
            degraded: DegradedTracker::new(cfg.degraded_monitoring_timeout),
            sync_state: SyncState {
                switched_async: false,
                unreachable_since: None,
            },
            reload_seen: 0,
            inactive_warned: false,
        }
    }

    pub async fn run(mut self) -> Result<MonitorOutcome> {
        let cfg = self.ctx.config();

        if let Err(e) = self.local.reset_voting_status().await {
            warn!("unable to reset voting status: {}", e);
        }

        let detail = format!(
            "monitoring cluster primary \"{}\" (node ID: {})",
            self.local_node.name, self.local_node.node_id
        );
        let kind = if self.ctx.mark_startup_event() {
            EventKind::DaemonReload
        } else {
            EventKind::DaemonStart
        };
        self.ctx
            .events
            .emit(Some(&self.local), kind, true, &detail)
            .await;

        match self.local.get_all_nodes().await {
            Ok(nodes) => {
                self.ctx.refresh_peers(&nodes, self.local_node.node_id);
                self.nodes = nodes;
            }
            Err(e) => warn!("unable to retrieve node records: {}", e),
        }

        let mut status_timer = StatusTimer::new(cfg.log_status_interval);

        loop {
            if self.ctx.signals.terminated() {
                return self.shutdown().await;
            }
            if self.ctx.signals.reload_pending(&mut self.reload_seen) {
                self.handle_sighup().await;
            }
            let cfg = self.ctx.config();

            let mut local_ok = self.local.ping().await.is_ok();
            if !local_ok {
                local_ok = self.handle_local_disconnect(&cfg).await?;
                if local_ok && !self.still_primary().await {
                    return Ok(MonitorOutcome::RestartMonitoring);
                }
            }

            let disk_ok = self.disk_probe(&cfg).check_and_enforce().await;
            let net_ok = InterfaceProbe::new(cfg.network_interface.clone())
                .carrier_up()
                .await;

            if local_ok && disk_ok && net_ok {
                self.check_sync_async(&cfg).await;
            } else if !self.degraded.active() {
                // The disk probe stops the database itself on failure; for
                // a dead connection or a downed interface we do it here.
                self.enter_degraded_and_rejoin(&cfg, !local_ok || !net_ok).await;
            } else {
                // Already degraded; keep offering the node back as a
                // standby.
                self.attempt_auto_rejoin(&cfg).await;
            }

            if self.degraded.active() {
                if let Err(e) = self.degraded.check() {
                    self.ctx
                        .events
                        .emit(
                            None,
                            EventKind::MonitoringTimeout,
                            true,
                            &format!(
                                "degraded monitoring timeout ({} seconds) exceeded, terminating",
                                self.degraded.elapsed_secs()
                            ),
                        )
                        .await;
                    return Err(e);
                }
                debug!(
                    "monitoring node in degraded state for {} seconds",
                    self.degraded.elapsed_secs()
                );

                let ping = DbPingProbe::new(
                    self.ctx.connector.clone(),
                    self.local_node.conninfo.clone(),
                );
                if ping.status().await == NodeStatus::Up
                    && let Ok(link) =
                        self.ctx.connector.connect(&self.local_node.conninfo).await
                {
                    self.local = link;
                    self.ctx
                        .events
                        .emit(
                            Some(&self.local),
                            EventKind::LocalReconnect,
                            true,
                            &format!(
                                "reconnected to local node after {} seconds",
                                self.degraded.elapsed_secs()
                            ),
                        )
                        .await;
                    self.reinit_daemon_registry().await;
                    if !self.still_primary().await {
                        return Ok(MonitorOutcome::RestartMonitoring);
                    }
                    self.degraded.clear();
                }
            } else if local_ok && !self.still_primary().await {
                return Ok(MonitorOutcome::RestartMonitoring);
            }

            if status_timer.due() {
                let state = if self.degraded.active() {
                    MonitoringState::Degraded
                } else {
                    MonitoringState::Normal
                };
                info!(
                    "monitoring primary node \"{}\" (node ID: {}) in {} state",
                    self.local_node.name, self.local_node.node_id, state
                );
            }

            // Refresh the node list so newly registered or unregistered
            // nodes are picked up, then look for competing primaries.
            if !self.degraded.active() {
                if let Ok(nodes) = self.local.get_all_nodes().await {
                    self.ctx.refresh_peers(&nodes, self.local_node.node_id);
                    self.nodes = nodes;
                }

                if cfg.check_brain_split {
                    self.run_split_brain_guard(&cfg).await?;
                }
            }

            debug!(
                "sleeping {} seconds (parameter \"monitor_interval\")",
                cfg.monitor_interval.as_secs()
            );
            if self.ctx.signals.wake_after(cfg.monitor_interval).await == Wake::Terminate {
                return self.shutdown().await;
            }
        }
    }

    async fn shutdown(&self) -> Result<MonitorOutcome> {
        let store = if self.local.ping().await.is_ok() {
            Some(&self.local)
        } else {
            None
        };
        self.ctx
            .events
            .emit(store, EventKind::DaemonShutdown, true, "daemon terminating on signal")
            .await;
        Ok(MonitorOutcome::Shutdown)
    }

    async fn handle_sighup(&mut self) {
        if let Err(e) = self.ctx.reload_config().await {
            warn!("unable to reload configuration: {}", e);
            return;
        }
        if let Ok(link) = self.ctx.connector.connect(&self.local_node.conninfo).await {
            self.local = link;
        }
    }

    fn disk_probe(&self, cfg: &Config) -> DiskProbe {
        DiskProbe::new(
            cfg.data_directory.clone(),
            cfg.device_check_timeout,
            cfg.device_check_times,
            self.ctx.runner.clone(),
            cfg.db_stop_command.clone(),
            cfg.db_force_stop_command.clone(),
        )
    }

    /// The local database stopped answering; try to get the connection
    /// back before treating the node as failed.
    async fn handle_local_disconnect(&mut self, cfg: &Config) -> Result<bool> {
        // No point trying to write this event anywhere: we are the
        // primary and our own database is gone.
        self.ctx
            .events
            .emit(
                None,
                EventKind::LocalDisconnect,
                true,
                "unable to connect to local node",
            )
            .await;

        let unreachable_start = Instant::now();
        match try_reconnect(
            &self.ctx.connector,
            &self.local_node.conninfo,
            cfg.reconnect_attempts,
            cfg.reconnect_interval,
            &self.ctx.signals,
        )
        .await
        {
            Some(link) => {
                self.local = link;
                self.ctx
                    .events
                    .emit(
                        Some(&self.local),
                        EventKind::LocalReconnect,
                        true,
                        &format!(
                            "reconnected to local node after {} seconds",
                            unreachable_start.elapsed().as_secs()
                        ),
                    )
                    .await;
                self.reinit_daemon_registry().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A local restart wipes the daemon registry; re-register if our entry
    /// is gone.
    async fn reinit_daemon_registry(&self) {
        match self.local.registered_node_id().await {
            Ok(None) => {
                if let Err(e) = self
                    .local
                    .register_daemon(self.local_node.node_id, std::process::id())
                    .await
                {
                    warn!("unable to re-register daemon: {}", e);
                }
            }
            _ => {}
        }
    }

    /// Verifies the node is still actually a primary; after an outage it
    /// may have come back as a standby (e.g. following a switchover).
    async fn still_primary(&self) -> bool {
        match self.local.recovery_type().await {
            Ok(RecoveryType::Standby) => {
                info!("local node is now a standby, switching to standby monitoring");
                false
            }
            _ => true,
        }
    }

    async fn enter_degraded_and_rejoin(&mut self, cfg: &Config, stop_database: bool) {
        self.degraded.enter();
        warn!("unable to monitor local node, falling back to degraded monitoring");

        if vip::vip_configured(&cfg.virtual_ip, &cfg.network_interface) {
            let _ = vip::release_virtual_ip(
                &self.ctx.runner,
                &cfg.virtual_ip,
                &cfg.network_interface,
            )
            .await;
        }

        if stop_database && !cfg.db_stop_command.is_empty() {
            match self.ctx.runner.run_local(&cfg.db_stop_command).await {
                Ok(out) if out.success() => info!("local database stopped"),
                Ok(out) => warn!("database stop command exited with {}", out.status),
                Err(e) => warn!("unable to stop local database: {}", e),
            }
        }

        // Give a surviving standby time to promote before asking to rejoin
        // under it.
        self.ctx
            .signals
            .wake_after(cfg.primary_notification_timeout)
            .await;
        self.attempt_auto_rejoin(cfg).await;
    }

    /// Offers the failed node back to the cluster: invokes the rejoin
    /// command against each known peer in turn until one accepts.
    async fn attempt_auto_rejoin(&mut self, cfg: &Config) -> bool {
        if cfg.rejoin_command.is_empty() {
            debug!("no rejoin_command configured, skipping auto-rejoin");
            return false;
        }

        for node in &self.nodes {
            if node.node_id == self.local_node.node_id || node.node_type.is_witness() {
                continue;
            }
            if !node.active {
                if !self.inactive_warned {
                    warn!(
                        "node \"{}\" (ID: {}) is inactive, skipping as rejoin donor",
                        node.name, node.node_id
                    );
                    self.inactive_warned = true;
                }
                continue;
            }

            let command = rejoin_command(&cfg.rejoin_command, &node.conninfo);
            info!(
                "attempting to rejoin as a standby of node \"{}\" (ID: {})",
                node.name, node.node_id
            );
            match self.ctx.runner.run_local(&command).await {
                Ok(out) if out.success() => {
                    self.ctx
                        .events
                        .emit(
                            None,
                            EventKind::NodeRejoin,
                            true,
                            &format!("node rejoined cluster via node {}", node.node_id),
                        )
                        .await;
                    return true;
                }
                Ok(out) => warn!(
                    "rejoin via node {} exited with status {}",
                    node.node_id, out.status
                ),
                Err(e) => warn!("rejoin via node {} failed: {}", node.node_id, e),
            }
        }

        self.ctx
            .events
            .emit(
                None,
                EventKind::NodeRejoin,
                false,
                "unable to rejoin the cluster via any known peer",
            )
            .await;
        false
    }

    async fn run_split_brain_guard(&mut self, cfg: &Config) -> Result<()> {
        let guard = SplitBrainGuard {
            connector: &self.ctx.connector,
            local: &self.local,
            local_node: &self.local_node,
        };
        match guard.check(&self.nodes).await? {
            BrainSplitAction::DoNothing => Ok(()),
            BrainSplitAction::DoStop => {
                self.ctx
                    .events
                    .emit(
                        None,
                        EventKind::SplitBrain,
                        false,
                        "more than two nodes are running as primary, stopping database",
                    )
                    .await;
                if vip::vip_configured(&cfg.virtual_ip, &cfg.network_interface) {
                    let _ = vip::release_virtual_ip(
                        &self.ctx.runner,
                        &cfg.virtual_ip,
                        &cfg.network_interface,
                    )
                    .await;
                }
                // Let in-flight replication drain before pulling the plug.
                self.ctx.signals.wake_after(Duration::from_secs(5)).await;
                if !cfg.db_stop_command.is_empty() {
                    let _ = self.ctx.runner.run_local(&cfg.db_stop_command).await;
                }
                Err(ReplGuardError::BrainSplit(
                    "more than two nodes are running as primary".to_string(),
                ))
            }
            BrainSplitAction::DoRejoin => {
                self.ctx
                    .events
                    .emit(
                        None,
                        EventKind::SplitBrain,
                        false,
                        "another primary with precedence detected, rejoining as a standby",
                    )
                    .await;
                self.enter_degraded_and_rejoin(cfg, true).await;
                Ok(())
            }
        }
    }

    /// Sync/async management for a cluster configured with exactly one
    /// synchronous standby: a sustained outage of that standby degrades
    /// replication to asynchronous so the primary can keep committing; the
    /// change is reversed once the standby is back and nearly caught up.
    async fn check_sync_async(&mut self, cfg: &Config) {
        let attached = match self.local.attached_standby_count().await {
            Ok(n) => n,
            Err(e) => {
                warn!("unable to query attached standby count: {}", e);
                return;
            }
        };

        if attached == 0 {
            let names = self.local.sync_standby_names().await.unwrap_or_default();
            if !one_sync_standby(&names) {
                return;
            }

            if self.sync_state.unreachable_since.is_none() {
                self.sync_state.unreachable_since = Some(Instant::now());
            }
            let elapsed = self
                .sync_state
                .unreachable_since
                .map(|s| s.elapsed())
                .unwrap_or_default();

            if !self.sync_state.switched_async {
                info!(
                    "synchronous standby node has been unreachable for {} seconds",
                    elapsed.as_secs()
                );
                if elapsed > cfg.sync_outage_threshold {
                    warn!(
                        "synchronous standby unreachable past {} seconds, degrading to \
                         asynchronous replication",
                        cfg.sync_outage_threshold.as_secs()
                    );
                    if self.set_sync_directive(cfg, false).await {
                        self.sync_state.switched_async = true;
                        self.ctx
                            .events
                            .emit(
                                Some(&self.local),
                                EventKind::SyncDegraded,
                                true,
                                "synchronous replication degraded to asynchronous",
                            )
                            .await;
                    }
                }
            }
            return;
        }

        self.sync_state.unreachable_since = None;

        if !self.sync_state.switched_async {
            return;
        }

        // A standby is back; restore synchronous mode once its lag drops
        // below the threshold.
        let primary_lsn = match self.local.node_current_lsn().await {
            Ok(lsn) => lsn,
            Err(e) => {
                warn!("unable to query current WAL position: {}", e);
                return;
            }
        };

        for node in &self.nodes {
            if node.node_id == self.local_node.node_id
                || node.node_type == NodeType::Witness
            {
                continue;
            }
            let Some(peer) = self.ctx.peer(node.node_id) else {
                continue;
            };
            if peer.is_in_recovery().await == RecoveryType::Primary {
                continue;
            }
            let Ok(repl) = peer.replication_info().await else {
                continue;
            };
            let lag = primary_lsn.saturating_distance(repl.last_wal_receive_lsn);
            info!(
                "standby node {} lags the primary by {} bytes",
                node.node_id, lag
            );
            if lag <= cfg.sync_restore_lag_bytes {
                if self.set_sync_directive(cfg, true).await {
                    self.sync_state.switched_async = false;
                    self.ctx
                        .events
                        .emit(
                            Some(&self.local),
                            EventKind::SyncRestored,
                            true,
                            "asynchronous replication restored to synchronous",
                        )
                        .await;
                }
                break;
            }
        }
    }

    /// Comments out (or restores) the `synchronous_standby_names` directive
    /// in the instance's configuration file, then asks the server to
    /// reload.
    async fn set_sync_directive(&self, cfg: &Config, enable: bool) -> bool {
        let path = std::path::Path::new(&cfg.data_directory).join("postgresql.conf");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("unable to read {:?}: {}", path, e);
                return false;
            }
        };

        let (updated, changed) = toggle_sync_directive(&content, enable);
        if !changed {
            debug!("no synchronous_standby_names directive to toggle in {:?}", path);
            return false;
        }
        if let Err(e) = tokio::fs::write(&path, updated).await {
            warn!("unable to write {:?}: {}", path, e);
            return false;
        }

        if !cfg.db_reload_command.is_empty() {
            match self.ctx.runner.run_local(&cfg.db_reload_command).await {
                Ok(out) if out.success() => {}
                Ok(out) => warn!("configuration reload exited with {}", out.status),
                Err(e) => warn!("unable to reload database configuration: {}", e),
            }
        }
        true
    }
}

/// Whether `synchronous_standby_names` requires exactly one synchronous
/// standby, e.g. `s1`, `s1, s2`, `FIRST 1 (s1, s2)` or `ANY 1 (s1, s2)`,
/// but not `2 (s1, s2)`.
pub fn one_sync_standby(names: &str) -> bool {
    let trimmed = names.trim();
    if trimmed.is_empty() {
        return false;
    }

    let mut rest = trimmed;
    for keyword in ["FIRST", "ANY", "first", "any"] {
        if let Some(stripped) = rest.strip_prefix(keyword) {
            rest = stripped.trim_start();
            break;
        }
    }

    match rest.find('(') {
        Some(paren) => {
            let prefix = rest[..paren].trim();
            if prefix.is_empty() {
                true
            } else {
                prefix.parse::<u32>().map(|n| n <= 1).unwrap_or(true)
            }
        }
        // A bare name list defaults to one synchronous standby.
        None => true,
    }
}

/// Comments out (`enable == false`) or restores (`enable == true`) the
/// sync-standby directive. Returns the new content and whether anything
/// changed.
pub fn toggle_sync_directive(content: &str, enable: bool) -> (String, bool) {
    let mut changed = false;
    let mut out = String::with_capacity(content.len() + 1);
    for line in content.lines() {
        let trimmed = line.trim_start();
        if enable {
            if let Some(rest) = trimmed.strip_prefix('#') {
                if rest.trim_start().starts_with("synchronous_standby_names") {
                    out.push_str(rest.trim_start());
                    out.push('\n');
                    changed = true;
                    continue;
                }
            }
        } else if trimmed.starts_with("synchronous_standby_names") {
            out.push('#');
            out.push_str(trimmed);
            out.push('\n');
            changed = true;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    (out, changed)
}
