// src/core/monitor/standby.rs

//! The monitor loop run while the local node is a standby.
//!
//! Watches the upstream node (the primary, or another standby when
//! cascading), hands control to the failover driver once the upstream is
//! declared down, writes monitoring history, and restarts itself whenever
//! the recorded upstream changes under it.

use crate::config::{Config, FailoverMode};
use crate::core::command::rejoin_command;
use crate::core::errors::{ReplGuardError, Result};
use crate::core::failover::FailoverDriver;
use crate::core::link::{Connector as _, DbLink};
use crate::core::metastore::{MetaStore as _, lag_bytes};
use crate::core::monitor::{DegradedTracker, MonitorOutcome, StatusTimer, try_reconnect};
use crate::core::types::{
    EventKind, MonitoringRow, MonitoringState, NodeRecord, NodeType, RecoveryType,
    UNKNOWN_NODE_ID,
};
use crate::daemon::context::DaemonContext;
use crate::daemon::signals::Wake;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct StandbyMonitor {
    ctx: Arc<DaemonContext>,
    local: Arc<dyn DbLink>,
    local_node: NodeRecord,
    upstream_node: NodeRecord,
    upstream_link: Option<Arc<dyn DbLink>>,
    /// Connection to the cluster primary; identical to the upstream link
    /// unless this is a cascaded standby.
    primary_link: Option<Arc<dyn DbLink>>,
    upstream_up: bool,
    degraded: DegradedTracker,
    local_degraded_since: Option<Instant>,
    last_known_upstream_id: i32,
    failed_local_connects: u32,
    promotion_failed: bool,
    reload_seen: u64,
}

impl StandbyMonitor {
    pub fn new(ctx: Arc<DaemonContext>, local: Arc<dyn DbLink>, local_node: NodeRecord) -> Self {
        let cfg = ctx.config();
        Self {
            ctx,
            local,
            local_node,
            upstream_node: NodeRecord {
                node_id: UNKNOWN_NODE_ID,
                name: String::new(),
                node_type: NodeType::Primary,
                upstream_node_id: None,
                location: "default".to_string(),
                priority: 0,
                active: false,
                conninfo: String::new(),
                repluser: String::new(),
            },
            upstream_link: None,
            primary_link: None,
            upstream_up: false,
            degraded: DegradedTracker::new(cfg.degraded_monitoring_timeout),
            local_degraded_since: None,
            last_known_upstream_id: UNKNOWN_NODE_ID,
            failed_local_connects: 0,
            promotion_failed: false,
            reload_seen: 0,
        }
    }

    pub async fn run(mut self) -> Result<MonitorOutcome> {
        let cfg = self.ctx.config();

        if let Err(e) = self.local.reset_voting_status().await {
            warn!("unable to reset voting status: {}", e);
        }

        if !self.resolve_upstream(&cfg).await? {
            return Ok(MonitorOutcome::Shutdown);
        }
        if self.upstream_node.node_id == self.local_node.node_id {
            // Stale metadata pointing the node at itself; re-detect roles.
            return Ok(MonitorOutcome::RestartMonitoring);
        }
        self.last_known_upstream_id = self.upstream_node.node_id;

        self.connect_primary().await;

        // Monitoring may have been restarted after an outage which left the
        // node marked inactive.
        if !self.local_node.active {
            if let Some(primary) = &self.primary_link {
                if primary
                    .update_active(self.local_node.node_id, true)
                    .await
                    .is_ok()
                {
                    self.local_node.active = true;
                }
            }
        }

        let detail = format!(
            "monitoring connection to upstream node \"{}\" (node ID: {})",
            self.upstream_node.name, self.upstream_node.node_id
        );
        let kind = if self.ctx.mark_startup_event() {
            EventKind::DaemonReload
        } else {
            EventKind::DaemonStart
        };
        self.ctx
            .events
            .emit(self.primary_store(), kind, true, &detail)
            .await;

        let mut status_timer = StatusTimer::new(cfg.log_status_interval);

        loop {
            if self.ctx.signals.terminated() {
                return self.shutdown().await;
            }
            if self.ctx.signals.reload_pending(&mut self.reload_seen) {
                if let Err(e) = self.ctx.reload_config().await {
                    warn!("unable to reload configuration: {}", e);
                }
            }
            let cfg = self.ctx.config();

            self.check_local_node(&cfg).await;

            if self.upstream_up {
                if let Some(outcome) = self.check_upstream(&cfg).await? {
                    return Ok(outcome);
                }
            }

            if self.degraded.active() {
                if let Some(outcome) = self.degraded_monitoring(&cfg).await? {
                    return Ok(outcome);
                }
            }

            if status_timer.due() {
                self.log_status(&cfg);
            }

            if cfg.monitoring_history {
                self.update_monitoring_history().await;
            }

            if let Some(outcome) = self.detect_upstream_change().await {
                return Ok(outcome);
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

    /// Determines which node to monitor. Prefers the upstream recorded for
    /// this node; scans for a primary otherwise. Tolerates an upstream
    /// that is down at startup for up to `standby_wait_timeout`.
    async fn resolve_upstream(&mut self, cfg: &Config) -> Result<bool> {
        if let Ok(Some(record)) = self.local.get_node(self.local_node.node_id).await {
            self.local_node = record;
        }

        let upstream = match self.local_node.upstream_node_id {
            Some(id) => match self.local.get_node(id).await? {
                Some(record) => record,
                None => {
                    return Err(ReplGuardError::Config(format!(
                        "no record found for upstream node (ID: {id})"
                    )));
                }
            },
            None => {
                // No upstream recorded; assume we should attach to the
                // current cluster primary.
                let nodes = self.local.get_all_nodes().await?;
                match nodes
                    .into_iter()
                    .find(|n| n.node_type == NodeType::Primary && n.active)
                {
                    Some(record) => record,
                    None => {
                        return Err(ReplGuardError::Config(
                            "unable to determine an active primary for this cluster".to_string(),
                        ));
                    }
                }
            }
        };
        debug!("upstream node ID determined as {}", upstream.node_id);
        self.upstream_node = upstream;

        match self.ctx.connector.connect(&self.upstream_node.conninfo).await {
            Ok(link) => {
                self.upstream_link = Some(link);
                self.upstream_up = true;
                return Ok(true);
            }
            Err(e) => {
                info!(
                    "upstream node not running at daemon start ({}), waiting up to {} seconds",
                    e,
                    cfg.standby_wait_timeout.as_secs()
                );
            }
        }

        let deadline = Instant::now() + cfg.standby_wait_timeout;
        while Instant::now() < deadline {
            if self.ctx.signals.wake_after(Duration::from_secs(10)).await == Wake::Terminate {
                return Ok(false);
            }
            // Keep the local connection alive while we wait.
            let _ = self.local.ping().await;
            if let Ok(link) = self.ctx.connector.connect(&self.upstream_node.conninfo).await {
                self.upstream_link = Some(link);
                self.upstream_up = true;
                return Ok(true);
            }
            debug!(
                "upstream node {} still unreachable, retrying",
                self.upstream_node.node_id
            );
        }

        if self.upstream_node.node_type == NodeType::Standby {
            warn!("upstream node is a standby and has not appeared, entering degraded monitoring");
            self.upstream_up = false;
            self.degraded.enter();
        } else {
            // A dead primary at startup: treat it as up so the monitor
            // loop immediately notices the loss and runs a failover.
            warn!("upstream primary is not up, monitoring will trigger failover handling");
            self.upstream_up = true;
        }
        Ok(true)
    }

    async fn connect_primary(&mut self) {
        if self.upstream_node.node_type != NodeType::Standby {
            self.primary_link = self.upstream_link.clone();
            return;
        }
        // Cascaded standby: the upstream is itself a standby, so find the
        // cluster primary separately.
        let nodes = match self.local.get_all_nodes().await {
            Ok(nodes) => nodes,
            Err(_) => return,
        };
        for record in nodes {
            if record.node_type != NodeType::Primary || !record.active {
                continue;
            }
            if let Ok(link) = self.ctx.connector.connect(&record.conninfo).await {
                if link.recovery_type().await == Ok(RecoveryType::Primary) {
                    self.primary_link = Some(link);
                    return;
                }
            }
        }
        warn!("unable to connect to the cluster primary");
    }

    fn primary_store(&self) -> Option<&Arc<dyn DbLink>> {
        self.primary_link.as_ref()
    }

    async fn shutdown(&self) -> Result<MonitorOutcome> {
        let store = if self.primary_link.is_some() {
            self.primary_link.as_ref()
        } else if self.local.ping().await.is_ok() {
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

    /// Local-node supervision: mark the node inactive while its database is
    /// down, ask the rejoin command to reattach it once the reconnect
    /// budget is spent, and mark it active again on recovery.
    async fn check_local_node(&mut self, cfg: &Config) {
        if self.local.ping().await.is_err() {
            self.failed_local_connects += 1;

            if self.local_node.active {
                self.local_node.active = false;
                let detail = format!(
                    "unable to connect to local node \"{}\" (ID: {}), marking inactive",
                    self.local_node.name, self.local_node.node_id
                );
                let mut success = true;
                if let Some(primary) = &self.primary_link {
                    if primary
                        .update_active(self.local_node.node_id, false)
                        .await
                        .is_err()
                    {
                        success = false;
                        warn!(
                            "unable to mark node \"{}\" (ID: {}) as inactive",
                            self.local_node.name, self.local_node.node_id
                        );
                    }
                }
                self.ctx
                    .events
                    .emit(self.primary_store(), EventKind::StandbyFailure, success, &detail)
                    .await;
            }

            if self.local_degraded_since.is_none() {
                info!("entering degraded monitoring for the local node");
                self.local_degraded_since = Some(Instant::now());
            }

            // Past the reconnect budget, let the rejoin command try to
            // reattach the local instance under the current upstream.
            if self.failed_local_connects >= cfg.reconnect_attempts
                && !cfg.rejoin_command.is_empty()
            {
                let command = rejoin_command(&cfg.rejoin_command, &self.upstream_node.conninfo);
                match self.ctx.runner.run_local(&command).await {
                    Ok(out) if out.success() => info!("local node rejoin command succeeded"),
                    Ok(out) => warn!("unable to execute node rejoin (status {})", out.status),
                    Err(e) => warn!("unable to execute node rejoin: {}", e),
                }
            }
            return;
        }

        self.failed_local_connects = 0;

        if let Some(since) = self.local_degraded_since.take() {
            info!(
                "connection to local node recovered after {} seconds",
                since.elapsed().as_secs()
            );
            if let Ok(Some(record)) = self.local.get_node(self.local_node.node_id).await {
                self.local_node = record;
            }
        }

        // A restart wipes the daemon registry.
        if let Ok(None) = self.local.registered_node_id().await {
            if let Err(e) = self
                .local
                .register_daemon(self.local_node.node_id, std::process::id())
                .await
            {
                warn!("unable to re-register daemon: {}", e);
            }
        }

        if !self.local_node.active {
            if let Some(primary) = &self.primary_link {
                if primary
                    .update_active(self.local_node.node_id, true)
                    .await
                    .is_ok()
                {
                    self.local_node.active = true;
                    let detail = format!(
                        "reconnected to local node \"{}\" (ID: {}), marking active",
                        self.local_node.name, self.local_node.node_id
                    );
                    self.ctx
                        .events
                        .emit(self.primary_store(), EventKind::StandbyRecovery, true, &detail)
                        .await;
                }
            }
        }
    }

    /// Probes the upstream; on sustained loss hands over to the failover
    /// driver. Returns a monitor outcome when monitoring must restart.
    async fn check_upstream(&mut self, cfg: &Config) -> Result<Option<MonitorOutcome>> {
        let upstream_ok = match &self.upstream_link {
            Some(link) => link.ping().await.is_ok(),
            None => false,
        };
        if upstream_ok {
            return Ok(None);
        }

        let unreachable_start = Instant::now();
        let detail = format!(
            "unable to connect to upstream node \"{}\" (node ID: {})",
            self.upstream_node.name, self.upstream_node.node_id
        );
        warn!("{}", detail);
        // When the upstream was the primary there is nowhere authoritative
        // to write the event row.
        let store = if self.upstream_node.node_type == NodeType::Standby {
            self.primary_store()
        } else {
            None
        };
        self.ctx
            .events
            .emit(store, EventKind::UpstreamDisconnect, true, &detail)
            .await;

        // Last-minute local reconnect before committing to a failover.
        if self.local.ping().await.is_err() {
            if let Ok(link) = self.ctx.connector.connect(&self.local_node.conninfo).await {
                self.local = link;
            }
        }

        if let Some(link) = try_reconnect(
            &self.ctx.connector,
            &self.upstream_node.conninfo,
            cfg.reconnect_attempts,
            cfg.reconnect_interval,
            &self.ctx.signals,
        )
        .await
        {
            // Upstream recovered. If it was the primary but has come back
            // as a standby, monitoring must be restarted from scratch.
            if self.upstream_node.node_type == NodeType::Primary
                && link.recovery_type().await == Ok(RecoveryType::Standby)
            {
                info!(
                    "current upstream node \"{}\" (node ID: {}) is not primary, restarting \
                     monitoring",
                    self.upstream_node.name, self.upstream_node.node_id
                );
                return Ok(Some(MonitorOutcome::RestartMonitoring));
            }

            self.upstream_link = Some(link.clone());
            if self.upstream_node.node_type == NodeType::Primary {
                self.primary_link = Some(link);
            }
            self.ctx
                .events
                .emit(
                    self.primary_store(),
                    EventKind::UpstreamReconnect,
                    true,
                    &format!(
                        "reconnected to upstream node after {} seconds",
                        unreachable_start.elapsed().as_secs()
                    ),
                )
                .await;
            return Ok(None);
        }

        // Upstream is down for good as far as we can tell.
        self.upstream_up = false;
        self.upstream_link = None;

        if self.upstream_node.node_type == NodeType::Primary {
            let driver = FailoverDriver::new(
                &self.ctx,
                self.local.clone(),
                self.local_node.clone(),
                self.upstream_node.clone(),
            );
            let outcome = driver.run().await?;
            self.local = outcome.local;
            self.local_node = outcome.local_node;
            self.upstream_node = outcome.upstream_node;
            self.promotion_failed = outcome.promotion_failed;

            if outcome.resolved {
                return Ok(Some(MonitorOutcome::RestartMonitoring));
            }
            if outcome.upstream_restored {
                // Election rerun: treat the upstream as up so the next
                // probe failure triggers a fresh election.
                self.upstream_up = true;
                return Ok(None);
            }
            self.degraded.enter();
            return Ok(None);
        }

        // Cascaded standby whose upstream standby died: follow the cluster
        // primary directly.
        match self.upstream_standby_failover(cfg).await? {
            true => Ok(Some(MonitorOutcome::RestartMonitoring)),
            false => {
                self.degraded.enter();
                Ok(None)
            }
        }
    }

    /// The upstream standby of a cascaded standby is gone; repoint the
    /// local node at the cluster primary.
    async fn upstream_standby_failover(&mut self, cfg: &Config) -> Result<bool> {
        if cfg.failover == FailoverMode::Manual {
            info!("this node is not configured for automatic failover");
            return Ok(false);
        }

        let nodes = self.local.get_all_nodes().await?;
        let Some(primary_record) = nodes
            .iter()
            .find(|n| n.node_type == NodeType::Primary && n.active)
            .cloned()
        else {
            warn!("unable to retrieve primary node record");
            return Ok(false);
        };

        let Ok(primary_link) = self.ctx.connector.connect(&primary_record.conninfo).await
        else {
            warn!(
                "unable to connect to last known primary \"{}\" (ID: {})",
                primary_record.name, primary_record.node_id
            );
            return Ok(false);
        };
        if primary_link.recovery_type().await != Ok(RecoveryType::Primary) {
            warn!(
                "last known primary \"{}\" (ID: {}) is not running as primary, not following",
                primary_record.name, primary_record.node_id
            );
            return Ok(false);
        }

        let driver = FailoverDriver::new(
            &self.ctx,
            self.local.clone(),
            self.local_node.clone(),
            self.upstream_node.clone(),
        );
        let outcome = driver.follow_only(primary_record.node_id).await?;
        self.local = outcome.local;
        self.local_node = outcome.local_node;
        self.upstream_node = outcome.upstream_node;

        if outcome.resolved {
            // Record the new upstream so the metadata matches reality.
            if primary_link
                .update_upstream(self.local_node.node_id, Some(primary_record.node_id))
                .await
                .is_err()
            {
                warn!(
                    "unable to set node {}'s new upstream ID to {}",
                    self.local_node.node_id, primary_record.node_id
                );
            }
            self.primary_link = Some(primary_link);
        }
        Ok(outcome.resolved)
    }

    /// Degraded monitoring: wait for the upstream to recover, for a new
    /// primary to appear, or for the hard timeout to expire.
    async fn degraded_monitoring(&mut self, cfg: &Config) -> Result<Option<MonitorOutcome>> {
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
            "monitoring upstream node {} in degraded state for {} seconds",
            self.upstream_node.node_id,
            self.degraded.elapsed_secs()
        );

        // Has the upstream come back?
        if let Ok(link) = self.ctx.connector.connect(&self.upstream_node.conninfo).await {
            debug!("upstream node {} has recovered", self.upstream_node.node_id);
            self.upstream_link = Some(link.clone());
            self.upstream_up = true;
            if self.upstream_node.node_type == NodeType::Primary {
                self.primary_link = Some(link);
            } else if self.primary_link.is_none() {
                self.connect_primary().await;
            }
            let elapsed = self.degraded.elapsed_secs();
            self.degraded.clear();
            self.ctx
                .events
                .emit(
                    self.primary_store(),
                    EventKind::UpstreamReconnect,
                    true,
                    &format!(
                        "reconnected to upstream node {} after {} seconds, resuming monitoring",
                        self.upstream_node.node_id, elapsed
                    ),
                )
                .await;
            return Ok(None);
        }

        // The local node may have been promoted while we were degraded.
        if self.local.recovery_type().await == Ok(RecoveryType::Primary) {
            info!("local node is primary, checking local node state");

            if self.promotion_failed {
                // The promote command timed out but the promotion itself
                // went through; fix up the metadata and take over.
                if let Err(e) = self.local.update_type_primary(self.local_node.node_id).await {
                    warn!("unable to update own node record to primary: {}", e);
                }
                if let Ok(Some(record)) = self.local.get_node(self.local_node.node_id).await {
                    self.local_node = record;
                }
                info!(
                    "resuming monitoring as primary node after {} seconds",
                    self.degraded.elapsed_secs()
                );
                self.ctx
                    .events
                    .emit(
                        Some(&self.local),
                        EventKind::FailoverPromote,
                        true,
                        "promotion command failed but promotion completed successfully",
                    )
                    .await;
                self.notify_siblings_to_follow_self().await;
                return Ok(Some(MonitorOutcome::RestartMonitoring));
            }

            if let Ok(Some(record)) = self.local.get_node(self.local_node.node_id).await {
                self.local_node = record;
            }
            if self.local_node.node_type == NodeType::Primary {
                info!(
                    "resuming monitoring as primary node after {} seconds",
                    self.degraded.elapsed_secs()
                );
                return Ok(Some(MonitorOutcome::RestartMonitoring));
            }
            // Metadata not yet updated; we'll catch it on a later loop.
            return Ok(None);
        }

        // Check whether one of the siblings has been promoted.
        if cfg.failover == FailoverMode::Automatic {
            let siblings = self
                .local
                .get_active_siblings(self.local_node.node_id, self.upstream_node.node_id)
                .await
                .unwrap_or_default();
            self.ctx.refresh_peers(&siblings, self.local_node.node_id);
            debug!(
                "scanning {} node records to detect new primary...",
                siblings.len()
            );
            for record in siblings {
                if record.node_type.is_witness() {
                    continue;
                }
                let Some(peer) = self.ctx.peer(record.node_id) else {
                    continue;
                };
                if peer.is_in_recovery().await == RecoveryType::Primary {
                    let driver = FailoverDriver::new(
                        &self.ctx,
                        self.local.clone(),
                        self.local_node.clone(),
                        self.upstream_node.clone(),
                    );
                    let outcome = driver.follow_only(record.node_id).await?;
                    self.local = outcome.local;
                    self.local_node = outcome.local_node;
                    self.upstream_node = outcome.upstream_node;
                    if outcome.resolved {
                        return Ok(Some(MonitorOutcome::RestartMonitoring));
                    }
                    break;
                }
            }
        }

        Ok(None)
    }

    async fn notify_siblings_to_follow_self(&self) {
        let term = self.local.get_current_term().await.unwrap_or(0);
        let siblings = self
            .local
            .get_active_siblings(
                self.local_node.node_id,
                self.last_known_upstream_id,
            )
            .await
            .unwrap_or_default();
        info!("{} followers to notify", siblings.len());
        for record in siblings {
            match self.ctx.connector.connect(&record.conninfo).await {
                Ok(link) => {
                    if let Err(e) = link
                        .notify_follow_primary(self.local_node.node_id, term)
                        .await
                    {
                        warn!("unable to notify node {}: {}", record.node_id, e);
                    }
                }
                Err(e) => warn!(
                    "unable to reconnect to \"{}\" (node ID: {}): {}",
                    record.name, record.node_id, e
                ),
            }
        }
    }

    fn log_status(&self, cfg: &Config) {
        let state = if self.degraded.active() {
            MonitoringState::Degraded
        } else {
            MonitoringState::Normal
        };
        let mut summary = format!(
            "node \"{}\" (node ID: {}) monitoring upstream node \"{}\" (node ID: {}) in {} state",
            self.local_node.name,
            self.local_node.node_id,
            self.upstream_node.name,
            self.upstream_node.node_id,
            state
        );
        if cfg.failover == FailoverMode::Manual {
            summary.push_str(" (automatic failover disabled)");
        }
        info!("{}", summary);
    }

    /// Appends one monitoring-history row via the primary connection.
    async fn update_monitoring_history(&mut self) {
        let Some(primary) = self.primary_link.clone() else {
            debug!("monitoring_history requested but primary connection not available");
            return;
        };
        if primary.ping().await.is_err() {
            return;
        }

        let primary_lsn = match primary.node_current_lsn().await {
            Ok(lsn) => lsn,
            Err(e) => {
                warn!("unable to retrieve primary WAL position: {}", e);
                return;
            }
        };
        let repl = match self.local.replication_info(NodeType::Standby).await {
            Ok(repl) => repl,
            Err(e) => {
                warn!("unable to retrieve local replication info: {}", e);
                return;
            }
        };

        let row = MonitoringRow {
            primary_node_id: self.upstream_node.node_id,
            standby_node_id: self.local_node.node_id,
            ts: Utc::now(),
            primary_lsn,
            standby_recv_lsn: repl.last_wal_receive_lsn,
            standby_replay_ts: repl.last_xact_replay_ts,
            replication_lag_bytes: lag_bytes(primary_lsn, repl.last_wal_receive_lsn),
            apply_lag_bytes: lag_bytes(repl.last_wal_receive_lsn, repl.last_wal_replay_lsn),
        };
        if let Err(e) = primary.append_monitoring_row(&row).await {
            debug!("unable to write monitoring history: {}", e);
        }
    }

    /// Restart monitoring when the upstream recorded for this node no
    /// longer matches the one being monitored. The local record can lag
    /// after a failover, so the upstream's copy gets the casting vote.
    async fn detect_upstream_change(&mut self) -> Option<MonitorOutcome> {
        if self.local_degraded_since.is_some() || self.degraded.active() {
            return None;
        }
        let record = match self.local.get_node(self.local_node.node_id).await {
            Ok(Some(record)) => record,
            _ => return None,
        };
        let recorded_upstream = record.upstream_node_id.unwrap_or(UNKNOWN_NODE_ID);
        self.local_node = record;

        if recorded_upstream == self.last_known_upstream_id {
            return None;
        }

        if let Some(primary) = &self.primary_link {
            if let Ok(Some(on_upstream)) = primary.get_node(self.local_node.node_id).await {
                if on_upstream.upstream_node_id.unwrap_or(UNKNOWN_NODE_ID)
                    == self.last_known_upstream_id
                {
                    // The local record simply hasn't caught up yet.
                    self.local_node.upstream_node_id = Some(self.last_known_upstream_id);
                    return None;
                }
            }
        }

        info!(
            "local node {}'s upstream appears to have changed, restarting monitoring \
             (currently monitoring upstream {}; new upstream is {})",
            self.local_node.node_id, self.last_known_upstream_id, recorded_upstream
        );
        Some(MonitorOutcome::RestartMonitoring)
    }
}
