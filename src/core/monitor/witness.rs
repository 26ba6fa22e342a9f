// src/core/monitor/witness.rs

//! The monitor loop run on a witness node.
//!
//! The witness keeps a mirror of the primary's node table so quorum
//! calculations keep working after the primary fails, but it never votes
//! and is never a promotion target. On primary loss it simply waits for a
//! surviving standby to announce the new primary, then follows it in the
//! metadata only.

use crate::config::Config;
use crate::core::errors::{ReplGuardError, Result};
use crate::core::link::{Connector as _, DbLink};
use crate::core::metastore::MetaStore as _;
use crate::core::monitor::{DegradedTracker, MonitorOutcome, StatusTimer, try_reconnect};
use crate::core::types::{
    ELECTION_RERUN_NOTIFICATION, EventKind, MonitoringState, NodeId, NodeRecord, NodeType,
    RecoveryType,
};
use crate::daemon::context::DaemonContext;
use crate::daemon::signals::Wake;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct WitnessMonitor {
    ctx: Arc<DaemonContext>,
    local: Arc<dyn DbLink>,
    local_node: NodeRecord,
    primary_node: Option<NodeRecord>,
    primary_link: Option<Arc<dyn DbLink>>,
    primary_up: bool,
    degraded: DegradedTracker,
    last_sync: Instant,
    reload_seen: u64,
}

impl WitnessMonitor {
    pub fn new(ctx: Arc<DaemonContext>, local: Arc<dyn DbLink>, local_node: NodeRecord) -> Self {
        let cfg = ctx.config();
        Self {
            ctx,
            local,
            local_node,
            primary_node: None,
            primary_link: None,
            primary_up: false,
            degraded: DegradedTracker::new(cfg.degraded_monitoring_timeout),
            last_sync: Instant::now(),
            reload_seen: 0,
        }
    }

    pub async fn run(mut self) -> Result<MonitorOutcome> {
        let cfg = self.ctx.config();

        self.locate_primary().await?;
        self.sync_node_records().await;

        let Some(primary) = self.primary_node.clone() else {
            return Ok(MonitorOutcome::RestartMonitoring);
        };
        let detail = format!(
            "witness monitoring cluster primary \"{}\" (node ID: {})",
            primary.name, primary.node_id
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

            self.check_local_node().await;

            if self.primary_up {
                self.check_primary(&cfg).await;
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
                self.degraded_monitoring().await;
            }

            if status_timer.due() {
                let state = if self.degraded.active() {
                    MonitoringState::Degraded
                } else {
                    MonitoringState::Normal
                };
                if let Some(primary) = &self.primary_node {
                    info!(
                        "witness node \"{}\" (node ID: {}) monitoring primary \"{}\" \
                         (node ID: {}) in {} state",
                        self.local_node.name,
                        self.local_node.node_id,
                        primary.name,
                        primary.node_id,
                        state
                    );
                }
            }

            // Keep the mirrored node table current so it stays usable after
            // the primary goes away.
            if self.primary_up && self.last_sync.elapsed() >= cfg.witness_sync_interval {
                self.sync_node_records().await;
            }

            if self.ctx.signals.wake_after(cfg.monitor_interval).await == Wake::Terminate {
                return self.shutdown().await;
            }
        }
    }

    async fn locate_primary(&mut self) -> Result<()> {
        let record = match self.local_node.upstream_node_id {
            Some(id) => self.local.get_node(id).await?,
            None => self
                .local
                .get_all_nodes()
                .await?
                .into_iter()
                .find(|n| n.node_type == NodeType::Primary && n.active),
        };
        let Some(record) = record else {
            return Err(ReplGuardError::Config(
                "unable to determine the primary this witness should track".to_string(),
            ));
        };

        match self.ctx.connector.connect(&record.conninfo).await {
            Ok(link) => {
                self.primary_link = Some(link);
                self.primary_up = true;
            }
            Err(e) => {
                warn!(
                    "unable to connect to primary \"{}\" (ID: {}): {}",
                    record.name, record.node_id, e
                );
                self.primary_up = false;
                self.degraded.enter();
            }
        }
        self.primary_node = Some(record);
        Ok(())
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

    async fn check_local_node(&mut self) {
        if self.local.ping().await.is_ok() {
            if let Ok(None) = self.local.registered_node_id().await {
                if let Err(e) = self
                    .local
                    .register_daemon(self.local_node.node_id, std::process::id())
                    .await
                {
                    warn!("unable to re-register daemon: {}", e);
                }
            }
            return;
        }
        warn!("unable to connect to witness's local node");
        if let Ok(link) = self.ctx.connector.connect(&self.local_node.conninfo).await {
            self.local = link;
        }
    }

    async fn check_primary(&mut self, cfg: &Config) {
        let primary_ok = match &self.primary_link {
            Some(link) => link.ping().await.is_ok(),
            None => false,
        };
        if primary_ok {
            return;
        }

        let Some(primary) = self.primary_node.clone() else {
            return;
        };
        self.ctx
            .events
            .emit(
                None,
                EventKind::UpstreamDisconnect,
                true,
                &format!(
                    "unable to connect to cluster primary \"{}\" (node ID: {})",
                    primary.name, primary.node_id
                ),
            )
            .await;

        if let Some(link) = try_reconnect(
            &self.ctx.connector,
            &primary.conninfo,
            cfg.reconnect_attempts,
            cfg.reconnect_interval,
            &self.ctx.signals,
        )
        .await
        {
            self.primary_link = Some(link);
            self.ctx
                .events
                .emit(
                    self.primary_store(),
                    EventKind::UpstreamReconnect,
                    true,
                    "reconnected to cluster primary",
                )
                .await;
            return;
        }

        self.primary_up = false;
        self.primary_link = None;

        // The witness plays no part in the election; wait for a surviving
        // standby to announce the winner.
        match self.wait_primary_notification(cfg).await {
            Some(target) => {
                if !self.follow_new_primary(target).await {
                    self.degraded.enter();
                }
            }
            None => self.degraded.enter(),
        }
    }

    async fn wait_primary_notification(&self, cfg: &Config) -> Option<NodeId> {
        let timeout_secs = cfg.primary_notification_timeout.as_secs().max(1);
        for _ in 0..timeout_secs {
            match self.local.get_new_primary().await {
                Ok(Some(notification))
                    if notification.target_id != ELECTION_RERUN_NOTIFICATION =>
                {
                    return Some(notification.target_id);
                }
                Ok(_) => {}
                Err(e) => debug!("unable to poll for new primary: {}", e),
            }
            if self.ctx.signals.wake_after(Duration::from_secs(1)).await == Wake::Terminate {
                return None;
            }
        }
        warn!(
            "no notification received from a new primary within {} seconds",
            timeout_secs
        );
        None
    }

    /// Follow-as-witness: no replication change, only metadata. The
    /// witness's upstream is repointed at the new primary and the node
    /// table re-mirrored from it.
    async fn follow_new_primary(&mut self, new_primary_id: NodeId) -> bool {
        let record = match self.local.get_node(new_primary_id).await {
            Ok(Some(record)) => record,
            _ => {
                warn!(
                    "unable to retrieve metadata record for new primary node (ID: {})",
                    new_primary_id
                );
                return false;
            }
        };
        let Ok(link) = self.ctx.connector.connect(&record.conninfo).await else {
            warn!("unable to connect to new primary node {}", new_primary_id);
            return false;
        };
        if link.recovery_type().await != Ok(RecoveryType::Primary) {
            warn!("new primary node {} is not in primary mode", new_primary_id);
            return false;
        }

        if let Err(e) = link
            .update_upstream(self.local_node.node_id, Some(new_primary_id))
            .await
        {
            warn!("unable to update witness upstream record: {}", e);
            return false;
        }

        self.primary_node = Some(record.clone());
        self.primary_link = Some(link);
        self.primary_up = true;
        self.degraded.clear();
        self.sync_node_records().await;

        self.ctx
            .events
            .emit(
                self.primary_store(),
                EventKind::FailoverFollow,
                true,
                &format!(
                    "witness node {} now following new primary node {}",
                    self.local_node.node_id, new_primary_id
                ),
            )
            .await;
        true
    }

    async fn degraded_monitoring(&mut self) {
        debug!(
            "witness in degraded state for {} seconds",
            self.degraded.elapsed_secs()
        );

        if let Some(primary) = self.primary_node.clone() {
            if let Ok(link) = self.ctx.connector.connect(&primary.conninfo).await {
                if link.recovery_type().await == Ok(RecoveryType::Primary) {
                    self.primary_link = Some(link);
                    self.primary_up = true;
                    let elapsed = self.degraded.elapsed_secs();
                    self.degraded.clear();
                    self.ctx
                        .events
                        .emit(
                            self.primary_store(),
                            EventKind::UpstreamReconnect,
                            true,
                            &format!(
                                "reconnected to primary after {} seconds, resuming monitoring",
                                elapsed
                            ),
                        )
                        .await;
                    return;
                }
            }
        }

        // Still no primary; keep an eye on the notification row.
        if let Ok(Some(notification)) = self.local.get_new_primary().await {
            if notification.target_id != ELECTION_RERUN_NOTIFICATION
                && self.follow_new_primary(notification.target_id).await
            {
                info!("witness following new primary after degraded monitoring");
            }
        }
    }

    /// Mirrors the primary's node table into the witness's local copy.
    async fn sync_node_records(&mut self) {
        let Some(primary) = self.primary_link.clone() else {
            return;
        };
        match primary.get_all_nodes().await {
            Ok(nodes) => {
                if let Err(e) = self.local.replace_nodes(&nodes).await {
                    warn!("unable to mirror node records: {}", e);
                } else {
                    debug!("mirrored {} node records from the primary", nodes.len());
                    self.ctx.refresh_peers(&nodes, self.local_node.node_id);
                }
                self.last_sync = Instant::now();
            }
            Err(e) => warn!("unable to retrieve node records from primary: {}", e),
        }
    }
}
