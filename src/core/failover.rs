// src/core/failover.rs

//! The failover state machine a standby pumps after its upstream has been
//! declared down: run the election, promote itself or wait for the winner,
//! follow the new primary, or hand the decision back to the operator.

use crate::config::{Config, FailoverMode};
use crate::core::command::{CommandRunner, follow_command};
use crate::core::election::{ElectionCoordinator, Sibling};
use crate::core::errors::Result;
use crate::core::events::EventBus;
use crate::core::metastore::MetaStore as _;
use crate::core::link::{Connector, DbLink};
use crate::core::types::{
    ELECTION_RERUN_NOTIFICATION, ElectionResult, EventKind, FailoverState, NodeId, NodeRecord,
    NodeStatus, Lsn, RecoveryType, Term,
};
use crate::core::vip;
use crate::daemon::context::DaemonContext;
use crate::daemon::signals::{SignalHub, Wake};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the monitor should do once the state machine has resolved.
pub struct FailoverOutcome {
    /// The transition completed; restart monitoring so the daemon picks up
    /// its (possibly new) role.
    pub resolved: bool,
    /// Enter degraded monitoring.
    pub degraded: bool,
    /// The upstream should be treated as up again so the outer loop
    /// retriggers an election (election rerun).
    pub upstream_restored: bool,
    /// The promote command failed; the promotion may nevertheless have
    /// succeeded, which degraded monitoring will detect.
    pub promotion_failed: bool,
    pub local: Arc<dyn DbLink>,
    pub local_node: NodeRecord,
    pub upstream_node: NodeRecord,
}

pub struct FailoverDriver {
    cfg: Config,
    connector: Arc<dyn Connector>,
    runner: Arc<dyn CommandRunner>,
    events: Arc<EventBus>,
    signals: Arc<SignalHub>,
    local: Arc<dyn DbLink>,
    local_node: NodeRecord,
    upstream_node: NodeRecord,
}

impl FailoverDriver {
    pub fn new(
        ctx: &DaemonContext,
        local: Arc<dyn DbLink>,
        local_node: NodeRecord,
        upstream_node: NodeRecord,
    ) -> Self {
        Self {
            cfg: ctx.config(),
            connector: ctx.connector.clone(),
            runner: ctx.runner.clone(),
            events: ctx.events.clone(),
            signals: ctx.signals.clone(),
            local,
            local_node,
            upstream_node,
        }
    }

    pub async fn run(mut self) -> Result<FailoverOutcome> {
        // Double-check the local connection before committing to anything.
        if self.local.ping().await.is_err() {
            match self.connector.connect(&self.local_node.conninfo).await {
                Ok(link) => self.local = link,
                Err(e) => {
                    warn!("local connection unavailable at failover start: {}", e);
                }
            }
        }

        let disconnect_wal = self.cfg.standby_disconnect_on_failover;
        if disconnect_wal {
            self.disconnect_wal_receivers().await;
        }

        let election = ElectionCoordinator {
            cfg: &self.cfg,
            connector: &self.connector,
            runner: &self.runner,
            local: &self.local,
            local_node: &self.local_node,
            upstream_node: &self.upstream_node,
        }
        .run()
        .await?;

        if disconnect_wal {
            if let Err(e) = self.local.enable_wal_receiver().await {
                warn!("unable to re-enable WAL receiver: {}", e);
            }
        }

        debug!("election result: {}", election.result);

        let term = election.term;
        let mut siblings = election.siblings;
        let mut degraded = election.degraded;
        let mut upstream_restored = false;
        let mut promotion_failed = false;

        let mut state = match election.result {
            ElectionResult::Cancelled => {
                match election.new_primary_id {
                    None => {
                        info!("election cancelled");
                        return Ok(self.outcome(false, degraded, false));
                    }
                    Some(id) => {
                        info!("follower node intending to follow new primary {}", id);
                        self.follow_new_primary(id).await
                    }
                }
            }
            ElectionResult::Rerun => {
                info!("promotion candidate election will be rerun");
                self.notify_followers(&mut siblings, ELECTION_RERUN_NOTIFICATION, term)
                    .await;
                FailoverState::ElectionRerun
            }
            ElectionResult::Won => {
                if siblings.is_empty() {
                    info!("this node is the only available candidate and will now promote itself");
                } else {
                    info!("this node is the winner, will now promote itself and inform other nodes");
                }
                self.promote_self(term).await
            }
            ElectionResult::Lost | ElectionResult::NotCandidate => {
                if election.result == ElectionResult::NotCandidate
                    && self.upstream_node.location != self.local_node.location
                {
                    info!(
                        "this node's location (\"{}\") is not the primary node location \
                         (\"{}\"), so node cannot be promoted",
                        self.local_node.location, self.upstream_node.location
                    );
                }
                info!("follower node awaiting notification from a candidate node");
                FailoverState::WaitingNewPrimary
            }
        };

        if state == FailoverState::WaitingNewPrimary {
            state = match self.wait_primary_notification(term).await {
                Some(target) if target == self.upstream_node.node_id => {
                    FailoverState::FollowingOriginalPrimary
                }
                Some(target) if target == self.local_node.node_id => {
                    info!("this node is promotion candidate, promoting");
                    let state = self.promote_self(term).await;
                    // Refresh the sibling list for follow notifications.
                    if state == FailoverState::Promoted {
                        siblings = self.load_sibling_records().await;
                    }
                    state
                }
                Some(ELECTION_RERUN_NOTIFICATION) => {
                    info!("received notification from promotion candidate to rerun election");
                    FailoverState::ElectionRerun
                }
                Some(target) if self.cfg.failover == FailoverMode::Manual => {
                    self.emit_manual_failover_event(target).await;
                    FailoverState::RequiresManualFailover
                }
                Some(target) => self.follow_new_primary(target).await,
                None => FailoverState::NoNewPrimary,
            };
        }

        debug!("failover state is {}", state);

        let resolved = match state {
            FailoverState::Promoted => {
                // Former siblings should now follow this node.
                self.notify_followers(&mut siblings, self.local_node.node_id, term)
                    .await;
                info!("switching to primary monitoring mode");
                true
            }
            FailoverState::PrimaryReappeared => {
                self.notify_followers(&mut siblings, self.upstream_node.node_id, term)
                    .await;
                info!(
                    "resuming monitoring, original primary \"{}\" (node ID: {}) reappeared",
                    self.upstream_node.name, self.upstream_node.node_id
                );
                true
            }
            FailoverState::ElectionRerun => {
                info!(
                    "rerunning election after {} seconds",
                    self.cfg.election_rerun_interval.as_secs()
                );
                self.signals.wake_after(self.cfg.election_rerun_interval).await;
                info!("election rerun will now commence");
                // Treat the upstream as up so monitoring retriggers the
                // election on the next probe failure.
                upstream_restored = true;
                false
            }
            FailoverState::FollowedNewPrimary => {
                info!(
                    "resuming monitoring, following new primary \"{}\" (node ID: {})",
                    self.upstream_node.name, self.upstream_node.node_id
                );
                true
            }
            FailoverState::FollowingOriginalPrimary => {
                info!(
                    "resuming monitoring, following original primary \"{}\" (node ID: {})",
                    self.upstream_node.name, self.upstream_node.node_id
                );
                true
            }
            FailoverState::PromotionFailed => {
                degraded = true;
                promotion_failed = true;
                false
            }
            FailoverState::FollowFail => {
                degraded = true;
                false
            }
            FailoverState::RequiresManualFailover => {
                info!("automatic failover disabled for this node, manual intervention required");
                degraded = true;
                false
            }
            _ => false,
        };

        let mut outcome = self.outcome(resolved, degraded, upstream_restored);
        outcome.promotion_failed = promotion_failed;
        Ok(outcome)
    }

    /// Follows `target` without running an election first; used when
    /// degraded monitoring discovers an already-promoted primary.
    pub async fn follow_only(mut self, target: NodeId) -> Result<FailoverOutcome> {
        let state = self.follow_new_primary(target).await;
        let resolved = state == FailoverState::FollowedNewPrimary;
        let degraded = state == FailoverState::FollowFail;
        Ok(self.outcome(resolved, degraded, false))
    }

    fn outcome(self, resolved: bool, degraded: bool, upstream_restored: bool) -> FailoverOutcome {
        FailoverOutcome {
            resolved,
            degraded,
            upstream_restored,
            promotion_failed: false,
            local: self.local,
            local_node: self.local_node,
            upstream_node: self.upstream_node,
        }
    }

    /// Promotes the local node. Emits the relevant events and returns the
    /// resulting failover state; a failed promote is not fatal because the
    /// command may have timed out after partially succeeding.
    async fn promote_self(&mut self, term: Term) -> FailoverState {
        if !self.cfg.promote_delay.is_zero() {
            debug!(
                "sleeping {} seconds before promoting standby",
                self.cfg.promote_delay.as_secs()
            );
            self.signals.wake_after(self.cfg.promote_delay).await;
        }

        let failed_primary = match self.local.get_node(self.upstream_node.node_id).await {
            Ok(Some(record)) => record,
            _ => {
                warn!(
                    "unable to retrieve metadata record for failed upstream (ID: {})",
                    self.upstream_node.node_id
                );
                return FailoverState::PromotionFailed;
            }
        };

        info!("promote command is:\n  \"{}\"", self.cfg.promote_command);
        let promote_result = self.runner.run_local(&self.cfg.promote_command).await;

        // The connection should stay up across a promotion, but check.
        if self.local.ping().await.is_err() {
            warn!("local database connection not available");
            match self.connector.connect(&self.local_node.conninfo).await {
                Ok(link) => self.local = link,
                Err(e) => {
                    warn!("unable to reconnect to local node: {}", e);
                    return FailoverState::LocalNodeFailure;
                }
            }
        }

        let promote_failed = match &promote_result {
            Ok(out) => !out.success(),
            Err(_) => true,
        };

        if promote_failed {
            // The original primary may have reappeared before we promoted.
            if let Some((record, link)) = self.find_running_primary().await {
                if record.node_id == failed_primary.node_id {
                    info!(
                        "original primary (ID: {}) reappeared before this standby was \
                         promoted - no action taken",
                        failed_primary.node_id
                    );
                    self.events
                        .emit(
                            Some(&link),
                            EventKind::FailoverAbort,
                            true,
                            &format!(
                                "original primary \"{}\" (ID: {}) reappeared",
                                failed_primary.name, failed_primary.node_id
                            ),
                        )
                        .await;
                    return FailoverState::PrimaryReappeared;
                }
            }

            warn!("promote command failed");
            self.events
                .emit(None, EventKind::PromoteError, false, "promote command failed")
                .await;
            return FailoverState::PromotionFailed;
        }

        match self.local.increment_term().await {
            Ok(new_term) => debug!("electoral term bumped from {} to {}", term, new_term),
            Err(e) => warn!("unable to increment electoral term: {}", e),
        }

        // Refresh our own record; followers are only notified once it
        // shows the primary role.
        match self.local.get_node(self.local_node.node_id).await {
            Ok(Some(record)) => self.local_node = record,
            _ => warn!("unable to refresh local node record after promotion"),
        }
        if self.local_node.node_type != crate::core::types::NodeType::Primary {
            if let Err(e) = self.local.update_type_primary(self.local_node.node_id).await {
                warn!("unable to update local node record to primary: {}", e);
            } else {
                self.local_node.node_type = crate::core::types::NodeType::Primary;
                self.local_node.upstream_node_id = None;
            }
        }

        if vip::vip_configured(&self.cfg.virtual_ip, &self.cfg.network_interface) {
            if let Ok(true) =
                vip::bind_virtual_ip(&self.runner, &self.cfg.virtual_ip, &self.cfg.network_interface)
                    .await
            {
                info!("bound the virtual IP after promoting local node to primary");
            }
        }

        self.events
            .emit(
                Some(&self.local),
                EventKind::FailoverPromote,
                true,
                &format!(
                    "node {} promoted to primary; old primary {} marked as failed",
                    self.local_node.node_id, failed_primary.node_id
                ),
            )
            .await;

        FailoverState::Promoted
    }

    /// Polls the shared follow-target signal for up to
    /// `primary_notification_timeout`. Notifications carrying a term older
    /// than the election we took part in are stale and ignored.
    async fn wait_primary_notification(&self, term: Term) -> Option<NodeId> {
        let timeout_secs = self.cfg.primary_notification_timeout.as_secs().max(1);

        for _ in 0..timeout_secs {
            match self.local.get_new_primary().await {
                Ok(Some(notification)) => {
                    if notification.term < term {
                        debug!(
                            "ignoring stale follow notification (term {} < {})",
                            notification.term, term
                        );
                    } else {
                        return Some(notification.target_id);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("unable to poll for new primary: {}", e),
            }

            if self.signals.wake_after(Duration::from_secs(1)).await == Wake::Terminate {
                return None;
            }
        }

        warn!(
            "no notification received from new primary within {} seconds",
            timeout_secs
        );
        None
    }

    /// Repoints the local node at `new_primary_id` by running the follow
    /// command, then waits for the local instance to come back.
    async fn follow_new_primary(&mut self, new_primary_id: NodeId) -> FailoverState {
        debug!("follow_new_primary(): new primary id is {}", new_primary_id);

        let new_primary = match self.local.get_node(new_primary_id).await {
            Ok(Some(record)) => record,
            _ => {
                warn!(
                    "unable to retrieve metadata record for new primary node (ID: {})",
                    new_primary_id
                );
                return FailoverState::FollowFail;
            }
        };
        info!(
            "attempting to follow new primary \"{}\" (node ID: {})",
            new_primary.name, new_primary_id
        );

        let failed_primary = match self.local.get_node(self.upstream_node.node_id).await {
            Ok(Some(record)) => record,
            _ => {
                warn!(
                    "unable to retrieve metadata record for failed primary (ID: {})",
                    self.upstream_node.node_id
                );
                return FailoverState::FollowFail;
            }
        };

        let target_link = match self.connector.connect(&new_primary.conninfo).await {
            Ok(link) => link,
            Err(e) => {
                warn!("unable to connect to new primary: {}", e);
                return FailoverState::FollowFail;
            }
        };
        match target_link.recovery_type().await {
            Ok(RecoveryType::Primary) => {}
            _ => {
                warn!("new primary is not in primary mode");
                return FailoverState::FollowFail;
            }
        }

        // The follow operation restarts the local instance; the old link
        // is dead weight from here.
        let command = follow_command(&self.cfg.follow_command, new_primary_id);
        debug!("standby follow command is:\n  \"{}\"", command);

        let followed = match self.runner.run_local(&command).await {
            Ok(out) => out.success(),
            Err(e) => {
                warn!("unable to execute follow command: {}", e);
                false
            }
        };

        if !followed {
            // The original primary may have reappeared; following another
            // node is then refused by the follow command.
            if let Ok(old_link) = self.connector.connect(&failed_primary.conninfo).await {
                if old_link.recovery_type().await == Ok(RecoveryType::Primary) {
                    info!("original primary reappeared - no action taken");
                    self.events
                        .emit(
                            Some(&old_link),
                            EventKind::FailoverAbort,
                            true,
                            "original primary reappeared - no action taken",
                        )
                        .await;
                    return FailoverState::PrimaryReappeared;
                }
                info!("original primary reappeared as standby");
            }
            self.events
                .emit(
                    None,
                    EventKind::FollowError,
                    false,
                    &format!("unable to follow new primary node {new_primary_id}"),
                )
                .await;
            return FailoverState::FollowFail;
        }

        // The standby may still be starting up; poll until we can
        // reconnect.
        let startup_secs = self.cfg.standby_startup_timeout.as_secs().max(1);
        let mut reconnected = None;
        for attempt in 0..startup_secs {
            match self.connector.connect(&self.local_node.conninfo).await {
                Ok(link) => {
                    reconnected = Some(link);
                    break;
                }
                Err(_) => debug!(
                    "sleeping 1 second; {} of {} attempts to reconnect to local node",
                    attempt + 1,
                    startup_secs
                ),
            }
            if self.signals.wake_after(Duration::from_secs(1)).await == Wake::Terminate {
                break;
            }
        }
        let Some(local) = reconnected else {
            warn!(
                "unable to reconnect to local node {} after follow",
                self.local_node.node_id
            );
            return FailoverState::FollowFail;
        };
        self.local = local;

        // Refresh both records from the new primary to be sure we hold the
        // authoritative versions.
        match target_link.get_node(new_primary_id).await {
            Ok(Some(record)) => self.upstream_node = record,
            _ => {
                warn!("no metadata record found for node {}", new_primary_id);
                return FailoverState::FollowFail;
            }
        }
        match target_link.get_node(self.local_node.node_id).await {
            Ok(Some(record)) => self.local_node = record,
            _ => {
                warn!("no metadata record found for node {}", self.local_node.node_id);
                return FailoverState::FollowFail;
            }
        }

        // The restart zapped the registry entry.
        if let Err(e) = self
            .local
            .register_daemon(self.local_node.node_id, std::process::id())
            .await
        {
            warn!("unable to re-register daemon: {}", e);
        }

        self.events
            .emit(
                Some(&target_link),
                EventKind::FailoverFollow,
                true,
                &format!(
                    "node {} now following new upstream node {}",
                    self.local_node.node_id, self.upstream_node.node_id
                ),
            )
            .await;

        FailoverState::FollowedNewPrimary
    }

    /// Writes the follow-target intention into each sibling's database.
    async fn notify_followers(
        &self,
        siblings: &mut Vec<Sibling>,
        follow_node_id: NodeId,
        term: Term,
    ) {
        info!("{} followers to notify", siblings.len());

        for sibling in siblings.iter_mut() {
            let link = match &sibling.link {
                Some(link) if link.ping().await.is_ok() => link.clone(),
                _ => {
                    info!(
                        "reconnecting to node \"{}\" (node ID: {})...",
                        sibling.record.name, sibling.record.node_id
                    );
                    match self.connector.connect(&sibling.record.conninfo).await {
                        Ok(link) => {
                            sibling.link = Some(link.clone());
                            sibling.status = NodeStatus::Up;
                            link
                        }
                        Err(e) => {
                            warn!(
                                "unable to reconnect to \"{}\" (node ID: {}): {}",
                                sibling.record.name, sibling.record.node_id, e
                            );
                            continue;
                        }
                    }
                }
            };

            if follow_node_id == ELECTION_RERUN_NOTIFICATION {
                info!(
                    "notifying node \"{}\" (node ID: {}) to rerun promotion candidate selection",
                    sibling.record.name, sibling.record.node_id
                );
            } else {
                info!(
                    "notifying node \"{}\" (node ID: {}) to follow node {}",
                    sibling.record.name, sibling.record.node_id, follow_node_id
                );
            }

            if let Err(e) = link.notify_follow_primary(follow_node_id, term).await {
                warn!(
                    "unable to notify node {} (state {}): {}",
                    sibling.record.node_id,
                    FailoverState::NodeNotificationError,
                    e
                );
            }
        }
    }

    /// Scans the node table for an instance actually running as primary.
    async fn find_running_primary(&self) -> Option<(NodeRecord, Arc<dyn DbLink>)> {
        let nodes = self.local.get_all_nodes().await.ok()?;
        for record in nodes {
            if record.node_id == self.local_node.node_id || record.node_type.is_witness() {
                continue;
            }
            if let Ok(link) = self.connector.connect(&record.conninfo).await {
                if link.recovery_type().await == Ok(RecoveryType::Primary) {
                    return Some((record, link));
                }
            }
        }
        None
    }

    async fn load_sibling_records(&self) -> Vec<Sibling> {
        match self
            .local
            .get_active_siblings(self.local_node.node_id, self.upstream_node.node_id)
            .await
        {
            Ok(records) => records
                .into_iter()
                .map(|record| Sibling {
                    record,
                    link: None,
                    status: NodeStatus::Unknown,
                    last_wal_receive_lsn: Lsn::INVALID,
                })
                .collect(),
            Err(e) => {
                warn!("unable to refresh sibling node records: {}", e);
                Vec::new()
            }
        }
    }

    async fn emit_manual_failover_event(&self, new_primary_id: NodeId) {
        let detail = format!(
            "node {} is in manual failover mode and is now disconnected from streaming \
             replication",
            self.local_node.node_id
        );
        match self.local.get_node(new_primary_id).await {
            Ok(Some(new_primary)) => {
                match self.connector.connect(&new_primary.conninfo).await {
                    Ok(link) => {
                        self.events
                            .emit(
                                Some(&link),
                                EventKind::StandbyDisconnectManual,
                                true,
                                &detail,
                            )
                            .await;
                    }
                    Err(_) => {
                        self.events
                            .emit(None, EventKind::StandbyDisconnectManual, true, &detail)
                            .await;
                    }
                }
            }
            _ => {
                warn!(
                    "unable to retrieve metadata record for new primary node (ID: {})",
                    new_primary_id
                );
            }
        }
    }

    /// Parks the local WAL receiver, then waits for the receivers on all
    /// sibling nodes to go idle before the election proceeds.
    async fn disconnect_wal_receivers(&self) {
        if let Err(e) = self.local.disable_wal_receiver().await {
            warn!("unable to disable local WAL receiver: {}", e);
            return;
        }

        let siblings = match self
            .local
            .get_active_siblings(self.local_node.node_id, self.upstream_node.node_id)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("unable to retrieve sibling node records: {}", e);
                return;
            }
        };

        let timeout_secs = self.cfg.sibling_nodes_disconnect_timeout.as_secs().max(1);
        let mut still_connected = false;

        for second in 0..timeout_secs {
            still_connected = false;
            for record in &siblings {
                let Ok(link) = self.connector.connect(&record.conninfo).await else {
                    continue;
                };
                match link.wal_receiver_pid().await {
                    Ok(Some(pid)) => {
                        info!("WAL receiver PID on node {} is {}", record.node_id, pid);
                        still_connected = true;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(
                        "unable to query WAL receiver PID on node {}: {}",
                        record.node_id, e
                    ),
                }
            }

            if !still_connected {
                info!(
                    "WAL receiver disconnected on all {} sibling nodes",
                    siblings.len()
                );
                break;
            }

            debug!(
                "sleeping {} of max {} seconds (\"sibling_nodes_disconnect_timeout\")",
                second + 1,
                timeout_secs
            );
            if self.signals.wake_after(Duration::from_secs(1)).await == Wake::Terminate {
                return;
            }
        }

        if still_connected {
            warn!("WAL receiver still connected on at least one sibling node");
        }
    }
}
