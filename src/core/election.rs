// src/core/election.rs

//! The promotion-candidate election run by a standby once its upstream has
//! been declared down.
//!
//! The election is leaderless: every surviving standby runs the same
//! deterministic candidate selection over the same inputs (receive LSN,
//! priority, node id) and so converges on the same winner without message
//! exchange. Quorum and visibility vetoes keep a minority partition from
//! promoting anyone.

use crate::config::{Config, FailoverMode};
use crate::core::command::{CommandRunner, failover_validation_command};
use crate::core::errors::Result;
use crate::core::link::{Connector, DbLink};
use crate::core::metastore::MetaStore as _;
use crate::core::types::{
    ElectionResult, Lsn, NodeId, NodeRecord, NodeStatus, Term,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A sibling as probed during one election round. The link is retained so
/// the winner can reuse it for follow notifications.
pub struct Sibling {
    pub record: NodeRecord,
    pub link: Option<Arc<dyn DbLink>>,
    pub status: NodeStatus,
    pub last_wal_receive_lsn: Lsn,
}

pub struct ElectionOutcome {
    pub result: ElectionResult,
    /// Set when the election was cancelled because a usable primary was
    /// discovered out-of-band.
    pub new_primary_id: Option<NodeId>,
    /// The electoral term this election ran under; stale follow
    /// notifications are fenced against it.
    pub term: Term,
    pub siblings: Vec<Sibling>,
    /// The caller must drop into degraded monitoring.
    pub degraded: bool,
    pub local_receive_lsn: Lsn,
}

impl ElectionOutcome {
    fn simple(result: ElectionResult, term: Term) -> Self {
        Self {
            result,
            new_primary_id: None,
            term,
            siblings: Vec::new(),
            degraded: false,
            local_receive_lsn: Lsn::INVALID,
        }
    }
}

pub struct ElectionCoordinator<'a> {
    pub cfg: &'a Config,
    pub connector: &'a Arc<dyn Connector>,
    pub runner: &'a Arc<dyn CommandRunner>,
    pub local: &'a Arc<dyn DbLink>,
    pub local_node: &'a NodeRecord,
    pub upstream_node: &'a NodeRecord,
}

impl ElectionCoordinator<'_> {
    pub async fn run(&self) -> Result<ElectionOutcome> {
        let term = match self.local.get_current_term().await {
            Ok(term) => term,
            Err(e) => {
                warn!("unable to determine electoral term: {}", e);
                return Ok(ElectionOutcome::simple(ElectionResult::NotCandidate, 0));
            }
        };
        debug!("electoral term is {}", term);

        if self.cfg.failover == FailoverMode::Manual {
            info!(
                "this node is not configured for automatic failover so will not be considered \
                 as promotion candidate, and will not follow the new primary"
            );
            return Ok(ElectionOutcome::simple(ElectionResult::NotCandidate, term));
        }

        if self.local_node.priority <= 0 {
            info!(
                "this node's priority is {} so will not be considered as an automatic \
                 promotion candidate",
                self.local_node.priority
            );
            return Ok(ElectionOutcome::simple(ElectionResult::Lost, term));
        }

        let sibling_records = self
            .local
            .get_active_siblings(self.local_node.node_id, self.upstream_node.node_id)
            .await?;
        let total_nodes = sibling_records.len() + 1;

        if self.upstream_node.location == self.local_node.location {
            info!(
                "primary and this node have the same location (\"{}\")",
                self.local_node.location
            );
        } else {
            info!(
                "primary node \"{}\" (ID: {}) has location \"{}\", this node's location is \"{}\"",
                self.upstream_node.name,
                self.upstream_node.node_id,
                self.upstream_node.location,
                self.local_node.location
            );
        }

        // Fast path: no other standbys or witness attached to the failed
        // primary, so normally we win by default.
        if sibling_records.is_empty() {
            if self.upstream_node.location == self.local_node.location {
                if !self.cfg.failover_validation_command.is_empty() {
                    return Ok(ElectionOutcome {
                        result: self.run_validation_command(self.local_node).await,
                        ..ElectionOutcome::simple(ElectionResult::Won, term)
                    });
                }
                info!("no other sibling nodes - we win by default");
                return Ok(ElectionOutcome::simple(ElectionResult::Won, term));
            }
            // With primary and standby in different locations there is no
            // way to tell a primary failure from a network interruption.
            debug!("no other nodes, but primary and standby locations differ");
            let mut outcome = ElectionOutcome::simple(ElectionResult::NotCandidate, term);
            outcome.degraded = true;
            return Ok(outcome);
        }

        let mut primary_location_seen =
            self.upstream_node.location == self.local_node.location;

        let local_repl = match self
            .local
            .replication_info(self.local_node.node_type)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!("unable to retrieve replication information for local node: {}", e);
                return Ok(ElectionOutcome::simple(ElectionResult::Lost, term));
            }
        };

        if local_repl.wal_replay_paused {
            if local_repl.last_wal_receive_lsn > local_repl.last_wal_replay_lsn {
                warn!(
                    "WAL replay on this node is paused and WAL is pending replay \
                     (replay paused at {}; last WAL received is {})",
                    local_repl.last_wal_replay_lsn, local_repl.last_wal_receive_lsn
                );
            }
            if let Err(e) = self.local.resume_wal_replay().await {
                warn!(
                    "unable to resume WAL replay, this node cannot be reliably promoted: {}",
                    e
                );
                return Ok(ElectionOutcome::simple(ElectionResult::Lost, term));
            }
            info!("WAL replay forcibly resumed");
        }

        let local_lsn = local_repl.last_wal_receive_lsn;
        info!("local node's last receive lsn: {}", local_lsn);

        // Candidate bookkeeping: (receive LSN, priority, node id) of the
        // current winner, starting with ourselves.
        let mut candidate_id = self.local_node.node_id;
        let mut candidate_name = self.local_node.name.clone();
        let mut candidate_lsn = local_lsn;
        let mut candidate_priority = self.local_node.priority;

        let mut visible_nodes = 1usize;
        let mut nodes_with_primary_still_visible = 0usize;
        let visibility_window = (self.cfg.monitor_interval_secs() * 2) as i64;

        let mut siblings: Vec<Sibling> = Vec::with_capacity(sibling_records.len());

        for record in sibling_records {
            let mut sibling = Sibling {
                record,
                link: None,
                status: NodeStatus::Unknown,
                last_wal_receive_lsn: Lsn::INVALID,
            };

            let link = match self.connector.connect(&sibling.record.conninfo).await {
                Ok(link) => link,
                Err(e) => {
                    debug!(
                        "unable to connect to sibling node {}: {}",
                        sibling.record.node_id, e
                    );
                    siblings.push(sibling);
                    continue;
                }
            };
            sibling.status = NodeStatus::Up;
            sibling.link = Some(link.clone());
            visible_nodes += 1;

            if !primary_location_seen
                && sibling.record.location == self.upstream_node.location
            {
                primary_location_seen = true;
            }

            // A sibling without a running daemon can neither vote nor act
            // on a follow notification.
            match link.registered_daemon_pid().await {
                Ok(Some(_)) => {}
                _ => {
                    warn!(
                        "no daemon running on node \"{}\" (ID: {}), skipping",
                        sibling.record.name, sibling.record.node_id
                    );
                    siblings.push(sibling);
                    continue;
                }
            }

            let repl = match link.replication_info(sibling.record.node_type).await {
                Ok(repl) => repl,
                Err(e) => {
                    warn!(
                        "unable to retrieve replication information for node \"{}\" (ID: {}), \
                         skipping: {}",
                        sibling.record.name, sibling.record.node_id, e
                    );
                    siblings.push(sibling);
                    continue;
                }
            };

            // Someone promoted this node outside of the failover mechanism;
            // if we can attach to it, follow it instead of electing.
            if !repl.in_recovery {
                warn!(
                    "node \"{}\" (ID: {}) is not in recovery",
                    sibling.record.name, sibling.record.node_id
                );
                let can_follow = check_node_can_follow(
                    self.local.as_ref(),
                    local_lsn,
                    link.as_ref(),
                    &sibling.record,
                )
                .await;
                if can_follow {
                    let new_primary_id = sibling.record.node_id;
                    siblings.push(sibling);
                    return Ok(ElectionOutcome {
                        result: ElectionResult::Cancelled,
                        new_primary_id: Some(new_primary_id),
                        term,
                        siblings,
                        degraded: false,
                        local_receive_lsn: local_lsn,
                    });
                }
                warn!(
                    "not possible to attach to node \"{}\" (ID: {}), ignoring",
                    sibling.record.name, sibling.record.node_id
                );
                siblings.push(sibling);
                continue;
            }

            if repl.wal_replay_paused
                && repl.last_wal_receive_lsn > repl.last_wal_replay_lsn
            {
                warn!(
                    "WAL replay on node \"{}\" (ID: {}) is paused and WAL is pending replay",
                    sibling.record.name, sibling.record.node_id
                );
            }

            if repl.upstream_last_seen >= 0 && repl.upstream_last_seen < visibility_window {
                nodes_with_primary_still_visible += 1;
                info!(
                    "node {} last saw primary node {} second(s) ago, considering primary \
                     still visible",
                    sibling.record.node_id, repl.upstream_last_seen
                );
            } else {
                info!(
                    "node {} last saw primary node {} second(s) ago",
                    sibling.record.node_id, repl.upstream_last_seen
                );
            }

            if sibling.record.node_type.is_witness() {
                debug!(
                    "node {} is witness, not querying state",
                    sibling.record.node_id
                );
                siblings.push(sibling);
                continue;
            }

            if sibling.record.priority <= 0 {
                info!(
                    "node {} has priority of {}, skipping",
                    sibling.record.node_id, sibling.record.priority
                );
                siblings.push(sibling);
                continue;
            }

            sibling.last_wal_receive_lsn = repl.last_wal_receive_lsn;
            info!(
                "last receive LSN for sibling node \"{}\" (ID: {}) is: {}",
                sibling.record.name, sibling.record.node_id, sibling.last_wal_receive_lsn
            );

            if sibling.last_wal_receive_lsn > candidate_lsn {
                info!(
                    "node \"{}\" (ID: {}) is ahead of current candidate \"{}\" (ID: {})",
                    sibling.record.name, sibling.record.node_id, candidate_name, candidate_id
                );
                candidate_id = sibling.record.node_id;
                candidate_name = sibling.record.name.clone();
                candidate_lsn = sibling.last_wal_receive_lsn;
                candidate_priority = sibling.record.priority;
            } else if sibling.last_wal_receive_lsn == candidate_lsn {
                // Tie-break on priority, then the lower node id, so every
                // elector lands on the same winner.
                if sibling.record.priority > candidate_priority
                    || (sibling.record.priority == candidate_priority
                        && sibling.record.node_id < candidate_id)
                {
                    candidate_id = sibling.record.node_id;
                    candidate_name = sibling.record.name.clone();
                    candidate_priority = sibling.record.priority;
                }
            }

            siblings.push(sibling);
        }

        if !primary_location_seen {
            warn!(
                "no nodes from the primary location \"{}\" visible - assuming network split",
                self.upstream_node.location
            );
            self.reset_voting_status().await;
            return Ok(ElectionOutcome {
                result: ElectionResult::Cancelled,
                new_primary_id: None,
                term,
                siblings,
                degraded: true,
                local_receive_lsn: local_lsn,
            });
        }

        if nodes_with_primary_still_visible > 0 {
            info!(
                "{} node(s) can see the primary",
                nodes_with_primary_still_visible
            );
            if self.cfg.primary_visibility_consensus {
                info!("cancelling failover as some nodes can still see the primary");
                self.reset_voting_status().await;
                return Ok(ElectionOutcome {
                    result: ElectionResult::Cancelled,
                    new_primary_id: None,
                    term,
                    siblings,
                    degraded: true,
                    local_receive_lsn: local_lsn,
                });
            }
        }

        info!(
            "visible nodes: {}; total nodes: {}; no nodes have seen the primary within \
             the last {} seconds",
            visible_nodes, total_nodes, visibility_window
        );

        if (visible_nodes as f64) <= (total_nodes as f64) / 2.0 {
            warn!("unable to reach a qualified majority of nodes");
            self.reset_voting_status().await;
            return Ok(ElectionOutcome {
                result: ElectionResult::Cancelled,
                new_primary_id: None,
                term,
                siblings,
                degraded: true,
                local_receive_lsn: local_lsn,
            });
        }

        info!(
            "promotion candidate is \"{}\" (ID: {}), last receive lsn: {}",
            candidate_name, candidate_id, candidate_lsn
        );

        // A node outside the primary's location never promotes itself while
        // other nodes exist; it waits to be told whom to follow.
        if self.upstream_node.location != self.local_node.location {
            return Ok(ElectionOutcome {
                result: ElectionResult::NotCandidate,
                new_primary_id: None,
                term,
                siblings,
                degraded: false,
                local_receive_lsn: local_lsn,
            });
        }

        let result = if candidate_id == self.local_node.node_id {
            if !self.cfg.failover_validation_command.is_empty() {
                self.run_validation_command(self.local_node).await
            } else {
                ElectionResult::Won
            }
        } else {
            ElectionResult::Lost
        };

        Ok(ElectionOutcome {
            result,
            new_primary_id: None,
            term,
            siblings,
            degraded: false,
            local_receive_lsn: local_lsn,
        })
    }

    async fn reset_voting_status(&self) {
        if let Err(e) = self.local.reset_voting_status().await {
            warn!("unable to reset voting status: {}", e);
        }
    }

    async fn run_validation_command(&self, candidate: &NodeRecord) -> ElectionResult {
        let command =
            failover_validation_command(&self.cfg.failover_validation_command, candidate);
        info!("executing failover validation command:\n  \"{}\"", command);
        match self.runner.run_local(&command).await {
            Ok(out) if out.success() => ElectionResult::Won,
            Ok(out) => {
                warn!(
                    "failover validation command exited with {}, election will be rerun",
                    out.status
                );
                ElectionResult::Rerun
            }
            Err(e) => {
                warn!(
                    "unable to execute failover validation command, election will be rerun: {}",
                    e
                );
                ElectionResult::Rerun
            }
        }
    }
}

/// Whether the local node can attach to `target` as its standby: the system
/// identifiers must match, the target's timeline must not be behind ours,
/// and the local position must not be past the target (same timeline) or
/// past the fork point (higher timeline).
pub async fn check_node_can_follow(
    local: &dyn DbLink,
    local_lsn: Lsn,
    target: &dyn DbLink,
    target_record: &NodeRecord,
) -> bool {
    let local_identity = match local.system_identity().await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("unable to query the local node's system identification: {}", e);
            return false;
        }
    };
    let target_identity = match target.system_identity().await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(
                "unable to query the follow target node's system identification: {}",
                e
            );
            return false;
        }
    };

    if local_identity.identifier != target_identity.identifier {
        warn!(
            "this node is not part of the follow target node's replication cluster \
             (local system identifier {}, follow target {})",
            local_identity.identifier, target_identity.identifier
        );
        return false;
    }

    debug!(
        "local timeline: {}; follow target timeline: {}",
        local_identity.timeline, target_identity.timeline
    );

    if target_identity.timeline < local_identity.timeline {
        warn!("this node's timeline is ahead of the follow target node's timeline");
        return false;
    }

    if target_identity.timeline == local_identity.timeline {
        let target_lsn = match target.node_current_lsn().await {
            Ok(lsn) => lsn,
            Err(e) => {
                warn!("unable to compare LSN positions: {}", e);
                return false;
            }
        };
        if !local_lsn.is_valid() || !target_lsn.is_valid() {
            warn!("unable to compare LSN positions");
            return false;
        }
        if local_lsn <= target_lsn {
            info!(
                "timelines are same, this server is not ahead \
                 (local lsn {}, follow target lsn {})",
                local_lsn, target_lsn
            );
            return true;
        }
        warn!(
            "this node is ahead of the follow target (local lsn {}, follow target lsn {})",
            local_lsn, target_lsn
        );
        return false;
    }

    // The target is on a higher timeline; check where it forked off ours.
    match target.timeline_fork_point(local_identity.timeline).await {
        Ok(Some(fork_end)) => {
            if local_lsn > fork_end {
                warn!(
                    "this node cannot attach to follow target node {}: its timeline forked \
                     off at {} before the local recovery point {}",
                    target_record.node_id, fork_end, local_lsn
                );
                false
            } else {
                info!(
                    "local node can attach to follow target node {} \
                     (local recovery point: {}; fork point: {})",
                    target_record.node_id, local_lsn, fork_end
                );
                true
            }
        }
        Ok(None) => {
            warn!(
                "follow target node {} has no history for timeline {}",
                target_record.node_id, local_identity.timeline
            );
            false
        }
        Err(e) => {
            warn!(
                "unable to retrieve timeline history from node {}: {}",
                target_record.node_id, e
            );
            false
        }
    }
}
