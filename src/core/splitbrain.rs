// src/core/splitbrain.rs

//! Detection and resolution of multiple concurrent primaries.
//!
//! Run by the primary monitor only. With exactly one other primary the
//! loser is decided by timeline, then priority, then node id (the higher
//! id loses); with two or more other primaries the situation is not
//! recoverable automatically and the local database is stopped outright.

use crate::core::errors::Result;
use crate::core::link::{Connector, DbLink};
use crate::core::types::{
    BrainSplitAction, NodeRecord, RecoveryType, TimelineCompare,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SplitBrainGuard<'a> {
    pub connector: &'a Arc<dyn Connector>,
    pub local: &'a Arc<dyn DbLink>,
    pub local_node: &'a NodeRecord,
}

impl SplitBrainGuard<'_> {
    /// Queries every peer and decides what the local primary must do.
    pub async fn check(&self, nodes: &[NodeRecord]) -> Result<BrainSplitAction> {
        let mut other_primaries: Vec<(NodeRecord, Arc<dyn DbLink>)> = Vec::new();

        for record in nodes {
            if record.node_id == self.local_node.node_id || record.node_type.is_witness() {
                continue;
            }
            let link = match self.connector.connect(&record.conninfo).await {
                Ok(link) => link,
                Err(e) => {
                    debug!(
                        "split-brain check: unable to establish a connection to node {}: {}",
                        record.node_id, e
                    );
                    continue;
                }
            };
            if link.recovery_type().await == Ok(RecoveryType::Primary) {
                other_primaries.push((record.clone(), link));
            }
        }

        match other_primaries.len() {
            0 => {
                debug!("split-brain check: no other primary found");
                Ok(BrainSplitAction::DoNothing)
            }
            1 => {
                let (record, link) = &other_primaries[0];
                self.resolve_two_primaries(record, link).await
            }
            n => {
                warn!(
                    "split brain: {} other nodes are running as primary, stopping",
                    n
                );
                Ok(BrainSplitAction::DoStop)
            }
        }
    }

    /// Exactly one other primary: tie-break by timeline, priority, node id.
    async fn resolve_two_primaries(
        &self,
        remote_record: &NodeRecord,
        remote_link: &Arc<dyn DbLink>,
    ) -> Result<BrainSplitAction> {
        warn!("found another primary node, id: {}", remote_record.node_id);

        // Use the record as the other primary itself stores it; our copy
        // may be stale.
        let remote = match remote_link.get_node(remote_record.node_id).await {
            Ok(Some(record)) => record,
            _ => {
                warn!("cannot get the other primary node's record");
                return Ok(BrainSplitAction::DoNothing);
            }
        };

        match self.compare_timeline(remote_link).await {
            TimelineCompare::Lower => {
                warn!(
                    "local timeline is behind primary node {}, rejoining it",
                    remote.node_id
                );
                return Ok(BrainSplitAction::DoRejoin);
            }
            TimelineCompare::Higher | TimelineCompare::Unknown => {
                info!(
                    "local timeline is ahead of primary node {}, no action taken",
                    remote.node_id
                );
                return Ok(BrainSplitAction::DoNothing);
            }
            TimelineCompare::Same => {}
        }

        if self.local_node.priority < remote.priority {
            debug!("local priority is below the other primary's, rejoining");
            return Ok(BrainSplitAction::DoRejoin);
        }
        if self.local_node.priority > remote.priority {
            debug!("local priority is above the other primary's, staying active");
            return Ok(BrainSplitAction::DoNothing);
        }

        // Equal priority: the higher node id loses.
        if self.local_node.node_id < remote.node_id {
            debug!(
                "local node id {} below {}, staying active",
                self.local_node.node_id, remote.node_id
            );
            Ok(BrainSplitAction::DoNothing)
        } else {
            debug!(
                "local node id {} above {}, rejoining",
                self.local_node.node_id, remote.node_id
            );
            Ok(BrainSplitAction::DoRejoin)
        }
    }

    async fn compare_timeline(&self, remote_link: &Arc<dyn DbLink>) -> TimelineCompare {
        let local = match self.local.system_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("unable to query local system identification: {}", e);
                return TimelineCompare::Unknown;
            }
        };
        let remote = match remote_link.system_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("unable to query remote system identification: {}", e);
                return TimelineCompare::Unknown;
            }
        };

        if local.identifier != remote.identifier {
            warn!(
                "system identifiers differ (local {}, remote {}), nodes are not part of \
                 the same cluster",
                local.identifier, remote.identifier
            );
            return TimelineCompare::Unknown;
        }

        if local.timeline < remote.timeline {
            TimelineCompare::Lower
        } else if local.timeline > remote.timeline {
            TimelineCompare::Higher
        } else {
            TimelineCompare::Same
        }
    }
}
