// src/core/metastore.rs

//! Read/write access to the cluster metadata tables (`nodes`, `events`,
//! `monitoring_history`, `voting_term` and the per-node intent rows).
//!
//! The caller always provides the connection the truth lives on: node-record
//! updates during a failover go through the (possibly new) primary's link,
//! while follow intents are written into each follower's own database. All
//! writes are single statements; there is deliberately no multi-row
//! transaction crossing node boundaries.

use crate::core::errors::Result;
use crate::core::link::PgLink;
use crate::core::types::{
    Event, FollowNotification, Lsn, MonitoringRow, NodeId, NodeRecord, NodeType, Term,
};
use async_trait::async_trait;
use sqlx::Row;
use std::str::FromStr;

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// All registered nodes, ordered by `node_id`.
    async fn get_all_nodes(&self) -> Result<Vec<NodeRecord>>;

    async fn get_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>>;

    /// Active peers sharing `upstream_id`, excluding `self_id`.
    async fn get_active_siblings(
        &self,
        self_id: NodeId,
        upstream_id: NodeId,
    ) -> Result<Vec<NodeRecord>>;

    async fn update_upstream(&self, node_id: NodeId, new_upstream: Option<NodeId>) -> Result<()>;

    async fn update_active(&self, node_id: NodeId, active: bool) -> Result<()>;

    async fn update_type_primary(&self, node_id: NodeId) -> Result<()>;

    async fn get_current_term(&self) -> Result<Term>;

    /// Bumps the electoral term. Only ever called by the newly promoted
    /// node, immediately after a successful promotion.
    async fn increment_term(&self) -> Result<Term>;

    /// The follow-target intention for the node this database belongs to,
    /// if one has been written.
    async fn get_new_primary(&self) -> Result<Option<FollowNotification>>;

    /// Writes the follow-target intention into this database. The reserved
    /// target [`ELECTION_RERUN_NOTIFICATION`](crate::core::types::ELECTION_RERUN_NOTIFICATION)
    /// instructs the node to rerun candidate selection.
    async fn notify_follow_primary(&self, target_id: NodeId, term: Term) -> Result<()>;

    /// Clears any in-flight vote and intent rows for this node.
    async fn reset_voting_status(&self) -> Result<()>;

    /// Records `{node_id, pid}` as the running daemon for this instance;
    /// the liveness proof other electors check.
    async fn register_daemon(&self, node_id: NodeId, pid: u32) -> Result<()>;

    async fn registered_daemon_pid(&self) -> Result<Option<i32>>;

    async fn registered_node_id(&self) -> Result<Option<NodeId>>;

    async fn unregister_daemon(&self, node_id: NodeId) -> Result<()>;

    async fn record_event(&self, event: &Event) -> Result<()>;

    async fn append_monitoring_row(&self, row: &MonitoringRow) -> Result<()>;

    /// Replaces the whole node table with `nodes`; used by the witness to
    /// mirror the primary's view.
    async fn replace_nodes(&self, nodes: &[NodeRecord]) -> Result<()>;
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<NodeRecord> {
    let type_raw: String = row.try_get("type")?;
    let node_type = NodeType::from_str(&type_raw).map_err(|_| {
        crate::core::errors::ReplGuardError::MetaQuery(format!("unknown node type {type_raw:?}"))
    })?;
    Ok(NodeRecord {
        node_id: row.try_get("node_id")?,
        name: row.try_get("name")?,
        node_type,
        upstream_node_id: row.try_get("upstream_node_id")?,
        location: row.try_get("location")?,
        priority: row.try_get("priority")?,
        active: row.try_get("active")?,
        conninfo: row.try_get("conninfo")?,
        repluser: row.try_get("repluser")?,
    })
}

const NODE_COLUMNS: &str =
    "node_id, name, type, upstream_node_id, location, priority, active, conninfo, repluser";

#[async_trait]
impl MetaStore for PgLink {
    async fn get_all_nodes(&self) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes ORDER BY node_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = $1"
        ))
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_active_siblings(
        &self,
        self_id: NodeId,
        upstream_id: NodeId,
    ) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE upstream_node_id = $1 AND node_id != $2 AND active = true \
             ORDER BY node_id"
        ))
        .bind(upstream_id)
        .bind(self_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update_upstream(&self, node_id: NodeId, new_upstream: Option<NodeId>) -> Result<()> {
        sqlx::query("UPDATE nodes SET upstream_node_id = $2 WHERE node_id = $1")
            .bind(node_id)
            .bind(new_upstream)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_active(&self, node_id: NodeId, active: bool) -> Result<()> {
        sqlx::query("UPDATE nodes SET active = $2 WHERE node_id = $1")
            .bind(node_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_type_primary(&self, node_id: NodeId) -> Result<()> {
        sqlx::query(
            "UPDATE nodes SET type = 'primary', upstream_node_id = NULL WHERE node_id = $1",
        )
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_current_term(&self) -> Result<Term> {
        let row = sqlx::query("SELECT term FROM voting_term")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("term")?)
    }

    async fn increment_term(&self) -> Result<Term> {
        let row = sqlx::query("UPDATE voting_term SET term = term + 1 RETURNING term")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("term")?)
    }

    async fn get_new_primary(&self) -> Result<Option<FollowNotification>> {
        let row = sqlx::query("SELECT follow_target_id, term FROM follow_intent")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(FollowNotification {
                target_id: row.try_get("follow_target_id")?,
                term: row.try_get("term")?,
            }),
            None => None,
        })
    }

    async fn notify_follow_primary(&self, target_id: NodeId, term: Term) -> Result<()> {
        sqlx::query("DELETE FROM follow_intent")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO follow_intent (follow_target_id, term, created_at) VALUES ($1, $2, now())",
        )
        .bind(target_id)
        .bind(term)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_voting_status(&self) -> Result<()> {
        sqlx::query("DELETE FROM follow_intent")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register_daemon(&self, node_id: NodeId, pid: u32) -> Result<()> {
        sqlx::query("DELETE FROM daemon_registry")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO daemon_registry (node_id, pid, registered_at) VALUES ($1, $2, now())",
        )
        .bind(node_id)
        .bind(pid as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn registered_daemon_pid(&self) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT pid FROM daemon_registry")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<i64, _>("pid")? as i32),
            None => None,
        })
    }

    async fn registered_node_id(&self) -> Result<Option<NodeId>> {
        let row = sqlx::query("SELECT node_id FROM daemon_registry")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("node_id")?),
            None => None,
        })
    }

    async fn unregister_daemon(&self, node_id: NodeId) -> Result<()> {
        sqlx::query("DELETE FROM daemon_registry WHERE node_id = $1")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (node_id, name, event, success, timestamp, details) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.node_id)
        .bind(&event.node_name)
        .bind(event.kind.to_string())
        .bind(event.success)
        .bind(event.timestamp)
        .bind(&event.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_monitoring_row(&self, row: &MonitoringRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO monitoring_history \
             (primary_node_id, standby_node_id, ts, primary_lsn, standby_recv_lsn, \
              standby_replay_ts, replication_lag_bytes, apply_lag_bytes) \
             VALUES ($1, $2, $3, $4::pg_lsn, $5::pg_lsn, $6, $7, $8)",
        )
        .bind(row.primary_node_id)
        .bind(row.standby_node_id)
        .bind(row.ts)
        .bind(row.primary_lsn.to_string())
        .bind(row.standby_recv_lsn.to_string())
        .bind(row.standby_replay_ts)
        .bind(row.replication_lag_bytes as i64)
        .bind(row.apply_lag_bytes as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_nodes(&self, nodes: &[NodeRecord]) -> Result<()> {
        sqlx::query("DELETE FROM nodes").execute(&self.pool).await?;
        for node in nodes {
            sqlx::query(
                "INSERT INTO nodes \
                 (node_id, name, type, upstream_node_id, location, priority, active, conninfo, repluser) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(node.node_id)
            .bind(&node.name)
            .bind(node.node_type.to_string())
            .bind(node.upstream_node_id)
            .bind(&node.location)
            .bind(node.priority)
            .bind(node.active)
            .bind(&node.conninfo)
            .bind(&node.repluser)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

/// Clamped lag computation shared by the monitoring-history writer: lag can
/// transiently appear negative when positions are sampled from different
/// nodes, and must never be recorded as such.
pub fn lag_bytes(ahead: Lsn, behind: Lsn) -> u64 {
    ahead.saturating_distance(behind)
}
