// src/core/types.rs

//! Core data model shared by every subsystem: node records, replication
//! status, WAL positions and the state enums driven by the monitor loops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Node identifier as stored in the `nodes` table. Always `>= 1` for
/// registered nodes; negative values are reserved sentinels.
pub type NodeId = i32;

pub const UNKNOWN_NODE_ID: NodeId = -1;

/// Reserved follow-target value instructing a standby to rerun the
/// promotion-candidate election instead of following a node.
pub const ELECTION_RERUN_NOTIFICATION: NodeId = -2;

/// Electoral term as stored in the `voting_term` table.
pub type Term = i64;

/// Timeline identifier; larger values indicate a more recent divergence.
pub type TimelineId = u32;

/// A position in the write-ahead log, monotonic within a timeline.
///
/// Formats in the conventional `XXXXXXXX/XXXXXXXX` notation (high and low
/// 32 bits in hex) so log output lines up with what the database reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Byte distance from `other` up to `self`, clamped at zero.
    pub fn saturating_distance(&self, other: Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid LSN {s:?}: missing '/'"))?;
        let hi = u64::from_str_radix(hi, 16).map_err(|e| format!("invalid LSN {s:?}: {e}"))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|e| format!("invalid LSN {s:?}: {e}"))?;
        if lo > 0xFFFF_FFFF {
            return Err(format!("invalid LSN {s:?}: low word out of range"));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

/// The 64-bit cluster identity plus current timeline, as reported by the
/// replication protocol's system-identification handshake. Two nodes with
/// different identifiers can never belong to the same replication cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemIdentity {
    pub identifier: u64,
    pub timeline: TimelineId,
}

/// Registered role of a node in the cluster metadata.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Primary,
    Standby,
    Witness,
    Bdr,
}

impl NodeType {
    pub fn is_witness(&self) -> bool {
        matches!(self, NodeType::Witness)
    }
}

/// Whether a running node considers itself a primary or a standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RecoveryType {
    Primary,
    Standby,
    Unknown,
}

/// Observed liveness of a node. `Rejected` means the server is reachable at
/// the TCP level but refused authentication, which must never be confused
/// with a dead host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
    Up,
    Down,
    Rejected,
    UncleanShutdown,
    Unknown,
}

/// Monitoring mode of the local daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MonitoringState {
    Normal,
    Degraded,
}

/// Outcome of a promotion-candidate election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ElectionResult {
    Won,
    Lost,
    Cancelled,
    Rerun,
    NotCandidate,
}

/// The failover driver's view of an in-progress transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailoverState {
    Unknown,
    None,
    Promoted,
    PromotionFailed,
    PrimaryReappeared,
    LocalNodeFailure,
    WaitingNewPrimary,
    FollowNewPrimary,
    RequiresManualFailover,
    FollowedNewPrimary,
    FollowingOriginalPrimary,
    NoNewPrimary,
    FollowFail,
    NodeNotificationError,
    ElectionRerun,
}

/// Resolution chosen by the split-brain guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BrainSplitAction {
    DoNothing,
    DoRejoin,
    DoStop,
}

/// Relation of the local timeline to a remote node's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineCompare {
    Lower,
    Same,
    Higher,
    Unknown,
}

/// One row of the `nodes` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub upstream_node_id: Option<NodeId>,
    pub location: String,
    pub priority: i32,
    pub active: bool,
    pub conninfo: String,
    pub repluser: String,
}

impl NodeRecord {
    /// Eligible to take part in an election as a candidate.
    pub fn promotable(&self) -> bool {
        !self.node_type.is_witness() && self.priority > 0
    }
}

/// Transient replication status of a node, gathered per probe.
///
/// `upstream_last_seen` is the number of seconds since the node last heard
/// from its upstream; `-1` when unknown (e.g. the node is a primary).
#[derive(Debug, Clone, PartialEq)]
pub struct ReplInfo {
    pub in_recovery: bool,
    pub last_wal_receive_lsn: Lsn,
    pub last_wal_replay_lsn: Lsn,
    pub last_xact_replay_ts: Option<DateTime<Utc>>,
    pub wal_replay_paused: bool,
    pub receiving_streamed_wal: bool,
    pub upstream_last_seen: i64,
}

impl Default for ReplInfo {
    fn default() -> Self {
        Self {
            in_recovery: false,
            last_wal_receive_lsn: Lsn::INVALID,
            last_wal_replay_lsn: Lsn::INVALID,
            last_xact_replay_ts: None,
            wal_replay_paused: false,
            receiving_streamed_wal: false,
            upstream_last_seen: -1,
        }
    }
}

/// Kinds of cluster events written to the `events` table and forwarded to
/// the notification hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    DaemonStart,
    DaemonReload,
    DaemonShutdown,
    LocalDisconnect,
    LocalReconnect,
    UpstreamDisconnect,
    UpstreamReconnect,
    StandbyDisconnectManual,
    StandbyFailure,
    StandbyRecovery,
    FailoverPromote,
    PromoteError,
    FailoverAbort,
    FailoverFollow,
    FollowError,
    ElectionRerun,
    SplitBrain,
    SyncDegraded,
    SyncRestored,
    NodeRejoin,
    MonitoringTimeout,
}

/// A cluster event. Insertion into the events table and hook dispatch are
/// both best-effort.
#[derive(Debug, Clone)]
pub struct Event {
    pub node_id: NodeId,
    pub node_name: String,
    pub kind: EventKind,
    pub success: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// One append-only row of the `monitoring_history` table.
#[derive(Debug, Clone)]
pub struct MonitoringRow {
    pub primary_node_id: NodeId,
    pub standby_node_id: NodeId,
    pub ts: DateTime<Utc>,
    pub primary_lsn: Lsn,
    pub standby_recv_lsn: Lsn,
    pub standby_replay_ts: Option<DateTime<Utc>>,
    pub replication_lag_bytes: u64,
    pub apply_lag_bytes: u64,
}

/// A follow-target intention read from the local voting tables. The term
/// lets followers discard notifications from elections older than the one
/// they took part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowNotification {
    pub target_id: NodeId,
    pub term: Term,
}
