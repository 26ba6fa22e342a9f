// src/core/link.rs

//! The connection seam between the daemon and a single database instance.
//!
//! `DbLink` models everything the daemon asks of one node over one logical
//! connection: health pings, recovery status, replication positions and the
//! WAL-receiver controls used around elections. The production
//! implementation speaks SQL through a small `sqlx` pool; tests substitute a
//! scripted implementation behind the same trait.

use crate::core::errors::{ReplGuardError, Result};
use crate::core::metastore::MetaStore;
use crate::core::types::{
    Lsn, NodeStatus, NodeType, RecoveryType, ReplInfo, SystemIdentity, TimelineId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection operations against one database instance.
///
/// Every implementation also carries the metadata-table surface
/// ([`MetaStore`]): callers hold a single object per node and address
/// whichever side of it the task at hand needs.
#[async_trait]
pub trait DbLink: MetaStore + Send + Sync {
    fn conninfo(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    async fn recovery_type(&self) -> Result<RecoveryType>;

    async fn replication_info(&self, node_type: NodeType) -> Result<ReplInfo>;

    /// The node's current WAL position: insert position on a primary,
    /// receive position on a standby.
    async fn node_current_lsn(&self) -> Result<Lsn>;

    async fn system_identity(&self) -> Result<SystemIdentity>;

    /// Where `timeline` ended according to this node's timeline history,
    /// i.e. the fork point a node still on `timeline` would have to be at
    /// or before in order to attach here. `None` when the history carries
    /// no entry for that timeline.
    async fn timeline_fork_point(&self, timeline: TimelineId) -> Result<Option<Lsn>>;

    async fn resume_wal_replay(&self) -> Result<()>;

    async fn wal_receiver_pid(&self) -> Result<Option<i32>>;

    async fn disable_wal_receiver(&self) -> Result<()>;

    async fn enable_wal_receiver(&self) -> Result<()>;

    async fn sync_standby_names(&self) -> Result<String>;

    /// Number of standbys currently attached to this node.
    async fn attached_standby_count(&self) -> Result<i64>;
}

/// Opens links to database instances. The daemon context owns one connector
/// and shares it with every component that dials out.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, conninfo: &str) -> Result<Arc<dyn DbLink>>;
}

/// Extracts host and port from a conninfo URL for the TCP-level probe used
/// to tell a dead host from one refusing authentication.
pub fn conninfo_host_port(conninfo: &str) -> (String, u16) {
    match url::Url::parse(conninfo) {
        Ok(u) => (
            u.host_str().unwrap_or("localhost").to_string(),
            u.port().unwrap_or(5432),
        ),
        Err(_) => ("localhost".to_string(), 5432),
    }
}

/// Classifies a failed connection attempt: a host that still accepts TCP
/// connections but refused us is `Rejected`, everything else is `Down`.
pub async fn classify_unreachable(conninfo: &str) -> NodeStatus {
    let (host, port) = conninfo_host_port(conninfo);
    match tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await
    {
        Ok(Ok(_)) => NodeStatus::Rejected,
        _ => NodeStatus::Down,
    }
}

/// Parses the content of a timeline-history file. Lines have the form
/// `<tli>\t<end_lsn>\t<reason>`; returns `(tli, end_lsn)` pairs.
pub fn parse_timeline_history(content: &str) -> Vec<(TimelineId, Lsn)> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let tli: TimelineId = fields.next()?.parse().ok()?;
            let end: Lsn = fields.next()?.parse().ok()?;
            Some((tli, end))
        })
        .collect()
}

/// Production connector backed by `sqlx`.
pub struct PgConnector {
    statement_timeout: Duration,
}

impl PgConnector {
    pub fn new() -> Self {
        Self {
            statement_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, conninfo: &str) -> Result<Arc<dyn DbLink>> {
        let options = PgConnectOptions::from_str(conninfo)
            .map_err(|e| ReplGuardError::DbConnect {
                conninfo: conninfo.to_string(),
                detail: e.to_string(),
            })?
            .options([(
                "statement_timeout",
                format!("{}", self.statement_timeout.as_millis()),
            )])
            .disable_statement_logging();

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| classify_connect_error(conninfo, &e))?;

        // Surface authentication and reachability problems now rather than
        // on the first real query.
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| classify_connect_error(conninfo, &e))?;

        debug!("connected to \"{}\"", conninfo);

        Ok(Arc::new(PgLink {
            conninfo: conninfo.to_string(),
            pool,
        }))
    }
}

fn classify_connect_error(conninfo: &str, e: &sqlx::Error) -> ReplGuardError {
    if let sqlx::Error::Database(db_err) = e {
        // 28xxx: invalid authorization specification / password failure.
        if db_err.code().map(|c| c.starts_with("28")).unwrap_or(false) {
            return ReplGuardError::AuthRejected {
                conninfo: conninfo.to_string(),
            };
        }
    }
    ReplGuardError::DbConnect {
        conninfo: conninfo.to_string(),
        detail: e.to_string(),
    }
}

/// A live connection to one database instance.
pub struct PgLink {
    pub(crate) conninfo: String,
    pub(crate) pool: PgPool,
}

impl PgLink {
    fn parse_lsn(&self, raw: &str) -> Result<Lsn> {
        raw.parse()
            .map_err(|e: String| ReplGuardError::MetaQuery(e))
    }
}

#[async_trait]
impl DbLink for PgLink {
    fn conninfo(&self) -> &str {
        &self.conninfo
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn recovery_type(&self) -> Result<RecoveryType> {
        let row = sqlx::query("SELECT pg_is_in_recovery() AS in_recovery")
            .fetch_one(&self.pool)
            .await?;
        let in_recovery: bool = row.try_get("in_recovery")?;
        Ok(if in_recovery {
            RecoveryType::Standby
        } else {
            RecoveryType::Primary
        })
    }

    async fn replication_info(&self, node_type: NodeType) -> Result<ReplInfo> {
        if node_type == NodeType::Primary {
            let row = sqlx::query(
                "SELECT pg_current_wal_lsn()::text AS current_lsn, \
                        pg_is_in_recovery() AS in_recovery",
            )
            .fetch_one(&self.pool)
            .await?;
            let current: String = row.try_get("current_lsn")?;
            let lsn = self.parse_lsn(&current)?;
            return Ok(ReplInfo {
                in_recovery: row.try_get("in_recovery")?,
                last_wal_receive_lsn: lsn,
                last_wal_replay_lsn: lsn,
                ..ReplInfo::default()
            });
        }

        let row = sqlx::query(
            "SELECT pg_is_in_recovery() AS in_recovery, \
                    COALESCE(pg_last_wal_receive_lsn()::text, '0/0') AS receive_lsn, \
                    COALESCE(pg_last_wal_replay_lsn()::text, '0/0') AS replay_lsn, \
                    pg_last_xact_replay_timestamp() AS replay_ts, \
                    pg_is_wal_replay_paused() AS replay_paused, \
                    EXISTS (SELECT 1 FROM pg_stat_wal_receiver) AS receiving, \
                    COALESCE((SELECT EXTRACT(EPOCH FROM (now() - last_msg_receipt_time))::bigint \
                              FROM pg_stat_wal_receiver LIMIT 1), -1) AS upstream_last_seen",
        )
        .fetch_one(&self.pool)
        .await?;

        let receive: String = row.try_get("receive_lsn")?;
        let replay: String = row.try_get("replay_lsn")?;
        let replay_ts: Option<DateTime<Utc>> = row.try_get("replay_ts")?;

        Ok(ReplInfo {
            in_recovery: row.try_get("in_recovery")?,
            last_wal_receive_lsn: self.parse_lsn(&receive)?,
            last_wal_replay_lsn: self.parse_lsn(&replay)?,
            last_xact_replay_ts: replay_ts,
            wal_replay_paused: row.try_get("replay_paused")?,
            receiving_streamed_wal: row.try_get("receiving")?,
            upstream_last_seen: row.try_get("upstream_last_seen")?,
        })
    }

    async fn node_current_lsn(&self) -> Result<Lsn> {
        let row = sqlx::query(
            "SELECT (CASE WHEN pg_is_in_recovery() \
                     THEN COALESCE(pg_last_wal_receive_lsn(), pg_last_wal_replay_lsn()) \
                     ELSE pg_current_wal_lsn() END)::text AS lsn",
        )
        .fetch_one(&self.pool)
        .await?;
        let raw: String = row.try_get("lsn")?;
        self.parse_lsn(&raw)
    }

    async fn system_identity(&self) -> Result<SystemIdentity> {
        let row = sqlx::query(
            "SELECT s.system_identifier::text AS identifier, c.timeline_id AS timeline \
             FROM pg_control_system() s, pg_control_checkpoint() c",
        )
        .fetch_one(&self.pool)
        .await?;
        let identifier: String = row.try_get("identifier")?;
        let timeline: i32 = row.try_get("timeline")?;
        Ok(SystemIdentity {
            identifier: identifier
                .parse()
                .map_err(|e| ReplGuardError::MetaQuery(format!("bad system identifier: {e}")))?,
            timeline: timeline as TimelineId,
        })
    }

    async fn timeline_fork_point(&self, timeline: TimelineId) -> Result<Option<Lsn>> {
        let identity = self.system_identity().await?;
        if identity.timeline <= timeline {
            return Ok(None);
        }
        let filename = format!("pg_wal/{:08X}.history", identity.timeline);
        let row = sqlx::query("SELECT pg_read_file($1) AS history")
            .bind(&filename)
            .fetch_one(&self.pool)
            .await?;
        let content: String = row.try_get("history")?;
        Ok(parse_timeline_history(&content)
            .into_iter()
            .find(|(tli, _)| *tli == timeline)
            .map(|(_, end)| end))
    }

    async fn resume_wal_replay(&self) -> Result<()> {
        sqlx::query("SELECT pg_wal_replay_resume()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn wal_receiver_pid(&self) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT pid FROM pg_stat_wal_receiver LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("pid")?),
            None => None,
        })
    }

    async fn disable_wal_receiver(&self) -> Result<()> {
        // Effectively parks the WAL receiver by pushing the retry interval
        // out to a day, then terminates the current process.
        sqlx::query("ALTER SYSTEM SET wal_retrieve_retry_interval = 86400000")
            .execute(&self.pool)
            .await?;
        sqlx::query("SELECT pg_reload_conf()")
            .execute(&self.pool)
            .await?;
        if let Some(pid) = self.wal_receiver_pid().await? {
            if let Err(e) = sqlx::query("SELECT pg_terminate_backend($1)")
                .bind(pid)
                .execute(&self.pool)
                .await
            {
                warn!("unable to terminate WAL receiver (pid {}): {}", pid, e);
            }
        }
        Ok(())
    }

    async fn enable_wal_receiver(&self) -> Result<()> {
        sqlx::query("ALTER SYSTEM RESET wal_retrieve_retry_interval")
            .execute(&self.pool)
            .await?;
        sqlx::query("SELECT pg_reload_conf()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sync_standby_names(&self) -> Result<String> {
        let row = sqlx::query(
            "SELECT COALESCE(current_setting('synchronous_standby_names', true), '') AS names",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("names")?)
    }

    async fn attached_standby_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT count(*) AS n FROM pg_stat_replication")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}
