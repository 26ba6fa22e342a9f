// src/core/peer.rs

//! One logical client per known peer node: connection lifecycle with capped
//! reconnect attempts, a cached liveness status and the remote-shell
//! transport.

use crate::core::command::{CommandOutput, CommandRunner};
use crate::core::errors::{ReplGuardError, Result};
use crate::core::link::{Connector, DbLink, classify_unreachable, conninfo_host_port};
use crate::core::types::{NodeRecord, NodeStatus, RecoveryType, ReplInfo};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

struct PeerState {
    status: NodeStatus,
    link: Option<Arc<dyn DbLink>>,
    attempts_since_failure: u32,
}

/// Reconnect policy shared by all peers of one daemon.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

pub struct PeerClient {
    pub record: NodeRecord,
    connector: Arc<dyn Connector>,
    runner: Arc<dyn CommandRunner>,
    ssh_user: String,
    ssh_options: String,
    policy: ReconnectPolicy,
    state: Mutex<PeerState>,
}

impl PeerClient {
    pub fn new(
        record: NodeRecord,
        connector: Arc<dyn Connector>,
        runner: Arc<dyn CommandRunner>,
        ssh_user: String,
        ssh_options: String,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            record,
            connector,
            runner,
            ssh_user,
            ssh_options,
            policy,
            state: Mutex::new(PeerState {
                status: NodeStatus::Unknown,
                link: None,
                attempts_since_failure: 0,
            }),
        }
    }

    /// Non-blocking: the result of the last probe.
    pub fn reachable(&self) -> bool {
        self.state.lock().status == NodeStatus::Up
    }

    pub fn last_known_status(&self) -> NodeStatus {
        self.state.lock().status
    }

    pub fn mark_down(&self) {
        let mut state = self.state.lock();
        state.status = NodeStatus::Down;
        state.link = None;
    }

    /// A single connection attempt, updating the cached status. Failures
    /// are classified via a TCP probe so an auth-refusing host is reported
    /// as `Rejected`, not `Down`.
    pub async fn connect_once(&self) -> Result<Arc<dyn DbLink>> {
        if let Some(link) = self.state.lock().link.clone() {
            if link.ping().await.is_ok() {
                return Ok(link);
            }
            self.state.lock().link = None;
        }

        match self.connector.connect(&self.record.conninfo).await {
            Ok(link) => {
                let mut state = self.state.lock();
                state.status = NodeStatus::Up;
                state.link = Some(link.clone());
                state.attempts_since_failure = 0;
                Ok(link)
            }
            Err(e) => {
                let status = match &e {
                    ReplGuardError::AuthRejected { .. } => NodeStatus::Rejected,
                    _ => classify_unreachable(&self.record.conninfo).await,
                };
                let mut state = self.state.lock();
                state.status = status;
                state.attempts_since_failure += 1;
                Err(e)
            }
        }
    }

    /// Opens or refreshes the connection, retrying up to the configured
    /// attempt cap with the configured interval in between.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn DbLink>> {
        let mut last_err = None;
        for attempt in 1..=self.policy.attempts.max(1) {
            match self.connect_once().await {
                Ok(link) => {
                    if attempt > 1 {
                        info!(
                            "reconnected to node \"{}\" (ID: {}) after {} attempts",
                            self.record.name, self.record.node_id, attempt
                        );
                    }
                    return Ok(link);
                }
                Err(e) => {
                    debug!(
                        "connection attempt {}/{} to node {} failed: {}",
                        attempt, self.policy.attempts, self.record.node_id, e
                    );
                    last_err = Some(e);
                }
            }
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }
        warn!(
            "unable to reconnect to node \"{}\" (ID: {})",
            self.record.name, self.record.node_id
        );
        Err(last_err.unwrap_or_else(|| ReplGuardError::DbConnect {
            conninfo: self.record.conninfo.clone(),
            detail: "no connection attempts made".to_string(),
        }))
    }

    pub async fn replication_info(&self) -> Result<ReplInfo> {
        let link = self.connect_once().await?;
        link.replication_info(self.record.node_type).await
    }

    /// Whether the peer currently runs as a primary or a standby;
    /// `Unknown` when it cannot be queried.
    pub async fn is_in_recovery(&self) -> RecoveryType {
        match self.connect_once().await {
            Ok(link) => link.recovery_type().await.unwrap_or(RecoveryType::Unknown),
            Err(_) => RecoveryType::Unknown,
        }
    }

    /// Executes `cmd` on the peer host via the shell transport. A transport
    /// that produces no output at all is reported as `RemoteUnreachable`,
    /// distinct from a zero-exit command with empty output (callers that
    /// care run commands that always produce output).
    pub async fn run_remote(&self, cmd: &str) -> Result<CommandOutput> {
        let (host, _) = conninfo_host_port(&self.record.conninfo);
        self.runner
            .run_remote(&self.ssh_user, &host, &self.ssh_options, cmd)
            .await
    }

    /// Probes whether the peer host answers over the shell transport at
    /// all, independent of its database.
    pub async fn host_reachable_via_shell(&self) -> Result<bool> {
        let out = self.run_remote("true && echo ok").await?;
        if out.silent() {
            let (host, _) = conninfo_host_port(&self.record.conninfo);
            return Err(ReplGuardError::RemoteUnreachable { host });
        }
        Ok(out.success())
    }
}
