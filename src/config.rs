// src/config.rs

//! Daemon configuration: loading, defaults and validation.

use crate::core::errors::{ReplGuardError, Result};
use crate::core::types::NodeId;
use serde::Deserialize;
use std::time::Duration;
use tokio::fs;

/// Failover handling mode for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    #[default]
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identifier of the local node; must match a row in the `nodes` table.
    pub node_id: NodeId,

    /// Connection string for the local database instance.
    pub conninfo: String,

    /// Data directory of the local database instance.
    pub data_directory: String,

    #[serde(default = "default_repluser")]
    pub repluser: String,

    #[serde(with = "humantime_serde", default = "default_monitor_interval")]
    pub monitor_interval: Duration,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_reconnect_interval")]
    pub reconnect_interval: Duration,

    /// How long the daemon may stay in degraded monitoring before
    /// terminating. Zero disables the limit.
    #[serde(with = "humantime_serde", default = "default_degraded_monitoring_timeout")]
    pub degraded_monitoring_timeout: Duration,

    #[serde(
        with = "humantime_serde",
        default = "default_primary_notification_timeout"
    )]
    pub primary_notification_timeout: Duration,

    /// How long to poll for the local instance to accept connections after a
    /// follow command restarted it.
    #[serde(with = "humantime_serde", default = "default_standby_startup_timeout")]
    pub standby_startup_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_election_rerun_interval")]
    pub election_rerun_interval: Duration,

    #[serde(
        with = "humantime_serde",
        default = "default_sibling_nodes_disconnect_timeout"
    )]
    pub sibling_nodes_disconnect_timeout: Duration,

    #[serde(default)]
    pub standby_disconnect_on_failover: bool,

    /// Cancel an election outright when any sibling has seen the primary
    /// recently.
    #[serde(default)]
    pub primary_visibility_consensus: bool,

    #[serde(default)]
    pub failover: FailoverMode,

    /// Command promoting the local instance to primary. No placeholders.
    #[serde(default)]
    pub promote_command: String,

    /// Command repointing the local instance at a new primary. `%n` is
    /// replaced with the new primary's node id.
    #[serde(default)]
    pub follow_command: String,

    /// Command re-attaching a failed ex-primary as a standby of a donor
    /// node. `%d` is replaced with the donor's conninfo.
    #[serde(default)]
    pub rejoin_command: String,

    /// Optional final gate before self-promotion. `%n` = candidate node id,
    /// `%a` = candidate node name. Non-zero exit forces an election rerun.
    #[serde(default)]
    pub failover_validation_command: String,

    /// Optional notification hook. `%n` node id, `%e` event kind, `%s`
    /// success flag, `%d` detail.
    #[serde(default)]
    pub event_notification_command: String,

    /// Event kinds forwarded to the hook; empty means all.
    #[serde(default)]
    pub event_notifications: Vec<String>,

    /// Testing aid: delay before executing the promote command.
    #[serde(with = "humantime_serde", default = "default_promote_delay")]
    pub promote_delay: Duration,

    #[serde(default)]
    pub monitoring_history: bool,

    #[serde(with = "humantime_serde", default = "default_witness_sync_interval")]
    pub witness_sync_interval: Duration,

    /// How long a standby tolerates a missing upstream at startup.
    #[serde(with = "humantime_serde", default = "default_standby_wait_timeout")]
    pub standby_wait_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_device_check_timeout")]
    pub device_check_timeout: Duration,

    #[serde(default = "default_device_check_times")]
    pub device_check_times: u32,

    /// Lag threshold below which a returned synchronous standby triggers
    /// restoration of synchronous replication.
    #[serde(default = "default_sync_restore_lag_bytes")]
    pub sync_restore_lag_bytes: u64,

    /// How long the sole synchronous standby may be absent before the
    /// primary degrades to asynchronous replication.
    #[serde(with = "humantime_serde", default = "default_sync_outage_threshold")]
    pub sync_outage_threshold: Duration,

    #[serde(default)]
    pub check_brain_split: bool,

    #[serde(default)]
    pub virtual_ip: String,

    #[serde(default)]
    pub network_interface: String,

    /// Command stopping the local database with a fast shutdown.
    #[serde(default)]
    pub db_stop_command: String,

    /// Last-resort command killing the local database outright.
    #[serde(default)]
    pub db_force_stop_command: String,

    /// Command instructing the local database to reload its configuration.
    #[serde(default)]
    pub db_reload_command: String,

    #[serde(default)]
    pub ssh_user: String,

    #[serde(default = "default_ssh_options")]
    pub ssh_options: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Interval between "still alive" status lines. Zero disables them.
    #[serde(with = "humantime_serde", default = "default_log_status_interval")]
    pub log_status_interval: Duration,

    #[serde(default)]
    pub pid_file: String,
}

fn default_repluser() -> String {
    "replicator".to_string()
}
fn default_monitor_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_reconnect_attempts() -> u32 {
    6
}
fn default_reconnect_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_degraded_monitoring_timeout() -> Duration {
    Duration::ZERO
}
fn default_primary_notification_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_standby_startup_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_election_rerun_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_sibling_nodes_disconnect_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_promote_delay() -> Duration {
    Duration::ZERO
}
fn default_witness_sync_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_standby_wait_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_device_check_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_device_check_times() -> u32 {
    3
}
fn default_sync_restore_lag_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_sync_outage_threshold() -> Duration {
    Duration::from_secs(30)
}
fn default_ssh_options() -> String {
    "-q -o ConnectTimeout=10".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_status_interval() -> Duration {
    Duration::from_secs(300)
}

impl Config {
    pub async fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ReplGuardError::Config(format!("unable to read \"{path}\": {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ReplGuardError::Config(format!("unable to parse \"{path}\": {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id < 1 {
            return Err(ReplGuardError::Config(format!(
                "node_id must be 1 or greater, got {}",
                self.node_id
            )));
        }
        if self.conninfo.trim().is_empty() {
            return Err(ReplGuardError::Config("conninfo must be set".to_string()));
        }
        if self.data_directory.trim().is_empty() {
            return Err(ReplGuardError::Config(
                "data_directory must be set".to_string(),
            ));
        }
        if self.failover == FailoverMode::Automatic {
            if self.promote_command.trim().is_empty() {
                return Err(ReplGuardError::Config(
                    "promote_command is required when failover is automatic".to_string(),
                ));
            }
            if self.follow_command.trim().is_empty() {
                return Err(ReplGuardError::Config(
                    "follow_command is required when failover is automatic".to_string(),
                ));
            }
        }
        if !self.virtual_ip.is_empty() && self.network_interface.is_empty() {
            return Err(ReplGuardError::Config(
                "virtual_ip requires network_interface".to_string(),
            ));
        }
        Ok(())
    }

    /// Seconds form of `monitor_interval`, used by the primary-visibility
    /// threshold.
    pub fn monitor_interval_secs(&self) -> u64 {
        self.monitor_interval.as_secs().max(1)
    }
}
