// src/core/probe.rs

//! Pluggable local health checks used by the primary monitor: database
//! ping, data-directory writability and network-interface carrier state.
//! Each check carries its own timeout and never blocks the monitor loop
//! indefinitely.

use crate::core::command::CommandRunner;
use crate::core::link::{Connector, classify_unreachable};
use crate::core::types::NodeStatus;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn healthy(&self) -> bool;
}

/// Opens a connection and runs a trivial query, classifying failures as
/// `Down` or `Rejected`.
pub struct DbPingProbe {
    connector: Arc<dyn Connector>,
    conninfo: String,
}

impl DbPingProbe {
    pub fn new(connector: Arc<dyn Connector>, conninfo: String) -> Self {
        Self { connector, conninfo }
    }

    pub async fn status(&self) -> NodeStatus {
        match self.connector.connect(&self.conninfo).await {
            Ok(link) => match link.ping().await {
                Ok(()) => NodeStatus::Up,
                Err(_) => classify_unreachable(&self.conninfo).await,
            },
            Err(crate::core::errors::ReplGuardError::AuthRejected { .. }) => NodeStatus::Rejected,
            Err(_) => classify_unreachable(&self.conninfo).await,
        }
    }
}

#[async_trait]
impl HealthProbe for DbPingProbe {
    fn name(&self) -> &'static str {
        "db_ping"
    }

    async fn healthy(&self) -> bool {
        self.status().await == NodeStatus::Up
    }
}

/// Attempts to create a throwaway file under the data directory. A hang is
/// treated exactly like a failure: each attempt runs under its own timeout.
///
/// On final failure the probe stops the local database process - a fast
/// stop escalating to a forcible kill. This is the single action the probe
/// is authorized to take.
pub struct DiskProbe {
    data_directory: PathBuf,
    attempt_timeout: Duration,
    attempts: u32,
    runner: Arc<dyn CommandRunner>,
    stop_command: String,
    force_stop_command: String,
}

impl DiskProbe {
    pub fn new(
        data_directory: impl Into<PathBuf>,
        attempt_timeout: Duration,
        attempts: u32,
        runner: Arc<dyn CommandRunner>,
        stop_command: String,
        force_stop_command: String,
    ) -> Self {
        Self {
            data_directory: data_directory.into(),
            attempt_timeout,
            attempts: attempts.max(1),
            runner,
            stop_command,
            force_stop_command,
        }
    }

    async fn writable_once(&self) -> bool {
        let path = self.data_directory.join(".replguard_probe");
        let write = async {
            tokio::fs::write(&path, b"probe").await?;
            tokio::fs::remove_file(&path).await
        };
        match timeout(self.attempt_timeout, write).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    "data directory {:?} not writable: {}",
                    self.data_directory, e
                );
                false
            }
            Err(_) => {
                warn!(
                    "write probe in {:?} hung past {:?}",
                    self.data_directory, self.attempt_timeout
                );
                false
            }
        }
    }

    /// Runs the configured number of attempts; on persistent failure stops
    /// the local database and returns `false`.
    pub async fn check_and_enforce(&self) -> bool {
        for attempt in 0..self.attempts {
            if self.writable_once().await {
                return true;
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.attempt_timeout).await;
            }
        }

        warn!("data directory storage is not working, stopping local database");
        self.stop_database().await;
        false
    }

    async fn stop_database(&self) {
        if !self.stop_command.is_empty() {
            match self.runner.run_local(&self.stop_command).await {
                Ok(out) if out.success() => {
                    info!("local database stopped");
                    return;
                }
                Ok(out) => warn!("fast stop exited with status {}", out.status),
                Err(e) => warn!("fast stop failed: {}", e),
            }
        }
        if !self.force_stop_command.is_empty() {
            match self.runner.run_local(&self.force_stop_command).await {
                Ok(out) if out.success() => info!("local database forcibly stopped"),
                Ok(out) => warn!("forcible stop exited with status {}", out.status),
                Err(e) => warn!("forcible stop failed: {}", e),
            }
        }
    }
}

#[async_trait]
impl HealthProbe for DiskProbe {
    fn name(&self) -> &'static str {
        "disk_writable"
    }

    async fn healthy(&self) -> bool {
        self.check_and_enforce().await
    }
}

/// Reads the kernel's link-carrier state for the configured interface.
/// An unconfigured interface or an unreadable carrier file count as up;
/// only an explicit `0` reports the link as down.
pub struct InterfaceProbe {
    sys_root: PathBuf,
    interface: String,
}

impl InterfaceProbe {
    pub fn new(interface: String) -> Self {
        Self {
            sys_root: PathBuf::from("/sys/class/net"),
            interface,
        }
    }

    pub fn with_sys_root(interface: String, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            interface,
        }
    }

    pub async fn carrier_up(&self) -> bool {
        if self.interface.is_empty() {
            return true;
        }
        let path = self.sys_root.join(&self.interface).join("carrier");
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let up = content.trim() != "0";
                if !up {
                    warn!("network interface {} carrier is down", self.interface);
                }
                up
            }
            Err(e) => {
                warn!("unable to read {:?}: {}", path, e);
                true
            }
        }
    }
}

#[async_trait]
impl HealthProbe for InterfaceProbe {
    fn name(&self) -> &'static str {
        "interface_up"
    }

    async fn healthy(&self) -> bool {
        self.carrier_up().await
    }
}
