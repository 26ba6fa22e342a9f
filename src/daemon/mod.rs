// src/daemon/mod.rs

//! Daemon lifecycle: initial connection, role detection and the outer
//! orchestration loop that restarts the appropriate monitor whenever a
//! role change or topology change is detected.

pub mod context;
pub mod pidfile;
pub mod signals;

use crate::config::Config;
use crate::core::command::ShellRunner;
use crate::core::errors::{ReplGuardError, Result};
use crate::core::link::{Connector, DbLink, PgConnector};
use crate::core::metastore::MetaStore as _;
use crate::core::monitor::{
    MonitorOutcome, PrimaryMonitor, StandbyMonitor, WitnessMonitor, try_reconnect,
};
use crate::core::types::{NodeRecord, NodeType};
use crate::daemon::context::{DaemonContext, LogReloadHandle};
use crate::daemon::pidfile::PidFile;
use crate::daemon::signals::SignalHub;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs the daemon until a shutdown signal or a fatal error.
pub async fn run(
    config_path: String,
    config: Config,
    log_reload: Option<LogReloadHandle>,
) -> Result<()> {
    let signals = SignalHub::install();
    let connector: Arc<dyn Connector> = Arc::new(PgConnector::new());
    let runner: Arc<dyn crate::core::command::CommandRunner> = Arc::new(ShellRunner);

    let _pidfile = PidFile::create(&config.pid_file)?;

    let mut local = connect_local(&connector, &config, &signals).await?;
    let mut record = load_own_record(&local, &config).await?;
    info!(
        "starting monitoring of node \"{}\" (ID: {})",
        record.name, record.node_id
    );

    if let Err(e) = local.register_daemon(record.node_id, std::process::id()).await {
        warn!("unable to register daemon: {}", e);
    }

    let ctx = DaemonContext::new(
        config_path,
        config,
        record.name.clone(),
        connector,
        runner,
        signals,
        log_reload,
    );

    loop {
        if ctx.signals.terminated() {
            break;
        }

        let outcome = match record.node_type {
            NodeType::Primary => {
                PrimaryMonitor::new(ctx.clone(), local.clone(), record.clone())
                    .run()
                    .await?
            }
            NodeType::Standby | NodeType::Bdr => {
                StandbyMonitor::new(ctx.clone(), local.clone(), record.clone())
                    .run()
                    .await?
            }
            NodeType::Witness => {
                WitnessMonitor::new(ctx.clone(), local.clone(), record.clone())
                    .run()
                    .await?
            }
        };

        match outcome {
            MonitorOutcome::Shutdown => break,
            MonitorOutcome::RestartMonitoring => {
                info!("restarting monitoring");
                let config = ctx.config();
                match try_reconnect(
                    &ctx.connector,
                    &record.conninfo,
                    config.reconnect_attempts,
                    config.reconnect_interval,
                    &ctx.signals,
                )
                .await
                {
                    Some(link) => local = link,
                    None => {
                        return Err(ReplGuardError::DbConnect {
                            conninfo: record.conninfo.clone(),
                            detail: "local node unavailable while restarting monitoring"
                                .to_string(),
                        });
                    }
                }
                record = load_own_record(&local, &config).await?;
            }
        }
    }

    if let Err(e) = local.unregister_daemon(record.node_id).await {
        warn!("unable to unregister daemon: {}", e);
    }
    info!("daemon terminating");
    Ok(())
}

async fn connect_local(
    connector: &Arc<dyn Connector>,
    config: &Config,
    signals: &Arc<SignalHub>,
) -> Result<Arc<dyn DbLink>> {
    match try_reconnect(
        connector,
        &config.conninfo,
        config.reconnect_attempts,
        config.reconnect_interval,
        signals,
    )
    .await
    {
        Some(link) => Ok(link),
        None => Err(ReplGuardError::DbConnect {
            conninfo: config.conninfo.clone(),
            detail: "unable to connect to local node at startup".to_string(),
        }),
    }
}

async fn load_own_record(local: &Arc<dyn DbLink>, config: &Config) -> Result<NodeRecord> {
    match local.get_node(config.node_id).await? {
        Some(record) => Ok(record),
        None => Err(ReplGuardError::Config(format!(
            "no metadata record found for node ID {}; is this node registered?",
            config.node_id
        ))),
    }
}
