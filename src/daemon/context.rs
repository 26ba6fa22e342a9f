// src/daemon/context.rs

//! The per-daemon context object. Everything the monitors, the election
//! coordinator and the failover driver share - configuration, the dial-out
//! connector, the shell runner, the event bus, the peer-client pool and the
//! signal hub - travels through this one explicitly passed handle; the
//! daemon has no global mutable state.

use crate::config::Config;
use crate::core::command::CommandRunner;
use crate::core::errors::Result;
use crate::core::events::EventBus;
use crate::core::link::Connector;
use crate::core::peer::{PeerClient, ReconnectPolicy};
use crate::core::types::{NodeId, NodeRecord};
use crate::daemon::signals::SignalHub;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Registry, reload};

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, Registry>>;

pub struct DaemonContext {
    pub config_path: String,
    config: RwLock<Config>,
    pub connector: Arc<dyn Connector>,
    pub runner: Arc<dyn CommandRunner>,
    pub events: Arc<EventBus>,
    pub signals: Arc<SignalHub>,
    peers: DashMap<NodeId, Arc<PeerClient>>,
    startup_event_logged: AtomicBool,
    log_reload: Option<LogReloadHandle>,
}

impl DaemonContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config_path: String,
        config: Config,
        node_name: String,
        connector: Arc<dyn Connector>,
        runner: Arc<dyn CommandRunner>,
        signals: Arc<SignalHub>,
        log_reload: Option<LogReloadHandle>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new(
            config.node_id,
            node_name,
            config.event_notification_command.clone(),
            &config.event_notifications,
            runner.clone(),
        ));
        Arc::new(Self {
            config_path,
            config: RwLock::new(config),
            connector,
            runner,
            events,
            signals,
            peers: DashMap::new(),
            startup_event_logged: AtomicBool::new(false),
            log_reload,
        })
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    /// First call returns false (a start), later calls true (a reload);
    /// the monitors use this to pick the startup event kind.
    pub fn mark_startup_event(&self) -> bool {
        self.startup_event_logged.swap(true, Ordering::SeqCst)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let config = self.config.read();
        ReconnectPolicy {
            attempts: config.reconnect_attempts,
            interval: config.reconnect_interval,
        }
    }

    /// Re-reads the configuration file; called on SIGHUP. The node id may
    /// not change across a reload.
    pub async fn reload_config(&self) -> Result<()> {
        let fresh = Config::from_file(&self.config_path).await?;
        let previous_id = self.config.read().node_id;
        if fresh.node_id != previous_id {
            warn!(
                "node_id changed from {} to {} in {}; keeping {}",
                previous_id, fresh.node_id, self.config_path, previous_id
            );
        }

        if let Some(handle) = &self.log_reload {
            match fresh.log_level.parse::<EnvFilter>() {
                Ok(filter) => {
                    if let Err(e) = handle.reload(filter) {
                        warn!("unable to apply new log level: {}", e);
                    }
                }
                Err(e) => warn!("invalid log_level \"{}\": {}", fresh.log_level, e),
            }
        }

        let mut config = self.config.write();
        let mut updated = fresh;
        updated.node_id = previous_id;
        *config = updated;
        drop(config);

        info!("configuration reloaded from {}", self.config_path);
        Ok(())
    }

    /// Rebuilds the peer-client pool from a fresh node list, keeping
    /// existing clients (and their cached status) where the record is
    /// unchanged.
    pub fn refresh_peers(&self, records: &[NodeRecord], self_id: NodeId) {
        let config = self.config();
        let policy = ReconnectPolicy {
            attempts: config.reconnect_attempts,
            interval: config.reconnect_interval,
        };

        self.peers.retain(|id, client| {
            records
                .iter()
                .any(|r| r.node_id == *id && r.conninfo == client.record.conninfo)
        });

        for record in records {
            if record.node_id == self_id {
                continue;
            }
            if self.peers.contains_key(&record.node_id) {
                continue;
            }
            self.peers.insert(
                record.node_id,
                Arc::new(PeerClient::new(
                    record.clone(),
                    self.connector.clone(),
                    self.runner.clone(),
                    config.ssh_user.clone(),
                    config.ssh_options.clone(),
                    policy.clone(),
                )),
            );
        }
    }

    pub fn peer(&self, node_id: NodeId) -> Option<Arc<PeerClient>> {
        self.peers.get(&node_id).map(|entry| entry.value().clone())
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }
}
