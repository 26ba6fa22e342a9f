// src/daemon/signals.rs

//! Signal plumbing: SIGHUP requests a configuration reload, SIGTERM and
//! SIGINT request a graceful stop. Every suspension point in the monitor
//! loops sleeps through [`SignalHub::wake_after`] so both are honored
//! promptly rather than at the next loop boundary.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Why a suspension ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Reload,
    Terminate,
}

pub struct SignalHub {
    term_tx: watch::Sender<bool>,
    term_rx: watch::Receiver<bool>,
    reload_tx: watch::Sender<u64>,
    reload_rx: watch::Receiver<u64>,
}

impl SignalHub {
    fn new() -> Self {
        let (term_tx, term_rx) = watch::channel(false);
        let (reload_tx, reload_rx) = watch::channel(0u64);
        Self {
            term_tx,
            term_rx,
            reload_tx,
            reload_rx,
        }
    }

    /// Creates the hub and spawns the OS signal listener.
    pub fn install() -> Arc<Self> {
        let hub = Arc::new(Self::new());
        let listener = hub.clone();
        tokio::spawn(async move {
            listener.listen().await;
        });
        hub
    }

    /// A hub no OS signal will ever reach; used by tests.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::new())
    }

    #[cfg(unix)]
    async fn listen(&self) {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("unable to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("unable to install SIGINT handler: {}", e);
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("unable to install SIGHUP handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, initiating graceful shutdown");
                    self.trigger_terminate();
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, initiating graceful shutdown");
                    self.trigger_terminate();
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, will reload configuration");
                    self.trigger_reload();
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn listen(&self) {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, initiating graceful shutdown");
            self.trigger_terminate();
        }
    }

    pub fn trigger_terminate(&self) {
        let _ = self.term_tx.send(true);
    }

    pub fn trigger_reload(&self) {
        self.reload_tx.send_modify(|seq| *seq += 1);
    }

    pub fn terminated(&self) -> bool {
        *self.term_rx.borrow()
    }

    /// Edge-detects a reload request against the caller's last seen
    /// sequence number, so reloads raised while the loop body was busy are
    /// not lost.
    pub fn reload_pending(&self, last_seen: &mut u64) -> bool {
        let current = *self.reload_rx.borrow();
        if current != *last_seen {
            *last_seen = current;
            true
        } else {
            false
        }
    }

    /// Sleeps for `duration`, returning early when a signal arrives.
    pub async fn wake_after(&self, duration: Duration) -> Wake {
        if self.terminated() {
            return Wake::Terminate;
        }
        let mut term = self.term_rx.clone();
        let mut reload = self.reload_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
            _ = term.changed() => Wake::Terminate,
            _ = reload.changed() => Wake::Reload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_interrupts_sleep() {
        let hub = SignalHub::detached();
        let waiter = hub.clone();
        let handle =
            tokio::spawn(async move { waiter.wake_after(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.trigger_terminate();
        assert_eq!(handle.await.unwrap(), Wake::Terminate);
    }

    #[tokio::test]
    async fn reload_is_edge_detected() {
        let hub = SignalHub::detached();
        let mut seen = 0u64;
        assert!(!hub.reload_pending(&mut seen));
        hub.trigger_reload();
        assert!(hub.reload_pending(&mut seen));
        assert!(!hub.reload_pending(&mut seen));
    }
}
