// src/core/monitor/mod.rs

//! The per-role monitoring loops and their shared scaffolding: degraded
//! state bookkeeping, the status-line timer and local reconnection.

pub mod primary;
pub mod standby;
pub mod witness;

use crate::core::errors::{ReplGuardError, Result};
use crate::core::link::{Connector, DbLink};
use crate::daemon::signals::{SignalHub, Wake};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub use primary::PrimaryMonitor;
pub use standby::StandbyMonitor;
pub use witness::WitnessMonitor;

/// Why a monitor loop returned control to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Re-detect the node's role and restart the appropriate monitor.
    RestartMonitoring,
    /// A shutdown signal arrived; exit gracefully.
    Shutdown,
}

/// Tracks time spent in degraded monitoring and enforces the configured
/// hard timeout.
pub struct DegradedTracker {
    timeout: Duration,
    since: Option<Instant>,
}

impl DegradedTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            since: None,
        }
    }

    pub fn enter(&mut self) {
        if self.since.is_none() {
            self.since = Some(Instant::now());
        }
    }

    pub fn clear(&mut self) {
        self.since = None;
    }

    pub fn active(&self) -> bool {
        self.since.is_some()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.since.map(|s| s.elapsed().as_secs()).unwrap_or(0)
    }

    /// Errors with `MonitoringTimeout` once the daemon has been degraded
    /// for longer than the configured limit.
    pub fn check(&self) -> Result<()> {
        if let Some(since) = self.since {
            if !self.timeout.is_zero() && since.elapsed() > self.timeout {
                return Err(ReplGuardError::MonitoringTimeout(
                    since.elapsed().as_secs(),
                ));
            }
        }
        Ok(())
    }
}

/// Emits "still alive" log lines at the configured interval.
pub struct StatusTimer {
    interval: Duration,
    last: Instant,
}

impl StatusTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    pub fn due(&mut self) -> bool {
        if self.interval.is_zero() {
            return false;
        }
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Attempts to reopen a connection to `conninfo`, retrying `attempts` times
/// with `interval` between tries. Returns `None` on persistent failure or
/// when a termination signal arrives.
pub async fn try_reconnect(
    connector: &Arc<dyn Connector>,
    conninfo: &str,
    attempts: u32,
    interval: Duration,
    signals: &Arc<SignalHub>,
) -> Option<Arc<dyn DbLink>> {
    for attempt in 1..=attempts.max(1) {
        match connector.connect(conninfo).await {
            Ok(link) => return Some(link),
            Err(e) => debug!(
                "reconnection attempt {}/{} to \"{}\" failed: {}",
                attempt, attempts, conninfo, e
            ),
        }
        if attempt < attempts
            && signals.wake_after(interval).await == Wake::Terminate
        {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_timeout_enforced() {
        let mut tracker = DegradedTracker::new(Duration::from_millis(1));
        assert!(tracker.check().is_ok());
        tracker.enter();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            tracker.check(),
            Err(ReplGuardError::MonitoringTimeout(_))
        ));
    }

    #[test]
    fn degraded_timeout_disabled_when_zero() {
        let mut tracker = DegradedTracker::new(Duration::ZERO);
        tracker.enter();
        std::thread::sleep(Duration::from_millis(2));
        assert!(tracker.check().is_ok());
    }
}
