// src/core/errors.rs

//! Defines the primary error type for the entire daemon, plus the stable
//! process exit codes it maps onto.

use thiserror::Error;

/// Stable exit codes. These are part of the external interface and must
/// never be renumbered.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const ERR_BAD_CONFIG: i32 = 1;
    pub const ERR_DB_CONN: i32 = 2;
    pub const ERR_DB_QUERY: i32 = 3;
    pub const ERR_BAD_SSH: i32 = 4;
    pub const ERR_INTERNAL: i32 = 5;
    pub const ERR_NODE_STATUS: i32 = 6;
    pub const ERR_MONITORING_TIMEOUT: i32 = 7;
    pub const ERR_BRAIN_SPLIT: i32 = 8;
}

/// The main error enum, representing all failures a component can surface.
///
/// Individual probe and query failures are normally caught and logged by the
/// monitor loops; only errors classified as fatal bubble up to `main` and
/// terminate the daemon with the corresponding exit code.
#[derive(Error, Debug)]
pub enum ReplGuardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unable to connect to \"{conninfo}\": {detail}")]
    DbConnect { conninfo: String, detail: String },

    #[error("authentication rejected by \"{conninfo}\"")]
    AuthRejected { conninfo: String },

    #[error("metadata query failed: {0}")]
    MetaQuery(String),

    #[error("host \"{host}\" unreachable via shell transport")]
    RemoteUnreachable { host: String },

    #[error("command \"{command}\" exited with status {status}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("split-brain detected: {0}")]
    BrainSplit(String),

    #[error("degraded monitoring timeout ({0} seconds) exceeded")]
    MonitoringTimeout(u64),

    #[error("unexpected node status: {0}")]
    NodeStatus(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplGuardError {
    /// The exit code to terminate with when this error reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReplGuardError::Config(_) => exit::ERR_BAD_CONFIG,
            ReplGuardError::DbConnect { .. } | ReplGuardError::AuthRejected { .. } => {
                exit::ERR_DB_CONN
            }
            ReplGuardError::MetaQuery(_) => exit::ERR_DB_QUERY,
            ReplGuardError::RemoteUnreachable { .. } => exit::ERR_BAD_SSH,
            ReplGuardError::NodeStatus(_) => exit::ERR_NODE_STATUS,
            ReplGuardError::MonitoringTimeout(_) => exit::ERR_MONITORING_TIMEOUT,
            ReplGuardError::BrainSplit(_) => exit::ERR_BRAIN_SPLIT,
            ReplGuardError::CommandFailed { .. }
            | ReplGuardError::Io(_)
            | ReplGuardError::Internal(_) => exit::ERR_INTERNAL,
        }
    }

    /// Transient errors are retried by the calling loop rather than
    /// propagated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplGuardError::DbConnect { .. }
                | ReplGuardError::MetaQuery(_)
                | ReplGuardError::RemoteUnreachable { .. }
        )
    }
}

impl From<sqlx::Error> for ReplGuardError {
    fn from(e: sqlx::Error) -> Self {
        ReplGuardError::MetaQuery(e.to_string())
    }
}

impl From<serde_json::Error> for ReplGuardError {
    fn from(e: serde_json::Error) -> Self {
        ReplGuardError::Internal(format!("JSON serialization error: {e}"))
    }
}

impl PartialEq for ReplGuardError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ReplGuardError::Config(a), ReplGuardError::Config(b)) => a == b,
            (
                ReplGuardError::DbConnect { conninfo: a1, detail: a2 },
                ReplGuardError::DbConnect { conninfo: b1, detail: b2 },
            ) => a1 == b1 && a2 == b2,
            (
                ReplGuardError::AuthRejected { conninfo: a },
                ReplGuardError::AuthRejected { conninfo: b },
            ) => a == b,
            (ReplGuardError::MetaQuery(a), ReplGuardError::MetaQuery(b)) => a == b,
            (
                ReplGuardError::RemoteUnreachable { host: a },
                ReplGuardError::RemoteUnreachable { host: b },
            ) => a == b,
            (
                ReplGuardError::CommandFailed { command: a1, status: a2, output: a3 },
                ReplGuardError::CommandFailed { command: b1, status: b2, output: b3 },
            ) => a1 == b1 && a2 == b2 && a3 == b3,
            (ReplGuardError::BrainSplit(a), ReplGuardError::BrainSplit(b)) => a == b,
            (ReplGuardError::MonitoringTimeout(a), ReplGuardError::MonitoringTimeout(b)) => {
                a == b
            }
            (ReplGuardError::NodeStatus(a), ReplGuardError::NodeStatus(b)) => a == b,
            (ReplGuardError::Internal(a), ReplGuardError::Internal(b)) => a == b,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplGuardError>;
