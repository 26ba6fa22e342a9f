// src/core/crosscheck.rs

//! The CSV wire format one node uses to ask another for its pairwise
//! reachability view, and the cube those per-observer matrices assemble
//! into. A reporting artifact consumed by the administrative surface, not
//! by the failover core.

use crate::core::errors::{ReplGuardError, Result};
use crate::core::peer::PeerClient;
use crate::core::types::NodeId;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Connection status codes of the crosscheck wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityStatus {
    Unknown,
    Down,
    Up,
}

impl ReachabilityStatus {
    pub fn code(&self) -> i32 {
        match self {
            ReachabilityStatus::Unknown => -2,
            ReachabilityStatus::Down => -1,
            ReachabilityStatus::Up => 0,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -2 => Some(ReachabilityStatus::Unknown),
            -1 => Some(ReachabilityStatus::Down),
            0 => Some(ReachabilityStatus::Up),
            _ => None,
        }
    }
}

/// One line of a node's matrix dump: how `source` sees `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixEntry {
    pub source: NodeId,
    pub target: NodeId,
    pub status: ReachabilityStatus,
}

/// Formats matrix entries as `source_id,target_id,status` lines.
pub fn format_matrix(entries: &[MatrixEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(
            out,
            "{},{},{}",
            entry.source,
            entry.target,
            entry.status.code()
        );
    }
    out
}

pub fn parse_matrix(input: &str) -> Result<Vec<MatrixEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 3 {
            return Err(ReplGuardError::Internal(format!(
                "malformed crosscheck line {}: {line:?}",
                lineno + 1
            )));
        }
        let parse_id = |s: &str| {
            s.trim()
                .parse::<NodeId>()
                .map_err(|e| ReplGuardError::Internal(format!("bad node id {s:?}: {e}")))
        };
        let code: i32 = fields[2]
            .trim()
            .parse()
            .map_err(|e| ReplGuardError::Internal(format!("bad status {:?}: {e}", fields[2])))?;
        let status = ReachabilityStatus::from_code(code).ok_or_else(|| {
            ReplGuardError::Internal(format!("unknown crosscheck status code {code}"))
        })?;
        entries.push(MatrixEntry {
            source: parse_id(fields[0])?,
            target: parse_id(fields[1])?,
            status,
        });
    }
    Ok(entries)
}

/// Asks a peer to dump its matrix view over the shell transport. `command`
/// is the operator-configured dump invocation on the remote host.
pub async fn fetch_matrix(peer: &PeerClient, command: &str) -> Result<Vec<MatrixEntry>> {
    let out = peer.run_remote(command).await?;
    if out.silent() {
        return Err(ReplGuardError::RemoteUnreachable {
            host: peer.record.name.clone(),
        });
    }
    parse_matrix(&out.stdout)
}

/// Each observer's view of each (source, target) pair; `Unknown` where an
/// observer returned nothing.
pub struct ReachabilityCube {
    node_ids: Vec<NodeId>,
    cells: HashMap<(NodeId, NodeId, NodeId), ReachabilityStatus>,
}

impl ReachabilityCube {
    pub fn new(node_ids: Vec<NodeId>) -> Self {
        Self {
            node_ids,
            cells: HashMap::new(),
        }
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    pub fn absorb(&mut self, observer: NodeId, entries: &[MatrixEntry]) {
        for entry in entries {
            self.cells
                .insert((observer, entry.source, entry.target), entry.status);
        }
    }

    pub fn get(&self, observer: NodeId, source: NodeId, target: NodeId) -> ReachabilityStatus {
        self.cells
            .get(&(observer, source, target))
            .copied()
            .unwrap_or(ReachabilityStatus::Unknown)
    }
}
