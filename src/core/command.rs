// src/core/command.rs

//! Shell command execution behind a trait seam.
//!
//! Promotion, follow, rejoin, validation and the notification hook are all
//! operator-supplied commands. `ShellRunner` executes them for real;
//! integration tests substitute a recording implementation that scripts
//! exit codes, which makes every failover scenario reproducible.

use crate::core::errors::{ReplGuardError, Result};
use crate::core::types::{NodeId, NodeRecord};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// True when the transport produced nothing at all; for remote
    /// execution this is the signalled "unreachable via shell" case, which
    /// is distinct from a successful command with empty output.
    pub fn silent(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` through the local shell.
    async fn run_local(&self, command: &str) -> Result<CommandOutput>;

    /// Runs `command` on `host` over the SSH transport. `user` may be empty
    /// for the current user.
    async fn run_remote(
        &self,
        user: &str,
        host: &str,
        ssh_options: &str,
        command: &str,
    ) -> Result<CommandOutput>;
}

/// Production runner shelling out via `sh -c` locally and `ssh` remotely.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run_local(&self, command: &str) -> Result<CommandOutput> {
        debug!("executing local command:\n  {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_remote(
        &self,
        user: &str,
        host: &str,
        ssh_options: &str,
        command: &str,
    ) -> Result<CommandOutput> {
        let destination = if user.is_empty() {
            host.to_string()
        } else {
            format!("{user}@{host}")
        };

        let mut ssh = Command::new("ssh");
        ssh.arg("-o").arg("BatchMode=yes");
        for opt in ssh_options.split_whitespace() {
            ssh.arg(opt);
        }
        ssh.arg(&destination).arg(command).stdin(Stdio::null());

        debug!("executing remote command on {}:\n  {}", destination, command);
        let output = ssh.output().await?;
        let out = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        // ssh itself exits with 255 when the connection could not be made.
        if out.status == 255 {
            return Err(ReplGuardError::RemoteUnreachable {
                host: destination,
            });
        }
        Ok(out)
    }
}

/// Substitutes `%x`-style placeholders in a command template. `%%` yields a
/// literal percent sign; unknown placeholders are left untouched.
pub fn substitute_template(template: &str, substitutions: &[(char, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                out.push('%');
                chars.next();
            }
            Some(&p) => {
                if let Some((_, value)) = substitutions.iter().find(|(key, _)| *key == p) {
                    out.push_str(value);
                    chars.next();
                } else {
                    out.push('%');
                }
            }
            None => out.push('%'),
        }
    }
    out
}

/// `%n` = new primary node id.
pub fn follow_command(template: &str, new_primary_id: NodeId) -> String {
    substitute_template(template, &[('n', &new_primary_id.to_string())])
}

/// `%n` = candidate node id, `%a` = candidate node name.
pub fn failover_validation_command(template: &str, candidate: &NodeRecord) -> String {
    substitute_template(
        template,
        &[
            ('n', &candidate.node_id.to_string()),
            ('a', &candidate.name),
        ],
    )
}

/// `%d` = donor conninfo for the rejoin command.
pub fn rejoin_command(template: &str, donor_conninfo: &str) -> String {
    substitute_template(template, &[('d', donor_conninfo)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NodeType;

    fn record(id: NodeId, name: &str) -> NodeRecord {
        NodeRecord {
            node_id: id,
            name: name.to_string(),
            node_type: NodeType::Standby,
            upstream_node_id: Some(1),
            location: "default".to_string(),
            priority: 100,
            active: true,
            conninfo: String::new(),
            repluser: String::new(),
        }
    }

    #[test]
    fn follow_command_substitutes_node_id() {
        assert_eq!(
            follow_command("repmgr standby follow --upstream-node-id=%n", 7),
            "repmgr standby follow --upstream-node-id=7"
        );
    }

    #[test]
    fn validation_command_substitutes_id_and_name()  {
        let cmd = failover_validation_command("/usr/local/bin/validate %n %a", &record(3, "pg3"));
        assert_eq!(cmd, "/usr/local/bin/validate 3 pg3");
    }

    #[test]
    fn literal_percent_and_unknown_placeholders() {
        assert_eq!(substitute_template("100%% done %z", &[]), "100% done %z");
    }
}
