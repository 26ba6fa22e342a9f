// src/core/vip.rs

//! Virtual-IP handling. The address is only ever mutated by the node that
//! currently holds (or is taking) the primary role: bound after a verified
//! promotion, released whenever the node stops being primary.

use crate::core::command::CommandRunner;
use crate::core::errors::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Whether a virtual IP is configured and the interface exists on this host.
pub fn vip_configured(virtual_ip: &str, interface: &str) -> bool {
    if virtual_ip.is_empty() || interface.is_empty() {
        return false;
    }
    Path::new("/sys/class/net").join(interface).exists()
}

pub async fn bind_virtual_ip(
    runner: &Arc<dyn CommandRunner>,
    virtual_ip: &str,
    interface: &str,
) -> Result<bool> {
    let command = format!("ip addr add {virtual_ip} dev {interface}");
    let out = runner.run_local(&command).await?;
    if out.success() {
        info!("bound virtual IP {} to {}", virtual_ip, interface);
        Ok(true)
    } else {
        // "File exists" means the address is already bound, which is fine.
        if out.stderr.contains("File exists") {
            return Ok(true);
        }
        warn!(
            "unable to bind virtual IP {} to {}: {}",
            virtual_ip,
            interface,
            out.stderr.trim()
        );
        Ok(false)
    }
}

pub async fn release_virtual_ip(
    runner: &Arc<dyn CommandRunner>,
    virtual_ip: &str,
    interface: &str,
) -> Result<bool> {
    let command = format!("ip addr del {virtual_ip} dev {interface}");
    let out = runner.run_local(&command).await?;
    if out.success() {
        info!("released virtual IP {} from {}", virtual_ip, interface);
        Ok(true)
    } else {
        if out.stderr.contains("Cannot assign") || out.stderr.contains("not found") {
            return Ok(true);
        }
        warn!(
            "unable to release virtual IP {} from {}: {}",
            virtual_ip,
            interface,
            out.stderr.trim()
        );
        Ok(false)
    }
}
