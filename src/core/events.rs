// src/core/events.rs

//! The event bus: every significant transition produces an event that is
//! written to the events table (when a writable connection is available)
//! and forwarded to the operator's notification hook. Both sinks are
//! best-effort; neither may interrupt the state machines that emit.

use crate::core::command::{CommandRunner, substitute_template};
use crate::core::link::DbLink;
use crate::core::metastore::MetaStore as _;
use crate::core::types::{Event, EventKind, NodeId};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub struct EventBus {
    node_id: NodeId,
    node_name: String,
    hook_command: String,
    /// Event kinds forwarded to the hook; `None` forwards everything.
    accepted: Option<HashSet<String>>,
    runner: Arc<dyn CommandRunner>,
}

impl EventBus {
    pub fn new(
        node_id: NodeId,
        node_name: String,
        hook_command: String,
        accepted_kinds: &[String],
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let accepted = if accepted_kinds.is_empty() {
            None
        } else {
            Some(accepted_kinds.iter().cloned().collect())
        };
        Self {
            node_id,
            node_name,
            hook_command,
            accepted,
            runner,
        }
    }

    /// Records and forwards one event. `store` is the connection the event
    /// row should be written through, if any is currently writable.
    pub async fn emit(
        &self,
        store: Option<&Arc<dyn DbLink>>,
        kind: EventKind,
        success: bool,
        detail: &str,
    ) {
        let event = Event {
            node_id: self.node_id,
            node_name: self.node_name.clone(),
            kind,
            success,
            detail: detail.to_string(),
            timestamp: Utc::now(),
        };

        info!(event = %kind, success, "{}", detail);

        if let Some(link) = store {
            if let Err(e) = link.record_event(&event).await {
                warn!("unable to write {} event to events table: {}", kind, e);
            }
        }

        self.invoke_hook(&event).await;
    }

    async fn invoke_hook(&self, event: &Event) {
        if self.hook_command.is_empty() {
            return;
        }
        if let Some(accepted) = &self.accepted {
            if !accepted.contains(&event.kind.to_string()) {
                return;
            }
        }

        // `%p` carries the whole event as one JSON value for hooks that
        // prefer a machine-readable payload over positional arguments.
        let payload = serde_json::json!({
            "node_id": event.node_id,
            "name": event.node_name,
            "event": event.kind.to_string(),
            "success": event.success,
            "details": event.detail,
            "timestamp": event.timestamp.to_rfc3339(),
        })
        .to_string();

        let command = substitute_template(
            &self.hook_command,
            &[
                ('n', &event.node_id.to_string()),
                ('e', &event.kind.to_string()),
                ('s', if event.success { "1" } else { "0" }),
                ('d', &event.detail),
                ('p', &payload),
            ],
        );

        match self.runner.run_local(&command).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(
                "event notification command for {} exited with status {}",
                event.kind, out.status
            ),
            Err(e) => warn!("event notification command for {} failed: {}", event.kind, e),
        }
    }
}
