//! Handlers registered at construction (§4.6, §9): an audit-log writer and a
//! node-history writer, each subscribed to the `EventBus` and draining it for
//! the life of the process. Both tables are append-only.

use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::{DomainEvent, EventBus};
use crate::store::models::{AuditLogEntry, NodeHistoryEntry};
use crate::store::Store;

/// Subscribes the audit-log and node-history writers to `bus`. Each runs on
/// its own blocking task for the process lifetime; `store` writes are
/// fire-and-forget — a failure here is logged, never surfaced to the caller
/// whose operation already completed (§7 propagation policy).
pub fn spawn_history_writers(bus: &EventBus, store: Arc<dyn Store>) {
    let audit_rx = bus.subscribe();
    let audit_store = Arc::clone(&store);
    tokio::task::spawn_blocking(move || {
        let handle = tokio::runtime::Handle::current();
        for event in audit_rx.iter() {
            let entry = audit_entry_for(&event);
            if let Err(err) = handle.block_on(audit_store.append_audit_log(entry)) {
                warn!(error = %err, "failed to append audit log entry");
            }
        }
    });

    let history_rx = bus.subscribe();
    tokio::task::spawn_blocking(move || {
        let handle = tokio::runtime::Handle::current();
        for event in history_rx.iter() {
            if let Some(entry) = node_history_entry_for(&event) {
                if let Err(err) = handle.block_on(store.append_node_history(entry)) {
                    warn!(error = %err, "failed to append node history entry");
                }
            }
        }
    });
}

fn new_audit(category: &str, action: &str, subject: String, detail: String, success: bool) -> AuditLogEntry {
    AuditLogEntry {
        id: Uuid::new_v4(),
        category: category.to_string(),
        action: action.to_string(),
        subject,
        detail,
        success,
        created_at: chrono::Utc::now(),
    }
}

fn audit_entry_for(event: &DomainEvent) -> AuditLogEntry {
    match event {
        DomainEvent::NodeRegistered { node_id, hostname } => new_audit(
            "registration",
            "create",
            "node".to_string(),
            format!("hostname={hostname} node_id={node_id}"),
            true,
        ),
        DomainEvent::NodeReregistered { node_id, hostname } => new_audit(
            "registration",
            "reregister",
            "node".to_string(),
            format!("hostname={hostname} node_id={node_id}"),
            true,
        ),
        DomainEvent::NodeApproved { node_id, hostname } => new_audit(
            "lifecycle",
            "approve",
            "node".to_string(),
            format!("hostname={hostname} node_id={node_id}"),
            true,
        ),
        DomainEvent::NodeSuspended { node_id, hostname, reason } => new_audit(
            "lifecycle",
            "suspend",
            "node".to_string(),
            format!("hostname={hostname} node_id={node_id} reason={reason}"),
            true,
        ),
        DomainEvent::NodeRevoked { node_id, hostname, reason } => new_audit(
            "lifecycle",
            "revoke",
            "node".to_string(),
            format!("hostname={hostname} node_id={node_id} reason={reason}"),
            true,
        ),
        DomainEvent::NodeDeleted { node_id, hostname } => new_audit(
            "lifecycle",
            "delete",
            "node".to_string(),
            format!("hostname={hostname} node_id={node_id}"),
            true,
        ),
        DomainEvent::TrustScored { node_id, hostname, score, action } => new_audit(
            "trust",
            "score",
            "node".to_string(),
            format!("hostname={hostname} node_id={node_id} score={score:.3} action={action}"),
            true,
        ),
        DomainEvent::PolicyChanged { config_version } => new_audit(
            "policy",
            "mutate",
            "access_policy".to_string(),
            format!("config_version={config_version}"),
            true,
        ),
        DomainEvent::ClientDeviceCreated { device_id, user_id } => new_audit(
            "client_device",
            "create",
            "client_device".to_string(),
            format!("device_id={device_id} user_id={user_id}"),
            true,
        ),
        DomainEvent::ClientDeviceRevoked { device_id, user_id } => new_audit(
            "client_device",
            "revoke",
            "client_device".to_string(),
            format!("device_id={device_id} user_id={user_id}"),
            true,
        ),
    }
}

fn node_history_entry_for(event: &DomainEvent) -> Option<NodeHistoryEntry> {
    let (node_id, hostname, transition, detail) = match event {
        DomainEvent::NodeRegistered { node_id, hostname } => {
            (*node_id, hostname.clone(), "registered", "initial registration".to_string())
        }
        DomainEvent::NodeReregistered { node_id, hostname } => {
            (*node_id, hostname.clone(), "reregistered", String::new())
        }
        DomainEvent::NodeApproved { node_id, hostname } => {
            (*node_id, hostname.clone(), "approved", String::new())
        }
        DomainEvent::NodeSuspended { node_id, hostname, reason } => {
            (*node_id, hostname.clone(), "suspended", reason.clone())
        }
        DomainEvent::NodeRevoked { node_id, hostname, reason } => {
            (*node_id, hostname.clone(), "revoked", reason.clone())
        }
        DomainEvent::NodeDeleted { node_id, hostname } => {
            (*node_id, hostname.clone(), "deleted", String::new())
        }
        _ => return None,
    };
    Some(NodeHistoryEntry {
        id: Uuid::new_v4(),
        node_id,
        hostname,
        transition: transition.to_string(),
        detail,
        created_at: chrono::Utc::now(),
    })
}
