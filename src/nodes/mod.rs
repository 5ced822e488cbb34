//! The Node Lifecycle Manager (§4.2): registration, re-registration,
//! approve/suspend/revoke/delete, and heartbeat field updates, with
//! idempotent peer programming on the hub via the [`OverlayDriver`]
//! capability.

pub mod error;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

pub use error::NodeError;

use crate::events::{DomainEvent, EventBus};
use crate::ipam::Pool;
use crate::overlay::OverlayDriver;
use crate::store::models::{Node, NodeStatus, OsInfo};
use crate::store::requests::NewNode;
use crate::store::Store;

/// Inputs to [`NodeManager::register`] (§4.2).
#[derive(Debug, Clone, Default)]
pub struct RegisterRequest {
    pub hostname: String,
    pub role: String,
    pub public_key: String,
    pub description: Option<String>,
    pub agent_version: Option<String>,
    pub os_info: Option<OsInfo>,
    pub client_ip: Option<String>,
}

/// The node as updated by a heartbeat, plus the `last_seen` it carried
/// *before* this heartbeat — the Trust Engine needs that gap to score the
/// behavior component (§4.4).
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub node: Node,
    pub previous_last_seen: Option<DateTime<Utc>>,
}

pub struct NodeManager {
    store: Arc<dyn Store>,
    overlay: Arc<dyn OverlayDriver>,
    events: EventBus,
    node_pool: Pool,
    auto_approve_all: bool,
    auto_approve_roles: HashSet<String>,
}

impl NodeManager {
    pub fn new(
        store: Arc<dyn Store>,
        overlay: Arc<dyn OverlayDriver>,
        events: EventBus,
        node_pool: Pool,
        auto_approve_all: bool,
        auto_approve_roles: HashSet<String>,
    ) -> Self {
        NodeManager {
            store,
            overlay,
            events,
            node_pool,
            auto_approve_all,
            auto_approve_roles,
        }
    }

    fn initial_status(&self, role: &str) -> NodeStatus {
        if self.auto_approve_all || self.auto_approve_roles.contains(role) {
            NodeStatus::Active
        } else {
            NodeStatus::Pending
        }
    }

    /// The central operation (§4.2, 7 steps). Returns `(node, is_new)`;
    /// `is_new = false` marks a re-registration (L1).
    pub async fn register(&self, req: RegisterRequest) -> Result<(Node, bool), NodeError> {
        if let Some(mut node) = self.store.find_node_by_public_key(&req.public_key).await? {
            node.last_seen = Some(Utc::now());
            if let Some(ip) = req.client_ip.clone() {
                node.real_ip = Some(ip);
            }
            if let Some(version) = req.agent_version.clone() {
                node.agent_version = Some(version);
            }
            if let Some(os_info) = req.os_info.clone() {
                node.os_info = Some(os_info);
            }
            self.store.update_node(&node).await?;

            if node.status == NodeStatus::Active {
                self.heal_peer(&node).await;
            }

            self.events.publish(DomainEvent::NodeReregistered {
                node_id: node.id,
                hostname: node.hostname.clone(),
            });
            return Ok((node, false));
        }

        let status = self.initial_status(&req.role);
        let new_node = NewNode {
            hostname: req.hostname,
            role: req.role,
            public_key: req.public_key,
            status,
            description: req.description,
            agent_version: req.agent_version,
            real_ip: req.client_ip,
            os_info: req.os_info,
        };

        let node = self.store.insert_node_allocating_ip(new_node, &self.node_pool).await?;

        if node.status == NodeStatus::Active {
            if let Some(host32) = node.overlay_host_32() {
                if let Err(err) = self.overlay.add_peer(&node.public_key, &host32).await {
                    warn!(node_id = %node.id, error = %err, "add_peer failed on registration, will heal on next poll");
                }
            }
        }

        self.events.publish(DomainEvent::NodeRegistered {
            node_id: node.id,
            hostname: node.hostname.clone(),
        });
        Ok((node, true))
    }

    /// Re-issues `add_peer` when the hub's peer table has drifted from an
    /// active node's expected state (§4.2 step 1).
    async fn heal_peer(&self, node: &Node) {
        let Some(host32) = node.overlay_host_32() else {
            return;
        };
        match self.overlay.peer_exists(&node.public_key).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = self.overlay.add_peer(&node.public_key, &host32).await {
                    warn!(node_id = %node.id, error = %err, "add_peer failed while healing drifted peer");
                }
            }
            Err(err) => warn!(node_id = %node.id, error = %err, "peer_exists check failed"),
        }
    }

    pub async fn update_heartbeat(
        &self,
        public_key: &str,
        client_ip: Option<String>,
        agent_version: Option<String>,
    ) -> Result<HeartbeatOutcome, NodeError> {
        let mut node = self
            .store
            .find_node_by_public_key(public_key)
            .await?
            .ok_or(NodeError::NotFound)?;

        let previous_last_seen = node.last_seen;
        node.last_seen = Some(Utc::now());
        if let Some(ip) = client_ip {
            node.real_ip = Some(ip);
        }
        if let Some(version) = agent_version {
            node.agent_version = Some(version);
        }
        self.store.update_node(&node).await?;

        Ok(HeartbeatOutcome { node, previous_last_seen })
    }

    pub async fn get_by_hostname(&self, hostname: &str) -> Result<Node, NodeError> {
        self.store
            .find_node_by_hostname(hostname)
            .await?
            .ok_or(NodeError::NotFound)
    }

    pub async fn get_by_public_key(&self, public_key: &str) -> Result<Node, NodeError> {
        self.store
            .find_node_by_public_key(public_key)
            .await?
            .ok_or(NodeError::NotFound)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Node, NodeError> {
        self.store.find_node_by_id(id).await?.ok_or(NodeError::NotFound)
    }

    pub async fn list_all(&self) -> Result<Vec<Node>, NodeError> {
        Ok(self.store.list_all_nodes().await?)
    }

    /// `pending → active` (§4.2 state machine). Idempotent (L2): approving
    /// an already-active node is a no-op.
    pub async fn approve(&self, id: Uuid) -> Result<Node, NodeError> {
        let mut node = self.get_by_id(id).await?;
        if node.status == NodeStatus::Active {
            return Ok(node);
        }
        node.status = NodeStatus::Active;
        node.is_approved = true;
        self.store.update_node(&node).await?;

        if let Some(host32) = node.overlay_host_32() {
            if let Err(err) = self.overlay.add_peer(&node.public_key, &host32).await {
                warn!(node_id = %node.id, error = %err, "add_peer failed on approve");
            }
        }

        self.events.publish(DomainEvent::NodeApproved {
            node_id: node.id,
            hostname: node.hostname.clone(),
        });
        info!(node_id = %node.id, hostname = %node.hostname, "node approved");
        Ok(node)
    }

    /// `active → suspended` (§4.2 state machine). Admin or Trust Engine driven.
    pub async fn suspend(&self, id: Uuid, reason: &str) -> Result<Node, NodeError> {
        let mut node = self.get_by_id(id).await?;
        if node.status == NodeStatus::Suspended {
            return Ok(node);
        }
        node.status = NodeStatus::Suspended;
        self.store.update_node(&node).await?;

        if let Err(err) = self.overlay.remove_peer(&node.public_key).await {
            warn!(node_id = %node.id, error = %err, "remove_peer failed on suspend");
        }

        self.events.publish(DomainEvent::NodeSuspended {
            node_id: node.id,
            hostname: node.hostname.clone(),
            reason: reason.to_string(),
        });
        info!(node_id = %node.id, hostname = %node.hostname, reason, "node suspended");
        Ok(node)
    }

    /// any → `revoked` (§4.2 state machine), terminal from the Trust Engine's
    /// perspective. Admin may still `delete` afterward.
    pub async fn revoke(&self, id: Uuid, reason: &str) -> Result<Node, NodeError> {
        let mut node = self.get_by_id(id).await?;
        if node.status == NodeStatus::Revoked {
            return Ok(node);
        }
        node.status = NodeStatus::Revoked;
        node.is_approved = false;
        self.store.update_node(&node).await?;

        if let Err(err) = self.overlay.remove_peer(&node.public_key).await {
            warn!(node_id = %node.id, error = %err, "remove_peer failed on revoke");
        }

        self.events.publish(DomainEvent::NodeRevoked {
            node_id: node.id,
            hostname: node.hostname.clone(),
            reason: reason.to_string(),
        });
        info!(node_id = %node.id, hostname = %node.hostname, reason, "node revoked");
        Ok(node)
    }

    /// Deletes the node; its address implicitly returns to the free set
    /// since `taken_addresses` is computed from live rows (§4.1, S5).
    pub async fn delete(&self, id: Uuid) -> Result<(), NodeError> {
        let node = self.store.delete_node(id).await?.ok_or(NodeError::NotFound)?;
        if let Err(err) = self.overlay.remove_peer(&node.public_key).await {
            warn!(node_id = %node.id, error = %err, "remove_peer failed on delete");
        }
        self.events.publish(DomainEvent::NodeDeleted {
            node_id: node.id,
            hostname: node.hostname.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::memory::InMemoryOverlayDriver;
    use crate::store::memory::InMemoryStore;

    fn node_pool() -> Pool {
        Pool::node_pool("10.0.0.0/24".parse().unwrap(), "10.0.0.1".parse().unwrap())
    }

    fn manager(auto_approve_all: bool) -> NodeManager {
        NodeManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryOverlayDriver::new()),
            EventBus::default(),
            node_pool(),
            auto_approve_all,
            HashSet::new(),
        )
    }

    fn register_req(hostname: &str, role: &str, key: &str) -> RegisterRequest {
        RegisterRequest {
            hostname: hostname.to_string(),
            role: role.to_string(),
            public_key: key.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scenario_s1_auto_approve_assigns_first_host_and_is_idempotent() {
        let mgr = manager(true);
        let (node, is_new) = mgr.register(register_req("app-01", "app", "K1")).await.unwrap();
        assert!(is_new);
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.overlay_ip.unwrap().addr().to_string(), "10.0.0.2");

        let (node2, is_new2) = mgr.register(register_req("app-01", "app", "K1")).await.unwrap();
        assert!(!is_new2);
        assert_eq!(node2.id, node.id);
        assert_eq!(node2.overlay_ip, node.overlay_ip);
    }

    #[tokio::test]
    async fn law_i6_reregistration_never_reallocates_or_changes_status() {
        let mgr = manager(false);
        let (first, _) = mgr.register(register_req("app-01", "app", "K1")).await.unwrap();
        assert_eq!(first.status, NodeStatus::Pending);

        let (again, is_new) = mgr.register(register_req("app-01", "app", "K1")).await.unwrap();
        assert!(!is_new);
        assert_eq!(again.status, NodeStatus::Pending);
        assert_eq!(again.overlay_ip, first.overlay_ip);
    }

    #[tokio::test]
    async fn hostname_conflict_with_different_key() {
        let mgr = manager(true);
        mgr.register(register_req("app-01", "app", "K1")).await.unwrap();
        let err = mgr.register(register_req("app-01", "app", "K2")).await.unwrap_err();
        assert!(matches!(err, NodeError::HostnameConflict(_)));
    }

    #[tokio::test]
    async fn approve_is_idempotent_and_programs_peer() {
        let mgr = manager(false);
        let (node, _) = mgr.register(register_req("app-01", "app", "K1")).await.unwrap();
        let approved = mgr.approve(node.id).await.unwrap();
        assert_eq!(approved.status, NodeStatus::Active);

        let approved_again = mgr.approve(node.id).await.unwrap();
        assert_eq!(approved_again.status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn scenario_s5_delete_frees_the_address_for_reuse() {
        let mgr = manager(true);
        let (node, _) = mgr.register(register_req("app-01", "app", "K1")).await.unwrap();
        mgr.delete(node.id).await.unwrap();

        let (next, _) = mgr.register(register_req("app-02", "app", "K2")).await.unwrap();
        assert_eq!(next.overlay_ip, node.overlay_ip);
    }

    #[tokio::test]
    async fn suspend_then_revoke_are_each_idempotent() {
        let mgr = manager(true);
        let (node, _) = mgr.register(register_req("app-01", "app", "K1")).await.unwrap();
        let suspended = mgr.suspend(node.id, "manual").await.unwrap();
        assert_eq!(suspended.status, NodeStatus::Suspended);
        let suspended_again = mgr.suspend(node.id, "manual").await.unwrap();
        assert_eq!(suspended_again.status, NodeStatus::Suspended);

        let revoked = mgr.revoke(node.id, "manual").await.unwrap();
        assert_eq!(revoked.status, NodeStatus::Revoked);
        assert!(!revoked.is_approved);
    }
}
