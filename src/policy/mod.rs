//! The Policy Engine (§4.3): compiles role-to-role `AccessPolicy` rows into
//! per-node firewall rules and hub/spoke peer lists, and evaluates
//! user→resource `UserAccessPolicy` rows for the admin-facing access check.

pub mod access;
pub mod error;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use error::PolicyError;
pub use access::{evaluate_access, AccessDecision};

use crate::events::{DomainEvent, EventBus};
use crate::store::models::{AccessPolicy, Node, Protocol, RuleAction};
use crate::store::{NewAccessPolicy, Store};

/// The role values the scoring table and built-in ACL fallback know about;
/// `"*"` is additionally accepted on `AccessPolicy.src_role`/`dst_role` as a
/// wildcard (§4.3.1 step 3).
const VALID_ROLES: &[&str] = &["hub", "ops", "monitor", "app", "db", "gateway"];

fn role_is_valid(role: &str) -> bool {
    role == "*" || VALID_ROLES.contains(&role)
}

/// One compiled firewall rule for an agent to install (§4.3.1).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AclRule {
    pub src_ip: String,
    pub port: u16,
    pub proto: Protocol,
    pub action: RuleAction,
    pub comment: String,
}

/// One compiled WireGuard peer entry (§4.3.2).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Peer {
    pub public_key: String,
    pub allowed_ips: String,
    pub endpoint: Option<String>,
    pub persistent_keepalive: u16,
}

/// `{peers, acl_rules, config_version, generated_at}` (§4.3.2). DNS servers
/// and the agent timing hints live in the HTTP DTO, not here — they are
/// static configuration, not something the Policy Engine compiles per node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub peers: Vec<Peer>,
    pub acl_rules: Vec<AclRule>,
    pub config_version: i64,
    pub generated_at: DateTime<Utc>,
}

fn default_acl() -> Vec<(&'static str, &'static str, u16, Protocol, &'static str)> {
    vec![
        ("ops", "*", 22, Protocol::Tcp, "ops->any"),
        ("ops", "*", 9100, Protocol::Tcp, "ops->any"),
        ("app", "db", 5432, Protocol::Tcp, "app->db"),
        ("*", "hub", 51820, Protocol::Udp, "*->hub"),
    ]
}

pub struct PolicyEngine {
    store: Arc<dyn Store>,
    events: EventBus,
    hub_public_key: String,
    hub_endpoint: String,
    overlay_network: String,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<dyn Store>,
        events: EventBus,
        hub_public_key: String,
        hub_endpoint: String,
        overlay_network: String,
    ) -> Self {
        PolicyEngine {
            store,
            events,
            hub_public_key,
            hub_endpoint,
            overlay_network,
        }
    }

    /// §4.3.1: role-to-role ACL compilation for `target`. Falls back to a
    /// built-in default set when no `AccessPolicy` rows are enabled.
    pub async fn generate_acl_for_node(&self, target: &Node) -> Result<Vec<AclRule>, PolicyError> {
        let policies = self.store.list_enabled_policies_sorted().await?;
        let active_nodes = self.store.list_active_nodes().await?;

        let mut rules = Vec::new();

        if policies.is_empty() {
            for (src_role, dst_role, port, proto, comment) in default_acl() {
                if dst_role != target.role && dst_role != "*" {
                    continue;
                }
                for source in &active_nodes {
                    if source.id == target.id || source.overlay_ip.is_none() {
                        continue;
                    }
                    if src_role != source.role && src_role != "*" {
                        continue;
                    }
                    rules.push(AclRule {
                        src_ip: source.overlay_ip.map(|net| net.addr().to_string()).unwrap_or_default(),
                        port,
                        proto,
                        action: RuleAction::Accept,
                        comment: comment.to_string(),
                    });
                }
            }
            return Ok(rules);
        }

        for policy in &policies {
            if policy.dst_role != target.role && policy.dst_role != "*" {
                continue;
            }
            for source in &active_nodes {
                if source.id == target.id || source.overlay_ip.is_none() {
                    continue;
                }
                if policy.src_role != source.role && policy.src_role != "*" {
                    continue;
                }
                rules.push(AclRule {
                    src_ip: source.overlay_ip.map(|net| net.addr().to_string()).unwrap_or_default(),
                    port: policy.port,
                    proto: policy.protocol,
                    action: policy.action,
                    comment: if policy.name.is_empty() {
                        format!("{}->{}", policy.src_role, policy.dst_role)
                    } else {
                        policy.name.clone()
                    },
                });
            }
        }
        Ok(rules)
    }

    /// §4.3.2: hub emits one peer per other active node; spokes emit a
    /// single peer pointing at the hub.
    pub async fn generate_peers_for_node(&self, target: &Node) -> Result<Vec<Peer>, PolicyError> {
        if target.role == "hub" {
            let active_nodes = self.store.list_active_nodes().await?;
            let mut peers = Vec::new();
            for node in active_nodes {
                if node.id == target.id {
                    continue;
                }
                let Some(allowed_ips) = node.overlay_host_32() else {
                    continue;
                };
                let endpoint = match (&node.real_ip, node.listen_port) {
                    (Some(ip), Some(port)) => Some(format!("{ip}:{port}")),
                    _ => None,
                };
                peers.push(Peer {
                    public_key: node.public_key,
                    allowed_ips,
                    endpoint,
                    persistent_keepalive: 25,
                });
            }
            Ok(peers)
        } else {
            Ok(vec![Peer {
                public_key: self.hub_public_key.clone(),
                allowed_ips: self.overlay_network.clone(),
                endpoint: Some(self.hub_endpoint.clone()),
                persistent_keepalive: 25,
            }])
        }
    }

    pub async fn build_config_for_node(&self, target: &Node) -> Result<NodeConfig, PolicyError> {
        let peers = self.generate_peers_for_node(target).await?;
        let acl_rules = self.generate_acl_for_node(target).await?;
        let config_version = self.store.current_config_version().await?;
        Ok(NodeConfig {
            peers,
            acl_rules,
            config_version,
            generated_at: Utc::now(),
        })
    }

    fn validate_new_policy(name: &str, src_role: &str, dst_role: &str, port: u16, protocol: Protocol) -> Result<(), PolicyError> {
        if name.trim().is_empty() {
            return Err(PolicyError::Validation("name must not be empty".to_string()));
        }
        if !role_is_valid(src_role) {
            return Err(PolicyError::Validation(format!("invalid src_role `{src_role}`")));
        }
        if !role_is_valid(dst_role) {
            return Err(PolicyError::Validation(format!("invalid dst_role `{dst_role}`")));
        }
        if port == 0 {
            return Err(PolicyError::Validation("port must be between 1 and 65535".to_string()));
        }
        let _ = protocol;
        Ok(())
    }

    pub async fn create_policy(&self, new_policy: NewAccessPolicy) -> Result<AccessPolicy, PolicyError> {
        Self::validate_new_policy(
            &new_policy.name,
            &new_policy.src_role,
            &new_policy.dst_role,
            new_policy.port,
            new_policy.protocol,
        )?;
        if self.store.get_policy_by_name(&new_policy.name).await?.is_some() {
            return Err(PolicyError::PolicyExists(new_policy.name));
        }
        let policy = self.store.insert_policy(new_policy).await?;
        self.bump_config_version().await?;
        Ok(policy)
    }

    pub async fn update_policy(&self, policy: AccessPolicy) -> Result<AccessPolicy, PolicyError> {
        Self::validate_new_policy(&policy.name, &policy.src_role, &policy.dst_role, policy.port, policy.protocol)?;
        self.store
            .get_policy_by_id(policy.id)
            .await?
            .ok_or(PolicyError::NotFound)?;
        self.store.update_policy(&policy).await?;
        self.bump_config_version().await?;
        Ok(policy)
    }

    pub async fn delete_policy(&self, id: uuid::Uuid) -> Result<(), PolicyError> {
        self.store.get_policy_by_id(id).await?.ok_or(PolicyError::NotFound)?;
        self.store.delete_policy(id).await?;
        self.bump_config_version().await?;
        Ok(())
    }

    pub async fn get_policy(&self, id: uuid::Uuid) -> Result<AccessPolicy, PolicyError> {
        self.store.get_policy_by_id(id).await?.ok_or(PolicyError::NotFound)
    }

    /// Every policy mutation increments `config_version` by exactly one (I4);
    /// publishing lets agents' config-sync pollers notice without re-reading
    /// every node's config on every tick.
    async fn bump_config_version(&self) -> Result<(), PolicyError> {
        let version = self.store.current_config_version().await?;
        self.events.publish(DomainEvent::PolicyChanged { config_version: version });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::models::{NodeStatus, TunnelMode};
    use crate::store::requests::NewNode;
    use std::net::Ipv4Addr;

    fn engine(store: Arc<dyn Store>) -> PolicyEngine {
        PolicyEngine::new(
            store,
            EventBus::default(),
            "HUBPUBKEY".to_string(),
            "hub.example.com:51820".to_string(),
            "10.0.0.0/24".to_string(),
        )
    }

    fn new_node(hostname: &str, role: &str) -> NewNode {
        NewNode {
            hostname: hostname.to_string(),
            role: role.to_string(),
            public_key: format!("pk-{hostname}"),
            status: NodeStatus::Active,
            description: None,
            agent_version: None,
            real_ip: None,
            os_info: None,
        }
    }

    #[tokio::test]
    async fn default_acl_applies_when_no_policies_enabled() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let pool = crate::ipam::Pool::node_pool(
            "10.0.0.0/24".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        );
        let ops = store.insert_node_allocating_ip(new_node("ops-1", "ops"), &pool).await.unwrap();
        let db = store.insert_node_allocating_ip(new_node("db-1", "db"), &pool).await.unwrap();

        let engine = engine(store.clone());
        let rules = engine.generate_acl_for_node(&db).await.unwrap();

        let ops_ip = ops.overlay_ip.unwrap().addr().to_string();
        assert!(rules.iter().any(|r| r.port == 22 && r.src_ip == ops_ip));
    }

    #[tokio::test]
    async fn hub_gets_one_peer_per_spoke_and_spokes_get_the_hub() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let pool = crate::ipam::Pool::node_pool(
            "10.0.0.0/24".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        );
        let hub = store.insert_node_allocating_ip(new_node("hub-1", "hub"), &pool).await.unwrap();
        store.insert_node_allocating_ip(new_node("app-1", "app"), &pool).await.unwrap();

        let engine = engine(store.clone());
        let hub_peers = engine.generate_peers_for_node(&hub).await.unwrap();
        assert_eq!(hub_peers.len(), 1);

        let app = store.find_node_by_hostname("app-1").await.unwrap().unwrap();
        let spoke_peers = engine.generate_peers_for_node(&app).await.unwrap();
        assert_eq!(spoke_peers.len(), 1);
        assert_eq!(spoke_peers[0].public_key, "HUBPUBKEY");
        assert_eq!(spoke_peers[0].allowed_ips, "10.0.0.0/24");
        let _ = TunnelMode::Full;
        let _: Ipv4Addr = "10.0.0.1".parse().unwrap();
    }

    #[tokio::test]
    async fn create_policy_rejects_invalid_role_and_duplicate_name() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = engine(store);

        let bad_role = NewAccessPolicy {
            name: "p1".to_string(),
            src_role: "nonsense".to_string(),
            dst_role: "db".to_string(),
            port: 5432,
            protocol: Protocol::Tcp,
            action: RuleAction::Accept,
            priority: 10,
            enabled: true,
        };
        assert!(matches!(engine.create_policy(bad_role).await, Err(PolicyError::Validation(_))));

        let good = NewAccessPolicy {
            name: "p1".to_string(),
            src_role: "app".to_string(),
            dst_role: "db".to_string(),
            port: 5432,
            protocol: Protocol::Tcp,
            action: RuleAction::Accept,
            priority: 10,
            enabled: true,
        };
        engine.create_policy(good.clone()).await.unwrap();
        assert!(matches!(engine.create_policy(good).await, Err(PolicyError::PolicyExists(_))));
    }
}
