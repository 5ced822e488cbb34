//! An in-process `Store` for tests: a `Mutex`-protected set of collections
//! standing in for the database, with the same uniqueness and atomicity
//! guarantees the Postgres backend provides.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use uuid::Uuid;

use super::error::StoreError;
use super::models::*;
use super::requests::*;
use super::{NewAccessPolicy, Store};
use crate::ipam::{first_free, Pool};

#[derive(Default)]
struct Inner {
    nodes: HashMap<Uuid, Node>,
    devices: HashMap<Uuid, ClientDevice>,
    policies: HashMap<Uuid, AccessPolicy>,
    users: HashMap<String, User>,
    groups: HashMap<Uuid, Group>,
    memberships: Vec<UserGroupMembership>,
    user_access_policies: HashMap<Uuid, UserAccessPolicy>,
    trust_history: Vec<TrustHistoryEntry>,
    node_history: Vec<NodeHistoryEntry>,
    audit_log: Vec<AuditLogEntry>,
    config_version: i64,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            inner: Mutex::new(Inner {
                config_version: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_node_by_public_key(&self, public_key: &str) -> Result<Option<Node>, StoreError> {
        Ok(self
            .lock()
            .nodes
            .values()
            .find(|n| n.public_key == public_key)
            .cloned())
    }

    async fn find_node_by_hostname(&self, hostname: &str) -> Result<Option<Node>, StoreError> {
        Ok(self
            .lock()
            .nodes
            .values()
            .find(|n| n.hostname == hostname)
            .cloned())
    }

    async fn find_node_by_id(&self, id: Uuid) -> Result<Option<Node>, StoreError> {
        Ok(self.lock().nodes.get(&id).cloned())
    }

    async fn list_active_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .lock()
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .cloned()
            .collect())
    }

    async fn list_all_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.lock().nodes.values().cloned().collect())
    }

    async fn insert_node_allocating_ip(
        &self,
        new_node: NewNode,
        pool: &Pool,
    ) -> Result<Node, StoreError> {
        let mut inner = self.lock();
        if inner.nodes.values().any(|n| n.hostname == new_node.hostname) {
            return Err(StoreError::HostnameConflict(new_node.hostname));
        }
        let taken: HashSet<Ipv4Addr> = inner
            .nodes
            .values()
            .filter_map(|n| n.overlay_ip.map(|net| net.addr()))
            .chain(inner.devices.values().map(|d| d.overlay_ip))
            .collect();
        let addr = first_free(pool, &taken).map_err(|_| StoreError::PoolExhausted)?;
        let (trust_score, risk_level, trust_factors) = new_node.initial_trust();
        let now = Utc::now();
        let node = Node {
            id: Uuid::new_v4(),
            hostname: new_node.hostname,
            role: new_node.role,
            public_key: new_node.public_key,
            overlay_ip: Some(ipnet::Ipv4Net::new(addr, 32).expect("/32 is always valid")),
            real_ip: new_node.real_ip,
            listen_port: None,
            status: new_node.status,
            is_approved: false,
            config_version: inner.config_version,
            trust_score,
            risk_level,
            trust_factors,
            last_trust_update: None,
            description: new_node.description,
            agent_version: new_node.agent_version,
            os_info: new_node.os_info,
            created_at: now,
            updated_at: now,
            last_seen: Some(now),
        };
        inner.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn update_node(&self, node: &Node) -> Result<(), StoreError> {
        self.lock().nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: Uuid) -> Result<Option<Node>, StoreError> {
        Ok(self.lock().nodes.remove(&id))
    }

    async fn count_active_devices_for_user(&self, user_id: &str) -> Result<u32, StoreError> {
        Ok(self
            .lock()
            .devices
            .values()
            .filter(|d| d.user_id == user_id && d.status != DeviceStatus::Revoked)
            .count() as u32)
    }

    async fn find_device_by_name_for_user(
        &self,
        device_name: &str,
        user_id: &str,
    ) -> Result<Option<ClientDevice>, StoreError> {
        Ok(self
            .lock()
            .devices
            .values()
            .find(|d| {
                d.device_name == device_name
                    && d.user_id == user_id
                    && d.status != DeviceStatus::Revoked
            })
            .cloned())
    }

    async fn find_device_by_token(&self, token: &str) -> Result<Option<ClientDevice>, StoreError> {
        Ok(self
            .lock()
            .devices
            .values()
            .find(|d| d.config_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_device_by_id(&self, id: Uuid) -> Result<Option<ClientDevice>, StoreError> {
        Ok(self.lock().devices.get(&id).cloned())
    }

    async fn insert_client_device_allocating_ip(
        &self,
        new_device: NewClientDevice,
        pool: &Pool,
        max_devices_per_user: u32,
    ) -> Result<ClientDevice, StoreError> {
        let mut inner = self.lock();
        let active_count = inner
            .devices
            .values()
            .filter(|d| d.user_id == new_device.user_id && d.status != DeviceStatus::Revoked)
            .count() as u32;
        if active_count >= max_devices_per_user {
            return Err(StoreError::PoolExhausted);
        }
        if inner.devices.values().any(|d| {
            d.device_name == new_device.device_name
                && d.user_id == new_device.user_id
                && d.status != DeviceStatus::Revoked
        }) {
            return Err(StoreError::DeviceNameExists(new_device.device_name));
        }
        let taken: HashSet<Ipv4Addr> = inner
            .nodes
            .values()
            .filter_map(|n| n.overlay_ip.map(|net| net.addr()))
            .chain(inner.devices.values().map(|d| d.overlay_ip))
            .collect();
        let addr = first_free(pool, &taken).map_err(|_| StoreError::PoolExhausted)?;
        let device = ClientDevice {
            id: Uuid::new_v4(),
            device_name: new_device.device_name,
            device_type: new_device.device_type,
            user_id: new_device.user_id,
            public_key: new_device.public_key,
            private_key_sealed: new_device.private_key_sealed,
            preshared_key: new_device.preshared_key,
            overlay_ip: addr,
            tunnel_mode: new_device.tunnel_mode,
            status: DeviceStatus::Active,
            config_token: Some(new_device.config_token),
            config_downloaded: false,
            expires_at: new_device.expires_at,
            created_at: Utc::now(),
        };
        inner.devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn update_client_device(&self, device: &ClientDevice) -> Result<(), StoreError> {
        self.lock().devices.insert(device.id, device.clone());
        Ok(())
    }

    async fn taken_addresses(&self, pool: &Pool) -> Result<HashSet<Ipv4Addr>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .nodes
            .values()
            .filter_map(|n| n.overlay_ip.map(|net| net.addr()))
            .chain(inner.devices.values().map(|d| d.overlay_ip))
            .filter(|addr| pool.network_cidr.contains(addr))
            .collect())
    }

    async fn insert_policy(&self, policy: NewAccessPolicy) -> Result<AccessPolicy, StoreError> {
        let mut inner = self.lock();
        if inner.policies.values().any(|p| p.name == policy.name) {
            return Err(StoreError::PolicyExists(policy.name));
        }
        let ap = AccessPolicy {
            id: Uuid::new_v4(),
            name: policy.name,
            src_role: policy.src_role,
            dst_role: policy.dst_role,
            port: policy.port,
            protocol: policy.protocol,
            action: policy.action,
            priority: policy.priority,
            enabled: policy.enabled,
        };
        inner.policies.insert(ap.id, ap.clone());
        inner.config_version += 1;
        Ok(ap)
    }

    async fn update_policy(&self, policy: &AccessPolicy) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.policies.insert(policy.id, policy.clone());
        inner.config_version += 1;
        Ok(())
    }

    async fn delete_policy(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.policies.remove(&id);
        inner.config_version += 1;
        Ok(())
    }

    async fn get_policy_by_name(&self, name: &str) -> Result<Option<AccessPolicy>, StoreError> {
        Ok(self.lock().policies.values().find(|p| p.name == name).cloned())
    }

    async fn get_policy_by_id(&self, id: Uuid) -> Result<Option<AccessPolicy>, StoreError> {
        Ok(self.lock().policies.get(&id).cloned())
    }

    async fn list_enabled_policies_sorted(&self) -> Result<Vec<AccessPolicy>, StoreError> {
        let mut policies: Vec<AccessPolicy> = self
            .lock()
            .policies
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        policies.sort_by_key(|p| p.priority);
        Ok(policies)
    }

    async fn list_all_policies_sorted(&self) -> Result<Vec<AccessPolicy>, StoreError> {
        let mut policies: Vec<AccessPolicy> = self.lock().policies.values().cloned().collect();
        policies.sort_by_key(|p| p.priority);
        Ok(policies)
    }

    async fn current_config_version(&self) -> Result<i64, StoreError> {
        Ok(self.lock().config_version)
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(user_id).cloned())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut inner = self.lock();
        if inner.users.contains_key(&user.user_id) {
            return Err(StoreError::Database(format!("user `{}` already exists", user.user_id)));
        }
        if let Some(email) = &user.email {
            if inner.users.values().any(|u| u.email.as_deref() == Some(email.as_str())) {
                return Err(StoreError::Database(format!("email `{email}` already in use")));
            }
        }
        let u = User {
            id: Uuid::new_v4(),
            user_id: user.user_id.clone(),
            email: user.email,
            status: UserStatus::Active,
            attributes: user.attributes,
        };
        inner.users.insert(user.user_id, u.clone());
        Ok(u)
    }

    async fn group_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .lock()
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.group_id)
            .collect())
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
        Ok(self.lock().groups.get(&id).cloned())
    }

    async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>, StoreError> {
        Ok(self.lock().groups.values().find(|g| g.name == name).cloned())
    }

    async fn insert_group(&self, group: NewGroup) -> Result<Group, StoreError> {
        let mut inner = self.lock();
        if let Some(parent_id) = group.parent_group_id {
            if let Some(parent) = inner.groups.get(&parent_id) {
                if parent.name == group.name {
                    return Err(StoreError::GroupCycle);
                }
            }
        }
        let g = Group {
            id: Uuid::new_v4(),
            name: group.name,
            parent_group_id: group.parent_group_id,
        };
        inner.groups.insert(g.id, g.clone());
        Ok(g)
    }

    async fn insert_membership(&self, membership: NewMembership) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .memberships
            .iter_mut()
            .find(|m| m.user_id == membership.user_id && m.group_id == membership.group_id)
        {
            existing.role = membership.role;
            return Ok(());
        }
        inner.memberships.push(UserGroupMembership {
            user_id: membership.user_id,
            group_id: membership.group_id,
            role: membership.role,
        });
        Ok(())
    }

    async fn list_enabled_user_policies_for_resource(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<UserAccessPolicy>, StoreError> {
        let mut policies: Vec<UserAccessPolicy> = self
            .lock()
            .user_access_policies
            .values()
            .filter(|p| p.enabled && p.resource_type == resource_type)
            .cloned()
            .collect();
        policies.sort_by_key(|p| p.priority);
        Ok(policies)
    }

    async fn insert_user_access_policy(
        &self,
        policy: UserAccessPolicy,
    ) -> Result<UserAccessPolicy, StoreError> {
        let mut inner = self.lock();
        inner.user_access_policies.insert(policy.id, policy.clone());
        Ok(policy)
    }

    async fn append_trust_history(&self, entry: TrustHistoryEntry) -> Result<(), StoreError> {
        self.lock().trust_history.push(entry);
        Ok(())
    }

    async fn trust_history_since(
        &self,
        node_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrustHistoryEntry>, StoreError> {
        Ok(self
            .lock()
            .trust_history
            .iter()
            .filter(|e| e.node_id == node_id && e.created_at >= since)
            .cloned()
            .collect())
    }

    async fn append_node_history(&self, entry: NodeHistoryEntry) -> Result<(), StoreError> {
        self.lock().node_history.push(entry);
        Ok(())
    }

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        self.lock().audit_log.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_pool() -> Pool {
        Pool::node_pool("10.0.0.0/24".parse().unwrap(), "10.0.0.1".parse().unwrap())
    }

    fn new_node(hostname: &str) -> NewNode {
        NewNode {
            hostname: hostname.to_string(),
            role: "server".to_string(),
            public_key: format!("pk-{hostname}"),
            status: NodeStatus::Pending,
            description: None,
            agent_version: None,
            real_ip: None,
            os_info: None,
        }
    }

    #[tokio::test]
    async fn insert_node_allocates_address_and_rejects_hostname_conflict() {
        let store = InMemoryStore::new();
        let pool = node_pool();
        let node = store
            .insert_node_allocating_ip(new_node("a"), &pool)
            .await
            .unwrap();
        assert_eq!(node.overlay_ip.unwrap().addr(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());

        let err = store
            .insert_node_allocating_ip(new_node("a"), &pool)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HostnameConflict(_)));
    }

    #[tokio::test]
    async fn policy_insert_bumps_config_version_and_rejects_duplicate_name() {
        let store = InMemoryStore::new();
        let before = store.current_config_version().await.unwrap();
        store
            .insert_policy(NewAccessPolicy {
                name: "web-to-db".to_string(),
                src_role: "web".to_string(),
                dst_role: "db".to_string(),
                port: 5432,
                protocol: Protocol::Tcp,
                action: RuleAction::Accept,
                priority: 100,
                enabled: true,
            })
            .await
            .unwrap();
        let after = store.current_config_version().await.unwrap();
        assert_eq!(after, before + 1);

        let err = store
            .insert_policy(NewAccessPolicy {
                name: "web-to-db".to_string(),
                src_role: "web".to_string(),
                dst_role: "db".to_string(),
                port: 5432,
                protocol: Protocol::Tcp,
                action: RuleAction::Accept,
                priority: 100,
                enabled: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PolicyExists(_)));
    }
}
