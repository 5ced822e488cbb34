//! Typed persistence for the controller's entities (§3), with transactional,
//! unique-constraint-enforcing operations for the handful of writes that must
//! be atomic (IP allocation, policy mutation bumping `config_version`).
//!
//! Shape: a narrow async trait, a real backend (Postgres via `sqlx`), and an
//! in-memory fake for tests — one trait, two implementations.

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod requests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use uuid::Uuid;

pub use error::StoreError;
use models::*;
use requests::*;

use crate::ipam::Pool;

/// The full set of persistence operations the core needs. A single trait
/// (rather than one per entity) keeps the transactional operations — insert
/// with IP allocation, policy mutation with version bump — easy to reason
/// about: each is exactly one trait method, so "this must happen atomically"
/// is enforced by the implementation of that one method, not by composing
/// several calls from the caller's side.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    // --- Nodes -------------------------------------------------------
    async fn find_node_by_public_key(&self, public_key: &str) -> Result<Option<Node>, StoreError>;
    async fn find_node_by_hostname(&self, hostname: &str) -> Result<Option<Node>, StoreError>;
    async fn find_node_by_id(&self, id: Uuid) -> Result<Option<Node>, StoreError>;
    async fn list_active_nodes(&self) -> Result<Vec<Node>, StoreError>;
    async fn list_all_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// Atomically locks the node-pool's sentinel row, computes the lowest
    /// free address via `crate::ipam::first_free`, and inserts the row.
    /// Fails with `StoreError::PoolExhausted` or `StoreError::HostnameConflict`.
    async fn insert_node_allocating_ip(
        &self,
        new_node: NewNode,
        pool: &Pool,
    ) -> Result<Node, StoreError>;

    /// Full replace, used for heartbeat updates, status transitions, and
    /// trust-score writes.
    async fn update_node(&self, node: &Node) -> Result<(), StoreError>;

    /// Deletes the node and implicitly frees its address (the address stops
    /// appearing in the taken-set computed from live rows).
    async fn delete_node(&self, id: Uuid) -> Result<Option<Node>, StoreError>;

    // --- Client devices ------------------------------------------------
    async fn count_active_devices_for_user(&self, user_id: &str) -> Result<u32, StoreError>;
    async fn find_device_by_name_for_user(
        &self,
        device_name: &str,
        user_id: &str,
    ) -> Result<Option<ClientDevice>, StoreError>;
    async fn find_device_by_token(&self, token: &str) -> Result<Option<ClientDevice>, StoreError>;
    async fn find_device_by_id(&self, id: Uuid) -> Result<Option<ClientDevice>, StoreError>;

    /// Atomically checks `CLIENT_MAX_DEVICES_PER_USER`, allocates a client
    /// sub-pool address, and inserts the row.
    async fn insert_client_device_allocating_ip(
        &self,
        new_device: NewClientDevice,
        pool: &Pool,
        max_devices_per_user: u32,
    ) -> Result<ClientDevice, StoreError>;

    async fn update_client_device(&self, device: &ClientDevice) -> Result<(), StoreError>;

    // --- IPAM accounting ------------------------------------------------
    /// All addresses currently held by any Node or ClientDevice row
    /// (including revoked devices — §9 IP release policy), restricted to the
    /// addresses that fall inside `pool`.
    async fn taken_addresses(&self, pool: &Pool) -> Result<HashSet<Ipv4Addr>, StoreError>;

    // --- Access policies (role-to-role) ---------------------------------
    async fn insert_policy(&self, policy: NewAccessPolicy) -> Result<AccessPolicy, StoreError>;
    async fn update_policy(&self, policy: &AccessPolicy) -> Result<(), StoreError>;
    async fn delete_policy(&self, id: Uuid) -> Result<(), StoreError>;
    async fn get_policy_by_name(&self, name: &str) -> Result<Option<AccessPolicy>, StoreError>;
    async fn get_policy_by_id(&self, id: Uuid) -> Result<Option<AccessPolicy>, StoreError>;
    async fn list_enabled_policies_sorted(&self) -> Result<Vec<AccessPolicy>, StoreError>;
    /// All policies regardless of `enabled`, for the admin listing surface —
    /// `list_enabled_policies_sorted` is reserved for ACL compilation (§4.3.1).
    async fn list_all_policies_sorted(&self) -> Result<Vec<AccessPolicy>, StoreError>;
    async fn current_config_version(&self) -> Result<i64, StoreError>;

    // --- Users / groups --------------------------------------------------
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;
    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError>;
    async fn group_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
    async fn get_group(&self, id: Uuid) -> Result<Option<Group>, StoreError>;
    async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>, StoreError>;
    async fn insert_group(&self, group: NewGroup) -> Result<Group, StoreError>;
    async fn insert_membership(&self, membership: NewMembership) -> Result<(), StoreError>;

    // --- User access policies --------------------------------------------
    async fn list_enabled_user_policies_for_resource(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<UserAccessPolicy>, StoreError>;
    async fn insert_user_access_policy(
        &self,
        policy: UserAccessPolicy,
    ) -> Result<UserAccessPolicy, StoreError>;

    // --- Append-only history / audit -------------------------------------
    async fn append_trust_history(&self, entry: TrustHistoryEntry) -> Result<(), StoreError>;
    async fn trust_history_since(
        &self,
        node_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrustHistoryEntry>, StoreError>;
    async fn append_node_history(&self, entry: NodeHistoryEntry) -> Result<(), StoreError>;
    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StoreError>;
}

/// Inputs to `insert_policy`, mirrors `NewNode`/`NewClientDevice`.
#[derive(Debug, Clone)]
pub struct NewAccessPolicy {
    pub name: String,
    pub src_role: String,
    pub dst_role: String,
    pub port: u16,
    pub protocol: Protocol,
    pub action: RuleAction,
    pub priority: u16,
    pub enabled: bool,
}
