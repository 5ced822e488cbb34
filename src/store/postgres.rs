//! The real `Store` backend: Postgres via `sqlx`, using runtime-checked
//! queries (`sqlx::query`/`query_as` with `.bind(...)`) rather than the
//! compile-time `query!`/`query_as!` macros, since there is no live database
//! to validate against at build time.
//!
//! Enum and IP columns are `TEXT` (see `migrations/0001_init.sql`), so every
//! row is mapped by hand here rather than via `#[derive(sqlx::Type)]` or
//! `#[derive(sqlx::FromRow)]` — this is the one place that needs to agree
//! with the schema, and it is easier to audit that way than to rely on derive
//! macros matching Postgres type identifiers exactly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use uuid::Uuid;

use super::error::StoreError;
use super::models::*;
use super::requests::*;
use super::{NewAccessPolicy, Store};
use crate::ipam::{first_free, Pool};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn bad_value(column: &str, value: &str) -> StoreError {
    StoreError::Database(format!("unexpected value `{value}` in column `{column}`"))
}

fn parse_addr(value: &str, column: &str) -> Result<Ipv4Addr, StoreError> {
    value.parse().map_err(|_| bad_value(column, value))
}

fn json_to<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    column: &str,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Database(format!("{column}: {e}")))
}

fn node_from_row(row: PgRow) -> Result<Node, StoreError> {
    let overlay_ip: Option<String> = row.try_get("overlay_ip")?;
    let status: String = row.try_get("status")?;
    let risk_level: String = row.try_get("risk_level")?;
    let trust_factors: serde_json::Value = row.try_get("trust_factors")?;
    let os_info: Option<serde_json::Value> = row.try_get("os_info")?;
    let listen_port: Option<i32> = row.try_get("listen_port")?;

    Ok(Node {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        role: row.try_get("role")?,
        public_key: row.try_get("public_key")?,
        overlay_ip: overlay_ip
            .map(|s| parse_addr(&s, "overlay_ip"))
            .transpose()?
            .map(|a| ipnet::Ipv4Net::new(a, 32).expect("/32 is always valid")),
        real_ip: row.try_get("real_ip")?,
        listen_port: listen_port.map(|p| p as u16),
        status: NodeStatus::parse(&status).ok_or_else(|| bad_value("status", &status))?,
        is_approved: row.try_get("is_approved")?,
        config_version: row.try_get("config_version")?,
        trust_score: row.try_get("trust_score")?,
        risk_level: RiskLevel::parse(&risk_level).ok_or_else(|| bad_value("risk_level", &risk_level))?,
        trust_factors: json_to(trust_factors, "trust_factors")?,
        last_trust_update: row.try_get("last_trust_update")?,
        description: row.try_get("description")?,
        agent_version: row.try_get("agent_version")?,
        os_info: os_info.map(|v| json_to(v, "os_info")).transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn device_from_row(row: PgRow) -> Result<ClientDevice, StoreError> {
    let device_type: String = row.try_get("device_type")?;
    let tunnel_mode: String = row.try_get("tunnel_mode")?;
    let status: String = row.try_get("status")?;
    let overlay_ip: String = row.try_get("overlay_ip")?;

    Ok(ClientDevice {
        id: row.try_get("id")?,
        device_name: row.try_get("device_name")?,
        device_type: DeviceType::parse(&device_type).ok_or_else(|| bad_value("device_type", &device_type))?,
        user_id: row.try_get("user_id")?,
        public_key: row.try_get("public_key")?,
        private_key_sealed: row.try_get("private_key_sealed")?,
        preshared_key: row.try_get("preshared_key")?,
        overlay_ip: parse_addr(&overlay_ip, "overlay_ip")?,
        tunnel_mode: TunnelMode::parse(&tunnel_mode).ok_or_else(|| bad_value("tunnel_mode", &tunnel_mode))?,
        status: DeviceStatus::parse(&status).ok_or_else(|| bad_value("status", &status))?,
        config_token: row.try_get("config_token")?,
        config_downloaded: row.try_get("config_downloaded")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn policy_from_row(row: PgRow) -> Result<AccessPolicy, StoreError> {
    let protocol: String = row.try_get("protocol")?;
    let action: String = row.try_get("action")?;
    let port: i32 = row.try_get("port")?;
    let priority: i32 = row.try_get("priority")?;

    Ok(AccessPolicy {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        src_role: row.try_get("src_role")?,
        dst_role: row.try_get("dst_role")?,
        port: port as u16,
        protocol: Protocol::parse(&protocol).ok_or_else(|| bad_value("protocol", &protocol))?,
        action: RuleAction::parse(&action).ok_or_else(|| bad_value("action", &action))?,
        priority: priority as u16,
        enabled: row.try_get("enabled")?,
    })
}

fn user_from_row(row: PgRow) -> Result<User, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(User {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        status: UserStatus::parse(&status).ok_or_else(|| bad_value("status", &status))?,
        attributes: row.try_get("attributes")?,
    })
}

fn group_from_row(row: PgRow) -> Result<Group, StoreError> {
    Ok(Group {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        parent_group_id: row.try_get("parent_group_id")?,
    })
}

fn user_access_policy_from_row(row: PgRow) -> Result<UserAccessPolicy, StoreError> {
    let subject_type: String = row.try_get("subject_type")?;
    let resource_type: String = row.try_get("resource_type")?;
    let action: String = row.try_get("action")?;
    let conditions: Option<serde_json::Value> = row.try_get("conditions")?;
    let priority: i32 = row.try_get("priority")?;

    Ok(UserAccessPolicy {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        subject_type: SubjectType::parse(&subject_type).ok_or_else(|| bad_value("subject_type", &subject_type))?,
        subject_id: row.try_get("subject_id")?,
        resource_type: ResourceType::parse(&resource_type)
            .ok_or_else(|| bad_value("resource_type", &resource_type))?,
        resource_value: row.try_get("resource_value")?,
        action: PolicyDecision::parse(&action).ok_or_else(|| bad_value("action", &action))?,
        conditions: conditions.map(|v| json_to(v, "conditions")).transpose()?,
        priority: priority as u16,
        enabled: row.try_get("enabled")?,
        valid_from: row.try_get("valid_from")?,
        valid_until: row.try_get("valid_until")?,
    })
}

fn trust_history_from_row(row: PgRow) -> Result<TrustHistoryEntry, StoreError> {
    let risk_level: String = row.try_get("risk_level")?;
    let risk_factors: serde_json::Value = row.try_get("risk_factors")?;
    let metrics_snapshot: serde_json::Value = row.try_get("metrics_snapshot")?;

    Ok(TrustHistoryEntry {
        id: row.try_get("id")?,
        node_id: row.try_get("node_id")?,
        hostname: row.try_get("hostname")?,
        trust_score: row.try_get("trust_score")?,
        previous_score: row.try_get("previous_score")?,
        risk_level: RiskLevel::parse(&risk_level).ok_or_else(|| bad_value("risk_level", &risk_level))?,
        risk_factors: json_to(risk_factors, "risk_factors")?,
        device_health_score: row.try_get("device_health_score")?,
        security_score: row.try_get("security_score")?,
        behavior_score: row.try_get("behavior_score")?,
        role_score: row.try_get("role_score")?,
        metrics_snapshot: json_to(metrics_snapshot, "metrics_snapshot")?,
        action_taken: row.try_get("action_taken")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn find_node_by_public_key(&self, public_key: &str) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE public_key = $1")
            .bind(public_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(node_from_row).transpose()
    }

    async fn find_node_by_hostname(&self, hostname: &str) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE hostname = $1")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        row.map(node_from_row).transpose()
    }

    async fn find_node_by_id(&self, id: Uuid) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(node_from_row).transpose()
    }

    async fn list_active_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(node_from_row).collect()
    }

    async fn list_all_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query("SELECT * FROM nodes").fetch_all(&self.pool).await?;
        rows.into_iter().map(node_from_row).collect()
    }

    async fn insert_node_allocating_ip(
        &self,
        new_node: NewNode,
        pool: &Pool,
    ) -> Result<Node, StoreError> {
        let mut tx = self.pool.begin().await?;

        if sqlx::query("SELECT 1 FROM nodes WHERE hostname = $1")
            .bind(&new_node.hostname)
            .fetch_optional(&mut *tx)
            .await?
            .is_some()
        {
            return Err(StoreError::HostnameConflict(new_node.hostname));
        }

        // Serialize concurrent allocations from this pool (§5).
        sqlx::query("SELECT 1 FROM ip_pool_locks WHERE pool_name = 'node_pool' FOR UPDATE")
            .fetch_one(&mut *tx)
            .await?;

        let node_ips: Vec<String> = sqlx::query_scalar("SELECT overlay_ip FROM nodes WHERE overlay_ip IS NOT NULL")
            .fetch_all(&mut *tx)
            .await?;
        let device_ips: Vec<String> = sqlx::query_scalar("SELECT overlay_ip FROM client_devices")
            .fetch_all(&mut *tx)
            .await?;
        let taken: HashSet<Ipv4Addr> = node_ips
            .iter()
            .chain(device_ips.iter())
            .filter_map(|s| s.parse().ok())
            .collect();
        let addr = first_free(pool, &taken).map_err(|_| StoreError::PoolExhausted)?;

        let (trust_score, risk_level, trust_factors) = new_node.initial_trust();
        let id = Uuid::new_v4();
        let trust_factors_json = serde_json::to_value(&trust_factors)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let os_info_json = new_node
            .os_info
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            "INSERT INTO nodes
                (id, hostname, role, public_key, overlay_ip, real_ip, status,
                 is_approved, config_version, trust_score, risk_level, trust_factors,
                 description, agent_version, os_info, last_seen)
             VALUES ($1,$2,$3,$4,$5,$6,$7,FALSE,
                     (SELECT config_version FROM controller_metadata WHERE id = 1),
                     $8,$9,$10,$11,$12,$13,now())
             RETURNING *",
        )
        .bind(id)
        .bind(&new_node.hostname)
        .bind(&new_node.role)
        .bind(&new_node.public_key)
        .bind(addr.to_string())
        .bind(&new_node.real_ip)
        .bind(new_node.status.as_str())
        .bind(trust_score)
        .bind(risk_level.as_str())
        .bind(trust_factors_json)
        .bind(&new_node.description)
        .bind(&new_node.agent_version)
        .bind(os_info_json)
        .fetch_one(&mut *tx)
        .await?;

        let node = node_from_row(row)?;
        tx.commit().await?;
        Ok(node)
    }

    async fn update_node(&self, node: &Node) -> Result<(), StoreError> {
        let trust_factors_json = serde_json::to_value(&node.trust_factors)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let os_info_json = node
            .os_info
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            "UPDATE nodes SET
                hostname = $2, role = $3, public_key = $4, overlay_ip = $5, real_ip = $6,
                listen_port = $7, status = $8, is_approved = $9, config_version = $10,
                trust_score = $11, risk_level = $12, trust_factors = $13,
                last_trust_update = $14, description = $15, agent_version = $16,
                os_info = $17, updated_at = now(), last_seen = $18
             WHERE id = $1",
        )
        .bind(node.id)
        .bind(&node.hostname)
        .bind(&node.role)
        .bind(&node.public_key)
        .bind(node.overlay_ip.map(|n| n.addr().to_string()))
        .bind(&node.real_ip)
        .bind(node.listen_port.map(|p| p as i32))
        .bind(node.status.as_str())
        .bind(node.is_approved)
        .bind(node.config_version)
        .bind(node.trust_score)
        .bind(node.risk_level.as_str())
        .bind(trust_factors_json)
        .bind(node.last_trust_update)
        .bind(&node.description)
        .bind(&node.agent_version)
        .bind(os_info_json)
        .bind(node.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_node(&self, id: Uuid) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("DELETE FROM nodes WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(node_from_row).transpose()
    }

    async fn count_active_devices_for_user(&self, user_id: &str) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM client_devices WHERE user_id = $1 AND status <> 'revoked'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn find_device_by_name_for_user(
        &self,
        device_name: &str,
        user_id: &str,
    ) -> Result<Option<ClientDevice>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM client_devices
             WHERE device_name = $1 AND user_id = $2 AND status <> 'revoked'",
        )
        .bind(device_name)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(device_from_row).transpose()
    }

    async fn find_device_by_token(&self, token: &str) -> Result<Option<ClientDevice>, StoreError> {
        let row = sqlx::query("SELECT * FROM client_devices WHERE config_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.map(device_from_row).transpose()
    }

    async fn find_device_by_id(&self, id: Uuid) -> Result<Option<ClientDevice>, StoreError> {
        let row = sqlx::query("SELECT * FROM client_devices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(device_from_row).transpose()
    }

    async fn insert_client_device_allocating_ip(
        &self,
        new_device: NewClientDevice,
        pool: &Pool,
        max_devices_per_user: u32,
    ) -> Result<ClientDevice, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT 1 FROM ip_pool_locks WHERE pool_name = 'client_pool' FOR UPDATE")
            .fetch_one(&mut *tx)
            .await?;

        let active_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM client_devices WHERE user_id = $1 AND status <> 'revoked'",
        )
        .bind(&new_device.user_id)
        .fetch_one(&mut *tx)
        .await?;
        if active_count as u32 >= max_devices_per_user {
            return Err(StoreError::PoolExhausted);
        }

        if sqlx::query(
            "SELECT 1 FROM client_devices WHERE device_name = $1 AND user_id = $2 AND status <> 'revoked'",
        )
        .bind(&new_device.device_name)
        .bind(&new_device.user_id)
        .fetch_optional(&mut *tx)
        .await?
        .is_some()
        {
            return Err(StoreError::DeviceNameExists(new_device.device_name));
        }

        let node_ips: Vec<String> = sqlx::query_scalar("SELECT overlay_ip FROM nodes WHERE overlay_ip IS NOT NULL")
            .fetch_all(&mut *tx)
            .await?;
        let device_ips: Vec<String> = sqlx::query_scalar("SELECT overlay_ip FROM client_devices")
            .fetch_all(&mut *tx)
            .await?;
        let taken: HashSet<Ipv4Addr> = node_ips
            .iter()
            .chain(device_ips.iter())
            .filter_map(|s| s.parse().ok())
            .collect();
        let addr = first_free(pool, &taken).map_err(|_| StoreError::PoolExhausted)?;

        let row = sqlx::query(
            "INSERT INTO client_devices
                (id, device_name, device_type, user_id, public_key, private_key_sealed,
                 preshared_key, overlay_ip, tunnel_mode, status, config_token,
                 config_downloaded, expires_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,'active',$10,FALSE,$11)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new_device.device_name)
        .bind(new_device.device_type.as_str())
        .bind(&new_device.user_id)
        .bind(&new_device.public_key)
        .bind(&new_device.private_key_sealed)
        .bind(&new_device.preshared_key)
        .bind(addr.to_string())
        .bind(new_device.tunnel_mode.as_str())
        .bind(&new_device.config_token)
        .bind(new_device.expires_at)
        .fetch_one(&mut *tx)
        .await?;

        let device = device_from_row(row)?;
        tx.commit().await?;
        Ok(device)
    }

    async fn update_client_device(&self, device: &ClientDevice) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE client_devices SET
                device_name = $2, device_type = $3, public_key = $4, preshared_key = $5,
                tunnel_mode = $6, status = $7, config_token = $8, config_downloaded = $9,
                expires_at = $10
             WHERE id = $1",
        )
        .bind(device.id)
        .bind(&device.device_name)
        .bind(device.device_type.as_str())
        .bind(&device.public_key)
        .bind(&device.preshared_key)
        .bind(device.tunnel_mode.as_str())
        .bind(device.status.as_str())
        .bind(&device.config_token)
        .bind(device.config_downloaded)
        .bind(device.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn taken_addresses(&self, pool: &Pool) -> Result<HashSet<Ipv4Addr>, StoreError> {
        let node_ips: Vec<String> = sqlx::query_scalar("SELECT overlay_ip FROM nodes WHERE overlay_ip IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        let device_ips: Vec<String> = sqlx::query_scalar("SELECT overlay_ip FROM client_devices")
            .fetch_all(&self.pool)
            .await?;
        Ok(node_ips
            .iter()
            .chain(device_ips.iter())
            .filter_map(|s| s.parse().ok())
            .filter(|addr| pool.network_cidr.contains(addr))
            .collect())
    }

    async fn insert_policy(&self, policy: NewAccessPolicy) -> Result<AccessPolicy, StoreError> {
        let mut tx = self.pool.begin().await?;
        if sqlx::query("SELECT 1 FROM access_policies WHERE name = $1")
            .bind(&policy.name)
            .fetch_optional(&mut *tx)
            .await?
            .is_some()
        {
            return Err(StoreError::PolicyExists(policy.name));
        }
        let row = sqlx::query(
            "INSERT INTO access_policies (id, name, src_role, dst_role, port, protocol, action, priority, enabled)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&policy.name)
        .bind(&policy.src_role)
        .bind(&policy.dst_role)
        .bind(policy.port as i32)
        .bind(policy.protocol.as_str())
        .bind(policy.action.as_str())
        .bind(policy.priority as i32)
        .bind(policy.enabled)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE controller_metadata SET config_version = config_version + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        let ap = policy_from_row(row)?;
        tx.commit().await?;
        Ok(ap)
    }

    async fn update_policy(&self, policy: &AccessPolicy) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE access_policies SET
                name = $2, src_role = $3, dst_role = $4, port = $5, protocol = $6,
                action = $7, priority = $8, enabled = $9
             WHERE id = $1",
        )
        .bind(policy.id)
        .bind(&policy.name)
        .bind(&policy.src_role)
        .bind(&policy.dst_role)
        .bind(policy.port as i32)
        .bind(policy.protocol.as_str())
        .bind(policy.action.as_str())
        .bind(policy.priority as i32)
        .bind(policy.enabled)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE controller_metadata SET config_version = config_version + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_policy(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM access_policies WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE controller_metadata SET config_version = config_version + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_policy_by_name(&self, name: &str) -> Result<Option<AccessPolicy>, StoreError> {
        let row = sqlx::query("SELECT * FROM access_policies WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(policy_from_row).transpose()
    }

    async fn get_policy_by_id(&self, id: Uuid) -> Result<Option<AccessPolicy>, StoreError> {
        let row = sqlx::query("SELECT * FROM access_policies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(policy_from_row).transpose()
    }

    async fn list_enabled_policies_sorted(&self) -> Result<Vec<AccessPolicy>, StoreError> {
        let rows = sqlx::query("SELECT * FROM access_policies WHERE enabled ORDER BY priority ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(policy_from_row).collect()
    }

    async fn list_all_policies_sorted(&self) -> Result<Vec<AccessPolicy>, StoreError> {
        let rows = sqlx::query("SELECT * FROM access_policies ORDER BY priority ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(policy_from_row).collect()
    }

    async fn current_config_version(&self) -> Result<i64, StoreError> {
        let version: i64 = sqlx::query_scalar("SELECT config_version FROM controller_metadata WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(user_from_row).transpose()
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query(
            "INSERT INTO users (id, user_id, email, status, attributes)
             VALUES ($1,$2,$3,'active',$4)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&user.user_id)
        .bind(&user.email)
        .bind(&user.attributes)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(row)
    }

    async fn group_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT group_id FROM user_group_memberships WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(group_from_row).transpose()
    }

    async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>, StoreError> {
        let row = sqlx::query("SELECT * FROM groups WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(group_from_row).transpose()
    }

    async fn insert_membership(&self, membership: NewMembership) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_group_memberships (user_id, group_id, role) VALUES ($1,$2,$3)
             ON CONFLICT (user_id, group_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(membership.user_id)
        .bind(membership.group_id)
        .bind(membership.role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_group(&self, group: NewGroup) -> Result<Group, StoreError> {
        // Reject an immediate two-hop cycle up front; deeper cycles are
        // caught by `policy::group_ancestors` refusing to terminate past a
        // bound (§9 "group hierarchy" design note).
        if let Some(parent_id) = group.parent_group_id {
            let parent_name: Option<String> = sqlx::query_scalar("SELECT name FROM groups WHERE id = $1")
                .bind(parent_id)
                .fetch_optional(&self.pool)
                .await?;
            if parent_name.as_deref() == Some(group.name.as_str()) {
                return Err(StoreError::GroupCycle);
            }
        }
        let row = sqlx::query(
            "INSERT INTO groups (id, name, parent_group_id) VALUES ($1,$2,$3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&group.name)
        .bind(group.parent_group_id)
        .fetch_one(&self.pool)
        .await?;
        group_from_row(row)
    }

    async fn list_enabled_user_policies_for_resource(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<UserAccessPolicy>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM user_access_policies WHERE enabled AND resource_type = $1 ORDER BY priority ASC",
        )
        .bind(resource_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(user_access_policy_from_row).collect()
    }

    async fn insert_user_access_policy(
        &self,
        policy: UserAccessPolicy,
    ) -> Result<UserAccessPolicy, StoreError> {
        let conditions_json = policy
            .conditions
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let row = sqlx::query(
            "INSERT INTO user_access_policies
                (id, name, subject_type, subject_id, resource_type, resource_value,
                 action, conditions, priority, enabled, valid_from, valid_until)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
             RETURNING *",
        )
        .bind(policy.id)
        .bind(&policy.name)
        .bind(policy.subject_type.as_str())
        .bind(policy.subject_id)
        .bind(policy.resource_type.as_str())
        .bind(&policy.resource_value)
        .bind(policy.action.as_str())
        .bind(conditions_json)
        .bind(policy.priority as i32)
        .bind(policy.enabled)
        .bind(policy.valid_from)
        .bind(policy.valid_until)
        .fetch_one(&self.pool)
        .await?;
        user_access_policy_from_row(row)
    }

    async fn append_trust_history(&self, entry: TrustHistoryEntry) -> Result<(), StoreError> {
        let risk_factors_json = serde_json::to_value(&entry.risk_factors)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let metrics_json = serde_json::to_value(&entry.metrics_snapshot)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::query(
            "INSERT INTO trust_history
                (id, node_id, hostname, trust_score, previous_score, risk_level, risk_factors,
                 device_health_score, security_score, behavior_score, role_score,
                 metrics_snapshot, action_taken)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
        )
        .bind(entry.id)
        .bind(entry.node_id)
        .bind(&entry.hostname)
        .bind(entry.trust_score)
        .bind(entry.previous_score)
        .bind(entry.risk_level.as_str())
        .bind(risk_factors_json)
        .bind(entry.device_health_score)
        .bind(entry.security_score)
        .bind(entry.behavior_score)
        .bind(entry.role_score)
        .bind(metrics_json)
        .bind(&entry.action_taken)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn trust_history_since(
        &self,
        node_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrustHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trust_history WHERE node_id = $1 AND created_at >= $2 ORDER BY created_at ASC",
        )
        .bind(node_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(trust_history_from_row).collect()
    }

    async fn append_node_history(&self, entry: NodeHistoryEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO node_history (id, node_id, hostname, transition, detail)
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(entry.id)
        .bind(entry.node_id)
        .bind(&entry.hostname)
        .bind(&entry.transition)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log (id, category, action, subject, detail, success)
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(entry.id)
        .bind(&entry.category)
        .bind(&entry.action)
        .bind(&entry.subject)
        .bind(&entry.detail)
        .bind(entry.success)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
