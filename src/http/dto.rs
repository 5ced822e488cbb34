//! Wire shapes for the `/api/v1` surface (§6). Kept separate from
//! `store::models` so a column rename never has to ripple through the HTTP
//! contract, and so optional/derived response fields (like `is_new`) don't
//! leak into the persisted entity.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

use crate::ipam::PoolStats;
use crate::policy::{AclRule, Peer};
use crate::store::models::{
    ClientDevice, DeviceStatus, DeviceType, Node, NodeStatus, OsInfo, Protocol, RiskLevel, RuleAction, TunnelMode,
};
use crate::trust::{SecuritySummary, TrustAction};

// --- Agent surface -------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterRequestDto {
    pub hostname: String,
    pub role: String,
    pub public_key: String,
    pub description: Option<String>,
    pub agent_version: Option<String>,
    pub os_info: Option<OsInfo>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponseDto {
    pub node_id: Uuid,
    pub hostname: String,
    pub overlay_ip: Option<Ipv4Net>,
    pub status: NodeStatus,
    pub config_version: i64,
    pub is_new: bool,
}

impl RegisterResponseDto {
    pub fn from(node: &Node, is_new: bool) -> Self {
        RegisterResponseDto {
            node_id: node.id,
            hostname: node.hostname.clone(),
            overlay_ip: node.overlay_ip,
            status: node.status,
            config_version: node.config_version,
            is_new,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentConfigQuery {
    pub public_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NodeConfigResponseDto {
    pub peers: Vec<Peer>,
    pub acl_rules: Vec<AclRule>,
    pub config_version: i64,
    pub generated_at: DateTime<Utc>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub heartbeat_interval_secs: u64,
    pub config_sync_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct SecuritySummaryDto {
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub risk_factors: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatMetricsDto {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub disk_percent: f64,
    #[serde(default)]
    pub connections_total: u32,
    #[serde(default)]
    pub connections_time_wait: u32,
    #[serde(default)]
    pub security_events: Option<SecuritySummaryDto>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequestDto {
    pub public_key: String,
    pub agent_version: Option<String>,
    #[serde(default)]
    pub metrics: HeartbeatMetricsDto,
    /// The agent's last-known `config_version`, if the transport provides
    /// one. `config_changed` in the response is a hint derived from this,
    /// not an authoritative push (§9 Open Question a).
    #[serde(default)]
    pub known_config_version: Option<i64>,
}

impl From<SecuritySummaryDto> for SecuritySummary {
    fn from(dto: SecuritySummaryDto) -> Self {
        SecuritySummary {
            risk_level: dto.risk_level,
            risk_factors: dto.risk_factors,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponseDto {
    /// A hint, not a guarantee — computed by comparing the caller-reported
    /// `config_version` against the node's current one (§9 Open Question a).
    pub config_changed: bool,
    pub current_config_version: i64,
    pub trust_score: f64,
    pub risk_level: RiskLevel,
    pub action_taken: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NodeStatusResponseDto {
    pub hostname: String,
    pub status: NodeStatus,
    pub trust_score: f64,
    pub risk_level: RiskLevel,
    pub last_seen: Option<DateTime<Utc>>,
    pub overlay_ip: Option<Ipv4Net>,
}

impl From<&Node> for NodeStatusResponseDto {
    fn from(node: &Node) -> Self {
        NodeStatusResponseDto {
            hostname: node.hostname.clone(),
            status: node.status,
            trust_score: node.trust_score,
            risk_level: node.risk_level,
            last_seen: node.last_seen,
            overlay_ip: node.overlay_ip,
        }
    }
}

// --- Admin: nodes ----------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct NodeResponseDto {
    pub id: Uuid,
    pub hostname: String,
    pub role: String,
    pub public_key: String,
    pub overlay_ip: Option<Ipv4Net>,
    pub real_ip: Option<String>,
    pub status: NodeStatus,
    pub is_approved: bool,
    pub config_version: i64,
    pub trust_score: f64,
    pub risk_level: RiskLevel,
    pub description: Option<String>,
    pub agent_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<&Node> for NodeResponseDto {
    fn from(node: &Node) -> Self {
        NodeResponseDto {
            id: node.id,
            hostname: node.hostname.clone(),
            role: node.role.clone(),
            public_key: node.public_key.clone(),
            overlay_ip: node.overlay_ip,
            real_ip: node.real_ip.clone(),
            status: node.status,
            is_approved: node.is_approved,
            config_version: node.config_version,
            trust_score: node.trust_score,
            risk_level: node.risk_level,
            description: node.description.clone(),
            agent_version: node.agent_version.clone(),
            created_at: node.created_at,
            last_seen: node.last_seen,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SuspendRequestDto {
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "admin action".to_string()
}

// --- Admin: role-to-role policies -------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequestDto {
    pub name: String,
    pub src_role: String,
    pub dst_role: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_action")]
    pub action: RuleAction,
    #[serde(default = "default_priority")]
    pub priority: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}
fn default_action() -> RuleAction {
    RuleAction::Accept
}
fn default_priority() -> u16 {
    100
}
fn default_enabled() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct PolicyResponseDto {
    pub id: Uuid,
    pub name: String,
    pub src_role: String,
    pub dst_role: String,
    pub port: u16,
    pub protocol: Protocol,
    pub action: RuleAction,
    pub priority: u16,
    pub enabled: bool,
}

impl From<&crate::store::models::AccessPolicy> for PolicyResponseDto {
    fn from(p: &crate::store::models::AccessPolicy) -> Self {
        PolicyResponseDto {
            id: p.id,
            name: p.name.clone(),
            src_role: p.src_role.clone(),
            dst_role: p.dst_role.clone(),
            port: p.port,
            protocol: p.protocol,
            action: p.action,
            priority: p.priority,
            enabled: p.enabled,
        }
    }
}

// --- Admin: network -------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct NetworkStatsResponseDto {
    pub node_pool: PoolStats,
    pub client_pool: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct AllocationDto {
    pub ip_address: Ipv4Addr,
    pub kind: &'static str,
    pub owner_id: Uuid,
    pub owner_name: String,
}

// --- Client devices --------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequestDto {
    pub device_name: String,
    pub device_type: DeviceType,
    pub user_id: String,
    #[serde(default = "default_tunnel_mode")]
    pub tunnel_mode: TunnelMode,
}

fn default_tunnel_mode() -> TunnelMode {
    TunnelMode::Full
}

#[derive(Debug, Serialize)]
pub struct CreateDeviceResponseDto {
    pub device_id: Uuid,
    pub overlay_ip: Ipv4Addr,
    pub config_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ClientConfigResponseDto {
    pub wireguard_config: String,
    pub qr_code_base64: Option<String>,
    pub device_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DeviceResponseDto {
    pub id: Uuid,
    pub device_name: String,
    pub device_type: DeviceType,
    pub user_id: String,
    pub overlay_ip: Ipv4Addr,
    pub tunnel_mode: TunnelMode,
    pub status: DeviceStatus,
    pub config_downloaded: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&ClientDevice> for DeviceResponseDto {
    fn from(d: &ClientDevice) -> Self {
        DeviceResponseDto {
            id: d.id,
            device_name: d.device_name.clone(),
            device_type: d.device_type,
            user_id: d.user_id.clone(),
            overlay_ip: d.overlay_ip,
            tunnel_mode: d.tunnel_mode,
            status: d.status,
            config_downloaded: d.config_downloaded,
            expires_at: d.expires_at,
            created_at: d.created_at,
        }
    }
}

pub fn trust_action_label(action: TrustAction) -> Option<String> {
    match action {
        TrustAction::None => None,
        other => Some(other.as_str().to_string()),
    }
}
