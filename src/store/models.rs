//! Typed entities persisted by the [`Store`](super::Store). These are the
//! wire/storage shapes; HTTP DTOs live separately in `crate::http::dto` and are
//! mapped to/from these by the handlers.
//!
//! Enum fields are plain Rust enums with `as_str`/`parse` helpers rather than
//! `sqlx::Type` derives — `store::postgres` converts them to/from `TEXT`
//! columns explicitly, which keeps the schema portable and the conversions
//! visible at the one place that needs them.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

macro_rules! db_enum {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($wire => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Active,
    Suspended,
    Revoked,
}
db_enum!(NodeStatus {
    Pending => "pending",
    Active => "active",
    Suspended => "suspended",
    Revoked => "revoked",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}
db_enum!(RiskLevel {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Low
    }
}

/// The weighted breakdown behind a node's `trust_score` (§3.1) — given a
/// concrete type rather than stored as an opaque blob, since its shape (the
/// four weighted components) is fully known up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustFactors {
    pub role: f64,
    pub device_health: f64,
    pub behavior: f64,
    pub security: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsInfo {
    pub family: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub hostname: String,
    pub role: String,
    pub public_key: String,

    pub overlay_ip: Option<Ipv4Net>,
    pub real_ip: Option<String>,
    pub listen_port: Option<u16>,

    pub status: NodeStatus,
    pub is_approved: bool,
    pub config_version: i64,

    pub trust_score: f64,
    pub risk_level: RiskLevel,
    pub trust_factors: TrustFactors,
    pub last_trust_update: Option<DateTime<Utc>>,

    pub description: Option<String>,
    pub agent_version: Option<String>,
    pub os_info: Option<OsInfo>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Node {
    /// The overlay host address, `/32`, as required by `add_peer`'s
    /// `allowed_ips` argument (§4.2 step 1, §4.3.2).
    pub fn overlay_host_32(&self) -> Option<String> {
        self.overlay_ip.map(|net| format!("{}/32", net.addr()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Laptop,
    Desktop,
    Other,
}
db_enum!(DeviceType {
    Mobile => "mobile",
    Laptop => "laptop",
    Desktop => "desktop",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelMode {
    Full,
    Split,
}
db_enum!(TunnelMode {
    Full => "full",
    Split => "split",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Active,
    Suspended,
    Revoked,
}
db_enum!(DeviceStatus {
    Pending => "pending",
    Active => "active",
    Suspended => "suspended",
    Revoked => "revoked",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDevice {
    pub id: Uuid,
    pub device_name: String,
    pub device_type: DeviceType,
    pub user_id: String,
    pub public_key: String,
    pub private_key_sealed: Vec<u8>,
    pub preshared_key: Option<String>,
    pub overlay_ip: Ipv4Addr,
    pub tunnel_mode: TunnelMode,
    pub status: DeviceStatus,
    pub config_token: Option<String>,
    pub config_downloaded: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ClientDevice {
    /// A device is *effective* iff active and not past its expiry (§3).
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.status == DeviceStatus::Active && now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}
db_enum!(Protocol {
    Tcp => "tcp",
    Udp => "udp",
    Icmp => "icmp",
    Any => "any",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
    Log,
}
db_enum!(RuleAction {
    Accept => "ACCEPT",
    Drop => "DROP",
    Reject => "REJECT",
    Log => "LOG",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Disabled,
}
db_enum!(UserStatus {
    Active => "active",
    Disabled => "disabled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub user_id: String,
    pub email: Option<String>,
    pub status: UserStatus,
    /// Open-ended by design — stored as raw JSON bytes rather than given a
    /// schema.
    pub attributes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Member,
    Admin,
    Owner,
}
db_enum!(GroupRole {
    Member => "member",
    Admin => "admin",
    Owner => "owner",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub parent_group_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserGroupMembership {
    pub user_id: Uuid,
    pub group_id: Uuid,
    pub role: GroupRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    User,
    Group,
    All,
}
db_enum!(SubjectType {
    User => "user",
    Group => "group",
    All => "all",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Domain,
    IpRange,
    Zone,
    Service,
    UrlPattern,
}
db_enum!(ResourceType {
    Domain => "domain",
    IpRange => "ip_range",
    Zone => "zone",
    Service => "service",
    UrlPattern => "url_pattern",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    RequireMfa,
}
db_enum!(PolicyDecision {
    Allow => "allow",
    Deny => "deny",
    RequireMfa => "require_mfa",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// 0 = Monday .. 6 = Sunday, matching `chrono::Weekday::num_days_from_monday`.
    pub day_of_week: u8,
    pub start: chrono::NaiveTime,
    pub end: chrono::NaiveTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConditions {
    pub device_types: Option<Vec<DeviceType>>,
    pub time_windows: Option<Vec<TimeWindow>>,
    pub allowed_ips: Option<Vec<Ipv4Addr>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccessPolicy {
    pub id: Uuid,
    pub name: String,
    pub subject_type: SubjectType,
    pub subject_id: Option<Uuid>,
    pub resource_type: ResourceType,
    pub resource_value: String,
    pub action: PolicyDecision,
    pub conditions: Option<PolicyConditions>,
    pub priority: u16,
    pub enabled: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAllocation {
    pub network_cidr: Ipv4Net,
    pub ip_address: Ipv4Addr,
    pub node_id: Option<Uuid>,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub connections_total: u32,
    pub connections_time_wait: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustHistoryEntry {
    pub id: Uuid,
    pub node_id: Uuid,
    pub hostname: String,
    pub trust_score: f64,
    pub previous_score: f64,
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    pub device_health_score: f64,
    pub security_score: f64,
    pub behavior_score: f64,
    pub role_score: f64,
    pub metrics_snapshot: MetricsSnapshot,
    pub action_taken: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHistoryEntry {
    pub id: Uuid,
    pub node_id: Uuid,
    pub hostname: String,
    pub transition: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub category: String,
    pub action: String,
    pub subject: String,
    pub detail: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}
