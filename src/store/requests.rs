//! Inputs to the `Store`'s atomic insert operations — distinct from the
//! persisted entities in `models` because they omit server-assigned fields
//! (id, timestamps, allocated IP).

use super::models::{DeviceType, NodeStatus, OsInfo, RiskLevel, TrustFactors, TunnelMode};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewNode {
    pub hostname: String,
    pub role: String,
    pub public_key: String,
    pub status: NodeStatus,
    pub description: Option<String>,
    pub agent_version: Option<String>,
    pub real_ip: Option<String>,
    pub os_info: Option<OsInfo>,
}

impl NewNode {
    pub fn initial_trust(&self) -> (f64, RiskLevel, TrustFactors) {
        (1.0, RiskLevel::Low, TrustFactors::default())
    }
}

#[derive(Debug, Clone)]
pub struct NewClientDevice {
    pub device_name: String,
    pub device_type: DeviceType,
    pub user_id: String,
    pub public_key: String,
    pub private_key_sealed: Vec<u8>,
    pub preshared_key: Option<String>,
    pub tunnel_mode: TunnelMode,
    pub config_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub parent_group_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_id: String,
    pub email: Option<String>,
    pub attributes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewMembership {
    pub user_id: Uuid,
    pub group_id: Uuid,
    pub role: super::models::GroupRole,
}
