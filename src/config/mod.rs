pub mod error;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use error::ConfigError;

/// All recognized configuration knobs (§6 "Configuration surface") plus the
/// admin secret and timing hints returned to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// `OVERLAY_NETWORK` — IPAM scope for node addresses.
    pub overlay_network: Ipv4Net,
    /// `OVERLAY_GATEWAY` — reserved gateway address within `overlay_network`.
    pub overlay_gateway: Ipv4Addr,

    /// `HUB_PUBLIC_KEY` — returned in every spoke's peer list.
    pub hub_public_key: String,
    /// `HUB_ENDPOINT` — returned in every spoke's peer list.
    pub hub_endpoint: Option<String>,

    /// `DNS_SERVERS` — echoed in compiled agent config.
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,

    /// `CLIENT_IP_POOL_START` — last octet of the first client-pool host.
    pub client_ip_pool_start: u8,
    /// `CLIENT_IP_POOL_END` — last octet of the last client-pool host.
    pub client_ip_pool_end: u8,
    /// `CLIENT_MAX_DEVICES_PER_USER`.
    pub client_max_devices_per_user: u32,
    /// `CLIENT_DEFAULT_EXPIRES_DAYS`.
    pub client_default_expires_days: i64,
    /// `CLIENT_REQUIRE_ADMIN_APPROVAL`.
    #[serde(default)]
    pub client_require_admin_approval: bool,

    /// `AUTO_APPROVE_ALL` — when true every registering role is auto-approved.
    #[serde(default)]
    pub auto_approve_all: bool,
    /// `AUTO_APPROVE_ROLES` — roles auto-approved even when `auto_approve_all` is false.
    #[serde(default)]
    pub auto_approve_roles: HashSet<String>,

    /// `HEARTBEAT_INTERVAL` (seconds) — timing hint returned to agents.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// `CONFIG_SYNC_INTERVAL` (seconds) — timing hint returned to agents.
    #[serde(default = "default_config_sync_interval_secs")]
    pub config_sync_interval_secs: u64,
    /// `NODE_TIMEOUT_MINUTES` — used by the behavior component of trust scoring
    /// callers and by any offline-node reconciliation job.
    #[serde(default = "default_node_timeout_minutes")]
    pub node_timeout_minutes: u64,

    /// `ADMIN_SECRET` — admin gate. Loaded from the `ADMIN_SECRET` environment
    /// variable when set, overriding any value present in the file (secrets do
    /// not belong in a checked-in config file).
    #[serde(default)]
    pub admin_secret: String,

    /// `DATABASE_URL` — connection string for the transactional store.
    /// Loaded from the `DATABASE_URL` environment variable when set.
    #[serde(default)]
    pub database_url: String,

    /// Address the HTTP API binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_config_sync_interval_secs() -> u64 {
    60
}
fn default_node_timeout_minutes() -> u64 {
    10
}
fn default_bind_address() -> String {
    "0.0.0.0:8443".to_string()
}

impl ControllerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides for the two secrets that should never live in a checked-in
    /// file: `ADMIN_SECRET` and `DATABASE_URL`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let mut config: ControllerConfig = serde_yaml::from_reader(file)?;

        if let Ok(secret) = std::env::var("ADMIN_SECRET") {
            config.admin_secret = secret;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_secret.is_empty() {
            return Err(ConfigError::MissingAdminSecret);
        }
        if self.database_url.is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if !self.overlay_network.contains(&self.overlay_gateway) {
            return Err(ConfigError::GatewayOutsideNetwork);
        }
        if self.client_ip_pool_start > self.client_ip_pool_end {
            return Err(ConfigError::InvalidClientPool);
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn config_sync_interval(&self) -> Duration {
        Duration::from_secs(self.config_sync_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_yaml() -> &'static str {
        r#"
overlay_network: "10.0.0.0/24"
overlay_gateway: "10.0.0.1"
hub_public_key: "hub-pubkey=="
hub_endpoint: "hub.example.com:51820"
client_ip_pool_start: 200
client_ip_pool_end: 250
client_max_devices_per_user: 5
client_default_expires_days: 90
auto_approve_roles: ["app"]
auto_approve_all: true
"#
    }

    #[test]
    fn loads_and_validates_with_env_secrets() {
        std::env::set_var("ADMIN_SECRET", "s3cret");
        std::env::set_var("DATABASE_URL", "postgres://localhost/overlay");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_yaml().as_bytes()).unwrap();

        let config = ControllerConfig::load(file.path()).unwrap();
        assert_eq!(config.admin_secret, "s3cret");
        assert_eq!(config.client_ip_pool_start, 200);
        assert!(config.auto_approve_all);

        std::env::remove_var("ADMIN_SECRET");
        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    fn rejects_gateway_outside_network() {
        std::env::set_var("ADMIN_SECRET", "s3cret");
        std::env::set_var("DATABASE_URL", "postgres://localhost/overlay");

        let yaml = sample_yaml().replace("10.0.0.1", "10.0.1.1");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let err = ControllerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::GatewayOutsideNetwork));

        std::env::remove_var("ADMIN_SECRET");
        std::env::remove_var("DATABASE_URL");
    }
}
