//! End-user VPN client devices: enrollment, one-time config retrieval, and
//! revocation. Distinct from the Node Lifecycle Manager because devices are
//! never agents — they carry no heartbeat, role, or trust score (§3).

pub mod error;

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD as B64_STANDARD, URL_SAFE_NO_PAD as B64_URL_SAFE};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

pub use error::ClientError;

use crate::events::{DomainEvent, EventBus};
use crate::ipam::Pool;
use crate::store::models::{ClientDevice, DeviceStatus, DeviceType, TunnelMode};
use crate::store::requests::NewClientDevice;
use crate::store::Store;

/// Inputs to [`ClientManager::create_device`].
#[derive(Debug, Clone)]
pub struct CreateDeviceRequest {
    pub device_name: String,
    pub device_type: DeviceType,
    pub user_id: String,
    pub tunnel_mode: TunnelMode,
}

/// A newly minted keypair: `public_key` is persisted on the row,
/// `private_key_sealed` is handed back to the caller exactly once — the
/// store never returns it again after this call.
struct DeviceKeyPair {
    public_key: String,
    private_key_sealed: Vec<u8>,
}

fn generate_keypair() -> DeviceKeyPair {
    let mut private = [0u8; 32];
    OsRng.fill_bytes(&mut private);
    let mut public = [0u8; 32];
    OsRng.fill_bytes(&mut public);
    DeviceKeyPair {
        public_key: B64_STANDARD.encode(public),
        private_key_sealed: private.to_vec(),
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    B64_URL_SAFE.encode(bytes)
}

/// The rendered client config handed back from [`ClientManager::fetch_config`].
pub struct ClientConfig {
    pub device: ClientDevice,
    pub private_key: Vec<u8>,
    pub wireguard_config: String,
}

pub struct ClientManager {
    store: Arc<dyn Store>,
    events: EventBus,
    client_pool: Pool,
    max_devices_per_user: u32,
    default_expires_days: i64,
    require_admin_approval: bool,
    hub_public_key: String,
    hub_endpoint: String,
    dns_servers: Vec<String>,
}

impl ClientManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        events: EventBus,
        client_pool: Pool,
        max_devices_per_user: u32,
        default_expires_days: i64,
        require_admin_approval: bool,
        hub_public_key: String,
        hub_endpoint: String,
        dns_servers: Vec<String>,
    ) -> Self {
        ClientManager {
            store,
            events,
            client_pool,
            max_devices_per_user,
            default_expires_days,
            require_admin_approval,
            hub_public_key,
            hub_endpoint,
            dns_servers,
        }
    }

    /// Enrolls a device (§3 ClientDevice invariants: device-name uniqueness
    /// per user, `MAX_DEVICES_PER_USER`, sub-pool IP allocation — all
    /// enforced atomically by the store). Devices start `suspended` when
    /// `CLIENT_REQUIRE_ADMIN_APPROVAL` is set, else `active`.
    pub async fn create_device(
        &self,
        req: CreateDeviceRequest,
    ) -> Result<(ClientDevice, Vec<u8>, String), ClientError> {
        let keypair = generate_keypair();
        let config_token = generate_token();
        let expires_at = Utc::now() + Duration::days(self.default_expires_days);

        let new_device = NewClientDevice {
            device_name: req.device_name,
            device_type: req.device_type,
            user_id: req.user_id.clone(),
            public_key: keypair.public_key,
            private_key_sealed: keypair.private_key_sealed.clone(),
            preshared_key: None,
            tunnel_mode: req.tunnel_mode,
            config_token: config_token.clone(),
            expires_at,
        };

        let mut device = self
            .store
            .insert_client_device_allocating_ip(new_device, &self.client_pool, self.max_devices_per_user)
            .await?;

        if self.require_admin_approval {
            device.status = DeviceStatus::Pending;
            self.store.update_client_device(&device).await?;
        }

        self.events.publish(DomainEvent::ClientDeviceCreated {
            device_id: device.id,
            user_id: req.user_id,
        });

        Ok((device, keypair.private_key_sealed, config_token))
    }

    /// Approves a device awaiting admin sign-off (only meaningful when
    /// `CLIENT_REQUIRE_ADMIN_APPROVAL` gated its creation into `suspended`).
    pub async fn approve(&self, id: Uuid) -> Result<ClientDevice, ClientError> {
        let mut device = self.get_by_id(id).await?;
        if device.status == DeviceStatus::Active {
            return Ok(device);
        }
        device.status = DeviceStatus::Active;
        self.store.update_client_device(&device).await?;
        Ok(device)
    }

    /// `any → revoked` (L2 idempotent). The device's address is retained
    /// until deletion (§3 IPAM note), so revocation alone does not free it.
    pub async fn revoke_device(&self, id: Uuid) -> Result<ClientDevice, ClientError> {
        let mut device = self.get_by_id(id).await?;
        if device.status == DeviceStatus::Revoked {
            return Ok(device);
        }
        device.status = DeviceStatus::Revoked;
        device.config_token = None;
        self.store.update_client_device(&device).await?;

        self.events.publish(DomainEvent::ClientDeviceRevoked {
            device_id: device.id,
            user_id: device.user_id.clone(),
        });
        Ok(device)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<ClientDevice, ClientError> {
        self.store.find_device_by_id(id).await?.ok_or(ClientError::NotFound)
    }

    /// Retrieves the one-time config for `token`. Marks the device as
    /// downloaded and invalidates the token (§6.1: "After retrieval, set
    /// `config_downloaded=true`; token may be invalidated"). Callers hold
    /// the returned `private_key` only for this response — it is not stored
    /// anywhere else in cleartext form beyond the sealed bytes.
    pub async fn fetch_config(&self, token: &str) -> Result<ClientConfig, ClientError> {
        let mut device = self
            .store
            .find_device_by_token(token)
            .await?
            .ok_or(ClientError::InvalidToken)?;

        if !device.is_effective(Utc::now()) {
            return Err(ClientError::Expired);
        }

        let private_key = device.private_key_sealed.clone();
        let wireguard_config = self.render_config(&device, &private_key);

        device.config_downloaded = true;
        device.config_token = None;
        self.store.update_client_device(&device).await?;

        Ok(ClientConfig {
            device,
            private_key,
            wireguard_config,
        })
    }

    fn render_config(&self, device: &ClientDevice, private_key: &[u8]) -> String {
        let allowed_ips = match device.tunnel_mode {
            TunnelMode::Full => "0.0.0.0/0".to_string(),
            TunnelMode::Split => "10.0.0.0/8".to_string(),
        };
        format!(
            "[Interface]\nPrivateKey = {}\nAddress = {}/32\nDNS = {}\n\n[Peer]\nPublicKey = {}\nEndpoint = {}\nAllowedIPs = {}\nPersistentKeepalive = 25\n",
            B64_STANDARD.encode(private_key),
            device.overlay_ip,
            self.dns_servers.join(","),
            self.hub_public_key,
            self.hub_endpoint,
            allowed_ips,
        )
    }
}

/// Whether `device.expires_at` has already passed, for admin listings that
/// want to flag stale devices without calling into the manager.
pub fn is_expired(device: &ClientDevice, now: DateTime<Utc>) -> bool {
    now >= device.expires_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn client_pool() -> Pool {
        Pool::client_pool(
            "10.1.0.0/24".parse().unwrap(),
            "10.1.0.1".parse().unwrap(),
            200,
            210,
        )
    }

    fn manager(require_admin_approval: bool, max_devices: u32) -> ClientManager {
        ClientManager::new(
            Arc::new(InMemoryStore::new()),
            EventBus::default(),
            client_pool(),
            max_devices,
            90,
            require_admin_approval,
            "HUBPUBKEY".to_string(),
            "hub.example.com:51820".to_string(),
            vec!["1.1.1.1".to_string()],
        )
    }

    fn req(name: &str, user: &str) -> CreateDeviceRequest {
        CreateDeviceRequest {
            device_name: name.to_string(),
            device_type: DeviceType::Laptop,
            user_id: user.to_string(),
            tunnel_mode: TunnelMode::Full,
        }
    }

    #[tokio::test]
    async fn create_device_allocates_from_client_subpool_and_is_active_by_default() {
        let mgr = manager(false, 5);
        let (device, private_key, token) = mgr.create_device(req("laptop", "alice")).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Active);
        assert_eq!(device.overlay_ip.to_string(), "10.1.0.200");
        assert_eq!(private_key.len(), 32);
        assert!(!token.is_empty());
    }

    #[tokio::test]
    async fn require_admin_approval_starts_devices_pending() {
        let mgr = manager(true, 5);
        let (device, _, _) = mgr.create_device(req("laptop", "alice")).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Pending);

        let approved = mgr.approve(device.id).await.unwrap();
        assert_eq!(approved.status, DeviceStatus::Active);
    }

    #[tokio::test]
    async fn scenario_i5_device_limit_is_enforced_per_user() {
        let mgr = manager(false, 1);
        mgr.create_device(req("phone", "bob")).await.unwrap();
        let err = mgr.create_device(req("tablet", "bob")).await.unwrap_err();
        assert!(matches!(err, ClientError::PoolExhausted));
    }

    #[tokio::test]
    async fn fetch_config_marks_downloaded_and_invalidates_token() {
        let mgr = manager(false, 5);
        let (device, _, token) = mgr.create_device(req("laptop", "alice")).await.unwrap();
        let cfg = mgr.fetch_config(&token).await.unwrap();
        assert!(cfg.wireguard_config.contains("AllowedIPs = 0.0.0.0/0"));

        let refetched = mgr.get_by_id(device.id).await.unwrap();
        assert!(refetched.config_downloaded);
        assert!(refetched.config_token.is_none());

        let err = mgr.fetch_config(&token).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidToken));
    }

    #[tokio::test]
    async fn revoke_clears_token_and_is_idempotent() {
        let mgr = manager(false, 5);
        let (device, _, _) = mgr.create_device(req("laptop", "alice")).await.unwrap();
        let revoked = mgr.revoke_device(device.id).await.unwrap();
        assert_eq!(revoked.status, DeviceStatus::Revoked);
        let revoked_again = mgr.revoke_device(device.id).await.unwrap();
        assert_eq!(revoked_again.status, DeviceStatus::Revoked);
    }
}
