//! The overlay driver capability (§4.5, §9 "Overlay driver as capability"):
//! abstracted behind a trait so tests substitute an in-memory fake recording
//! `(op, public_key, allowed_ips)` calls instead of touching a real
//! WireGuard-style interface.

pub mod error;
pub mod memory;

use async_trait::async_trait;

pub use error::DriverError;

#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: String,
    pub latest_handshake: Option<chrono::DateTime<chrono::Utc>>,
}

/// All operations are idempotent; errors are reported to the caller but
/// never abort a lifecycle transition — the next registration or heartbeat
/// reconciles drift (§4.5).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OverlayDriver: Send + Sync {
    async fn is_interface_up(&self) -> Result<bool, DriverError>;
    async fn add_peer(&self, public_key: &str, allowed_ips: &str) -> Result<(), DriverError>;
    async fn remove_peer(&self, public_key: &str) -> Result<(), DriverError>;
    async fn peer_exists(&self, public_key: &str) -> Result<bool, DriverError>;
    async fn list_peers(&self) -> Result<Vec<Peer>, DriverError>;
    async fn save(&self) -> Result<(), DriverError>;
}
