//! In-memory fake overlay driver (§9): records every `(op, public_key,
//! allowed_ips)` call so tests can assert on peer-programming side effects
//! without a real overlay interface.

use async_trait::async_trait;
use std::sync::Mutex;

use super::{DriverError, OverlayDriver, Peer};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    AddPeer { public_key: String, allowed_ips: String },
    RemovePeer { public_key: String },
}

#[derive(Default)]
pub struct InMemoryOverlayDriver {
    calls: Mutex<Vec<RecordedOp>>,
    peers: Mutex<Vec<Peer>>,
}

impl InMemoryOverlayDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedOp> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OverlayDriver for InMemoryOverlayDriver {
    async fn is_interface_up(&self) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn add_peer(&self, public_key: &str, allowed_ips: &str) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(RecordedOp::AddPeer {
            public_key: public_key.to_string(),
            allowed_ips: allowed_ips.to_string(),
        });
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|p| p.public_key != public_key);
        peers.push(Peer {
            public_key: public_key.to_string(),
            endpoint: None,
            allowed_ips: allowed_ips.to_string(),
            latest_handshake: None,
        });
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(RecordedOp::RemovePeer {
            public_key: public_key.to_string(),
        });
        self.peers.lock().unwrap().retain(|p| p.public_key != public_key);
        Ok(())
    }

    async fn peer_exists(&self, public_key: &str) -> Result<bool, DriverError> {
        Ok(self.peers.lock().unwrap().iter().any(|p| p.public_key == public_key))
    }

    async fn list_peers(&self) -> Result<Vec<Peer>, DriverError> {
        Ok(self.peers.lock().unwrap().clone())
    }

    async fn save(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_remove_updates_peer_existence() {
        let driver = InMemoryOverlayDriver::new();
        driver.add_peer("pk1", "10.0.0.2/32").await.unwrap();
        assert!(driver.peer_exists("pk1").await.unwrap());

        driver.remove_peer("pk1").await.unwrap();
        assert!(!driver.peer_exists("pk1").await.unwrap());

        assert_eq!(
            driver.calls(),
            vec![
                RecordedOp::AddPeer {
                    public_key: "pk1".to_string(),
                    allowed_ips: "10.0.0.2/32".to_string(),
                },
                RecordedOp::RemovePeer {
                    public_key: "pk1".to_string(),
                },
            ]
        );
    }
}
