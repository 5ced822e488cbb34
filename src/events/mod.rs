//! In-process publish/subscribe for domain events (§4.6): each subscriber
//! gets its own unbounded `crossbeam` channel, and publishing never blocks.
//!
//! `EventBus` is an explicit value passed into the Node, Client, and Policy
//! managers at construction (§9 design note), so tests can substitute a bus
//! with no subscribers.

pub mod audit;

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// The sum type every published event belongs to (§4.6).
#[derive(Debug, Clone)]
pub enum DomainEvent {
    NodeRegistered { node_id: Uuid, hostname: String },
    NodeReregistered { node_id: Uuid, hostname: String },
    NodeApproved { node_id: Uuid, hostname: String },
    NodeSuspended { node_id: Uuid, hostname: String, reason: String },
    NodeRevoked { node_id: Uuid, hostname: String, reason: String },
    NodeDeleted { node_id: Uuid, hostname: String },
    TrustScored {
        node_id: Uuid,
        hostname: String,
        score: f64,
        action: String,
    },
    PolicyChanged { config_version: i64 },
    ClientDeviceCreated { device_id: Uuid, user_id: String },
    ClientDeviceRevoked { device_id: Uuid, user_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribed_senders: Arc<Mutex<Vec<Sender<DomainEvent>>>>,
}

impl EventBus {
    /// Registers a new receiver. Handlers subscribe once, at construction
    /// (§9 "Event bus" design note), and then drain their channel for the
    /// life of the process.
    pub fn subscribe(&self) -> Receiver<DomainEvent> {
        let (tx, rx) = unbounded();
        self.subscribed_senders
            .lock()
            .expect("failed to acquire the lock")
            .push(tx);
        rx
    }

    /// Broadcasts `event` to every live subscriber. Never blocks, never
    /// fails: disconnected subscribers are silently dropped from the list.
    pub fn publish(&self, event: DomainEvent) {
        self.subscribed_senders
            .lock()
            .expect("failed to acquire the lock")
            .retain(|s| s.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_subscribers_each_receive_every_event() {
        let bus = EventBus::default();
        let sub1 = bus.subscribe();
        let sub2 = bus.subscribe();

        bus.publish(DomainEvent::PolicyChanged { config_version: 2 });

        assert!(matches!(
            sub1.recv().unwrap(),
            DomainEvent::PolicyChanged { config_version: 2 }
        ));
        assert!(matches!(
            sub2.recv().unwrap(),
            DomainEvent::PolicyChanged { config_version: 2 }
        ));
    }

    #[test]
    fn dropped_subscriber_does_not_block_publish() {
        let bus = EventBus::default();
        let sub1 = bus.subscribe();
        let sub2 = bus.subscribe();
        drop(sub2);

        bus.publish(DomainEvent::NodeDeleted {
            node_id: Uuid::new_v4(),
            hostname: "app-01".to_string(),
        });

        assert!(sub1.recv().is_ok());
    }
}
