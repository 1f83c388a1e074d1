//! Encoded packet publication
//!
//! Encoder sessions publish each serialized packet on a named service.
//! [`EncodeBus`] is the in-process implementation: one tokio broadcast
//! channel per service, created on first use.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Per-service channel capacity (ring buffer size)
const SERVICE_CHANNEL_CAPACITY: usize = 256;

/// Sink for published packets
pub trait PacketPublisher: Send + Sync {
    /// Publish one payload on `service`; delivery is best effort
    fn publish(&self, service: &str, payload: Bytes);
}

/// Broadcast bus keyed by service name
///
/// Subscribers that fall more than [`SERVICE_CHANNEL_CAPACITY`] messages
/// behind receive `Lagged` and miss packets; publishers never block.
pub struct EncodeBus {
    services: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl EncodeBus {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to all future packets on `service`
    pub fn subscribe(&self, service: &str) -> broadcast::Receiver<Bytes> {
        if let Some(tx) = self.services.read().get(service) {
            return tx.subscribe();
        }
        self.services
            .write()
            .entry(service.to_string())
            .or_insert_with(|| broadcast::channel(SERVICE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Number of active subscribers on `service`
    pub fn subscriber_count(&self, service: &str) -> usize {
        self.services
            .read()
            .get(service)
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for EncodeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPublisher for EncodeBus {
    fn publish(&self, service: &str, payload: Bytes) {
        let services = self.services.read();
        match services.get(service) {
            // No subscribers is normal
            Some(tx) => {
                let _ = tx.send(payload);
            }
            None => trace!("no subscribers on {}", service),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EncodeBus::new();
        let mut rx = bus.subscribe("roadEncodeData");

        bus.publish("roadEncodeData", Bytes::from_static(b"packet"));

        let payload = rx.recv().await.unwrap();
        assert_eq!(&payload[..], b"packet");
    }

    #[test]
    fn test_services_are_isolated() {
        let bus = EncodeBus::new();
        let mut road = bus.subscribe("roadEncodeData");
        let mut driver1 = bus.subscribe("driverEncodeData");
        let mut driver2 = bus.subscribe("driverEncodeData");
        assert_eq!(bus.subscriber_count("driverEncodeData"), 2);

        bus.publish("driverEncodeData", Bytes::from_static(b"d"));

        assert!(road.try_recv().is_err());
        assert_eq!(&driver1.try_recv().unwrap()[..], b"d");
        assert_eq!(&driver2.try_recv().unwrap()[..], b"d");
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EncodeBus::new();
        assert_eq!(bus.subscriber_count("qRoadEncodeData"), 0);
        // Should not panic when publishing with no subscribers
        bus.publish("qRoadEncodeData", Bytes::from_static(b"x"));
    }
}
