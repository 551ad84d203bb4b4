//! Event bus — delivers core events to connected WebSocket clients
//!
//! Every connection subscribes to the same broadcast channel and keeps only
//! the events addressed to it or to everyone.

use std::sync::Arc;

use swarm_core::{Transport, TransportEvent};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<TransportEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to events (each WebSocket connection gets its own receiver)
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: TransportEvent) {
        let receivers = self.sender.receiver_count();
        if receivers > 0 {
            debug!(
                "Publishing event '{}' ({:?}) to {} receivers",
                event.event, event.target, receivers
            );
            // No receivers is fine
            let _ = self.sender.send(event);
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Transport for EventBus {
    fn emit(&self, event: TransportEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_event_bus_broadcast() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(TransportEvent::broadcast("agent_status_update", json!({"agent_id": "cathy"})));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event, "agent_status_update");
        assert_eq!(e2.event, "agent_status_update");
    }

    #[tokio::test]
    async fn test_targeted_event_filtered_by_client() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(TransportEvent::to_client("c1", "response_stream_chunk", json!({})));

        let event = rx.recv().await.unwrap();
        assert!(event.target.includes("c1"));
        assert!(!event.target.includes("c2"));
    }

    #[test]
    fn test_event_bus_no_receivers() {
        let bus = EventBus::new(16);
        bus.emit(TransportEvent::broadcast("test", json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_bus_subscriber_count() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);
        let rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
