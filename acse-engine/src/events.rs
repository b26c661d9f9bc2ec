//! Outbound domain events
//!
//! Fan-out over a tokio broadcast channel. The engine publishes after each
//! commit; a send with no subscribers, or a lagging subscriber, never fails
//! the operation that produced the event.

use acse_core::DomainEvent;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event = name, receivers, "Event published"),
            Err(_) => trace!(event = name, "Event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acse_core::CategoryKey;
    use chrono::Utc;

    fn event() -> DomainEvent {
        DomainEvent::PolicyUpdated {
            category: CategoryKey::new("AGRICULTURAL"),
            version: 1,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(event());
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(event());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "policy_updated");
    }
}
