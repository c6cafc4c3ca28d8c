//! Bounded event bus for distributing `WorkflowEvent` to observers.
//!
//! Built on `tokio::sync::broadcast`. Publishing never blocks the dispatch
//! loop: with no subscribers the event is dropped, and a subscriber that
//! falls more than `capacity` events behind loses the oldest ones and
//! observes `RecvError::Lagged`.

use nodeflow_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Multi-consumer lifecycle event bus.
///
/// Cloning the bus clones the sender, so every workflow execution context
/// publishes into the engine-wide channel.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn paused(id: Uuid) -> WorkflowEvent {
        WorkflowEvent::WorkflowPaused { instance_id: id }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        bus.publish(paused(id));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.instance_id(), id);
    }

    #[test]
    fn publish_with_no_subscribers_is_dropped() {
        let bus = EventBus::new(16);
        bus.publish(paused(Uuid::now_v7()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_loses_oldest_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for _ in 0..10 {
            bus.publish(paused(Uuid::now_v7()));
        }

        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(missed)) => assert_eq!(missed, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        // The four most recent events are still readable.
        for _ in 0..4 {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(paused(Uuid::now_v7()));

        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
