use std::sync::{Arc, Mutex};

use cd_core::types::{FleetAllocation, StatusSnapshot};

/// Messages carried on the status bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// One per cycle, whatever the mode.
    Status(StatusSnapshot),
    /// The capacity partition, republished unconditionally every cycle.
    FleetAllocation(FleetAllocation),
}

/// A broadcast-style bus built on top of flume channels.
///
/// Each call to [`subscribe`](Self::subscribe) creates a receiver that sees
/// every message published afterwards. Consumers that fall behind or go
/// away never block the publisher.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<BusMessage>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<BusMessage> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish to all current subscribers, pruning disconnected ones.
    pub fn publish(&self, msg: BusMessage) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(msg.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cd_core::types::ModeKind;
    use chrono::Utc;

    #[test]
    fn subscribers_receive_messages_published_after_subscribing() {
        let bus = EventBus::new();
        bus.publish(BusMessage::Status(StatusSnapshot::empty(ModeKind::Batch, Utc::now())));

        let rx = bus.subscribe();
        let status = StatusSnapshot::empty(ModeKind::Legacy, Utc::now());
        bus.publish(BusMessage::Status(status.clone()));

        assert_eq!(rx.try_recv().expect("message"), BusMessage::Status(status));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx);
        bus.publish(BusMessage::Status(StatusSnapshot::empty(ModeKind::Drain, Utc::now())));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
