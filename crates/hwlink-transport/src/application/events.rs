//! Subscriber list for [`TransportEvent`]s.
//!
//! Each subscriber owns an unbounded channel.  Publishing walks the list in
//! subscription order under one lock, so an unsubscribe either happens
//! before a delivery pass or after it, never halfway through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hwlink_core::domain::TransportEvent;
use tokio::sync::mpsc;
use tracing::trace;

type Subscribers = Vec<(u64, mpsc::UnboundedSender<TransportEvent>)>;

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers a subscriber and returns its id with the receiving end.
    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, tx));
        (id, rx)
    }

    /// Removes a subscriber; returns how many remain.
    pub fn unsubscribe(&self, id: u64) -> usize {
        let mut subs = self.lock();
        subs.retain(|(sid, _)| *sid != id);
        subs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Delivers `event` to every subscriber in subscription order.
    ///
    /// Subscribers whose receiver was dropped are pruned.
    pub fn publish(&self, event: TransportEvent) {
        let mut subs = self.lock();
        trace!(subscribers = subs.len(), ?event, "publishing event");
        subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

/// A live event subscription.  Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    bus: Arc<EventBus>,
}

impl Subscription {
    pub(crate) fn new(bus: Arc<EventBus>) -> Self {
        let (id, rx) = bus.subscribe();
        Self { id, rx, bus }
    }

    /// Waits for the next event.  `None` once the transport is dropped.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Returns an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let remaining = self.bus.unsubscribe(self.id);
        trace!(id = self.id, remaining, "subscription dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwlink_core::domain::{BackendKind, StopInfo};

    fn stop() -> TransportEvent {
        TransportEvent::Stopped(StopInfo {
            backend_type: BackendKind::Hid,
        })
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        // Arrange
        let bus = Arc::new(EventBus::new());
        let mut a = Subscription::new(Arc::clone(&bus));
        let mut b = Subscription::new(Arc::clone(&bus));

        // Act
        bus.publish(stop());

        // Assert
        assert_eq!(a.try_recv(), Some(stop()));
        assert_eq!(b.try_recv(), Some(stop()));
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn test_dropped_subscription_receives_nothing_more() {
        let bus = Arc::new(EventBus::new());
        let a = Subscription::new(Arc::clone(&bus));
        let mut b = Subscription::new(Arc::clone(&bus));

        drop(a);
        bus.publish(stop());

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(b.try_recv(), Some(stop()));
    }

    #[test]
    fn test_closed_receivers_are_pruned() {
        let bus = EventBus::new();
        let (_, rx) = bus.subscribe();
        drop(rx);

        bus.publish(stop());

        assert_eq!(bus.subscriber_count(), 0);
    }
}
