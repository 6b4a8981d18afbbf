//! In-process topic broker.
//!
//! The bus links the operator plane to the beacon plane: operator requests
//! are published on [`TOPIC_COMMAND_REQ`] and consumed by the beacon
//! dispatcher; beacon responses travel the other way on
//! [`TOPIC_BEACON_RSP`].
//!
//! Each subscriber owns a bounded FIFO queue. Publishing enqueues onto
//! every current subscriber of the topic and never blocks: when a
//! subscriber's queue is full the payload is dropped for that subscriber
//! and a warning is logged. Per subscriber, payloads of one topic arrive
//! in publish order, each at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Topic carrying operator command requests toward the beacon dispatcher.
pub const TOPIC_COMMAND_REQ: &str = "teamclient_req";

/// Topic carrying beacon responses toward operator streams.
pub const TOPIC_BEACON_RSP: &str = "beacon_rsp";

/// Default per-subscriber queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct SubscriberSlot<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

struct BusInner<T> {
    topics: RwLock<HashMap<String, Vec<SubscriberSlot<T>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Cheap-to-clone handle to the broker. All clones share the same topics.
pub struct MessageBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for MessageBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for MessageBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription: one bounded FIFO queue attached to a topic.
///
/// Pull payloads with [`Subscription::pull`]. Hand the subscription back to
/// [`MessageBus::unsubscribe`] when done; a dropped subscription is also
/// pruned lazily on the next publish to its topic.
pub struct Subscription<T> {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Topic this subscription is attached to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next payload.
    ///
    /// Returns `None` once the subscription has been detached from the bus
    /// and its queue drained.
    pub async fn pull(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking pull; `None` when the queue is currently empty.
    pub fn try_pull(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T: Clone> MessageBus<T> {
    /// Creates a broker with the default per-subscriber queue bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a broker whose subscriber queues hold at most `capacity`
    /// payloads.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity,
            }),
        }
    }

    /// Attaches a new subscriber queue to `topic`.
    pub fn subscribe(&self, topic: &str) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.inner.topics.write().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_default()
            .push(SubscriberSlot { id, tx });

        Subscription {
            topic: topic.to_string(),
            id,
            rx,
        }
    }

    /// Detaches `subscription` from its topic and discards its queue.
    pub fn unsubscribe(&self, subscription: &Subscription<T>) {
        let mut topics = self.inner.topics.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slots) = topics.get_mut(&subscription.topic) {
            slots.retain(|slot| slot.id != subscription.id);
            if slots.is_empty() {
                topics.remove(&subscription.topic);
            }
        }
    }

    /// Publishes `payload` to every current subscriber of `topic`.
    ///
    /// Never blocks. A subscriber whose queue is full misses this payload
    /// (drop-newest); a subscriber whose receiver is gone is pruned.
    pub fn publish(&self, topic: &str, payload: T) {
        let mut dead = Vec::new();
        {
            let topics = self.inner.topics.read().unwrap_or_else(|e| e.into_inner());
            let Some(slots) = topics.get(topic) else {
                return;
            };
            for slot in slots {
                match slot.tx.try_send(payload.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            topic,
                            subscriber = slot.id,
                            "subscriber queue full, dropping payload"
                        );
                    }
                    Err(TrySendError::Closed(_)) => dead.push(slot.id),
                }
            }
        }

        if !dead.is_empty() {
            let mut topics = self.inner.topics.write().unwrap_or_else(|e| e.into_inner());
            if let Some(slots) = topics.get_mut(topic) {
                slots.retain(|slot| !dead.contains(&slot.id));
                if slots.is_empty() {
                    topics.remove(topic);
                }
            }
        }
    }

    /// Number of live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.inner.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus: MessageBus<u32> = MessageBus::new();
        let mut sub = bus.subscribe("t");
        for n in 0..10 {
            bus.publish("t", n);
        }
        for n in 0..10 {
            assert_eq!(sub.pull().await, Some(n));
        }
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_subscriber_once() {
        let bus: MessageBus<&'static str> = MessageBus::new();
        let mut a = bus.subscribe("t");
        let mut b = bus.subscribe("t");
        bus.publish("t", "payload");
        assert_eq!(a.pull().await, Some("payload"));
        assert_eq!(b.pull().await, Some("payload"));
        assert!(a.try_pull().is_none());
        assert!(b.try_pull().is_none());
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus: MessageBus<u32> = MessageBus::new();
        let mut other = bus.subscribe("other");
        bus.publish("t", 1);
        assert!(other.try_pull().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus: MessageBus<u32> = MessageBus::new();
        let sub = bus.subscribe("t");
        assert_eq!(bus.subscriber_count("t"), 1);
        bus.unsubscribe(&sub);
        assert_eq!(bus.subscriber_count("t"), 0);
        bus.publish("t", 1);
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let bus: MessageBus<u32> = MessageBus::with_capacity(2);
        let mut sub = bus.subscribe("t");
        bus.publish("t", 1);
        bus.publish("t", 2);
        bus.publish("t", 3); // dropped
        assert_eq!(sub.pull().await, Some(1));
        assert_eq!(sub.pull().await, Some(2));
        assert!(sub.try_pull().is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_publish() {
        let bus: MessageBus<u32> = MessageBus::new();
        let sub = bus.subscribe("t");
        drop(sub);
        bus.publish("t", 1);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn subscriber_joining_before_publish_sees_it() {
        let bus: MessageBus<u32> = MessageBus::new();
        let mut sub = bus.subscribe("t");
        let bus2 = bus.clone();
        let publisher = tokio::spawn(async move { bus2.publish("t", 42) });
        assert_eq!(sub.pull().await, Some(42));
        publisher.await.unwrap();
    }
}
