//! Publish/subscribe fan-out over bounded per-subscriber queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use super::Event;

/// Default per-subscriber queue depth.
const DEFAULT_QUEUE_DEPTH: usize = 1024;

struct SubscriberSlot {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// In-process typed event bus.
///
/// `publish` never blocks the publisher: each subscriber has its own
/// bounded queue, and an event that does not fit is dropped for that
/// subscriber (and counted). Delivery is per-subscriber FIFO in publish
/// order; nothing is guaranteed across subscribers.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Attach a new subscriber receiving every event published from now on.
    pub fn subscribe_all(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        subscribers.insert(
            id,
            SubscriberSlot {
                tx,
                dropped: dropped.clone(),
            },
        );

        Subscription { id, rx, dropped }
    }

    /// Detach a subscriber. Safe to call with a stale id.
    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        subscribers.remove(&id);
    }

    /// Publish an event to every subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("event bus poisoned");
            for (id, slot) in subscribers.iter() {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(*id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
            for id in closed {
                debug!("removing closed event subscriber {}", id);
                subscribers.remove(&id);
            }
        }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's delivery queue.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Id for [`EventBus::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event; `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Events dropped for this subscriber because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogLevel;

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_all();

        for i in 0..10 {
            bus.publish(Event::log(LogLevel::Info, format!("m{}", i)));
        }

        for i in 0..10 {
            match sub.recv().await.unwrap() {
                Event::Log { message, .. } => assert_eq!(message, format!("m{}", i)),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_independent_subscribers_each_get_everything() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_all();
        let mut b = bus.subscribe_all();

        bus.publish(Event::progress("k", 1.0));

        assert!(matches!(a.recv().await, Some(Event::Progress { .. })));
        assert!(matches!(b.recv().await, Some(Event::Progress { .. })));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::with_queue_depth(2);
        let sub = bus.subscribe_all();

        // Publisher side never blocks even though nobody is draining.
        for _ in 0..10 {
            bus.publish(Event::progress("k", 0.0));
        }

        assert_eq!(sub.dropped(), 8);
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(sub.id());
        assert_eq!(bus.subscriber_count(), 0);

        // Publishing with no subscribers is a no-op.
        bus.publish(Event::progress("k", 0.5));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();
        drop(sub);

        bus.publish(Event::progress("k", 0.5));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
