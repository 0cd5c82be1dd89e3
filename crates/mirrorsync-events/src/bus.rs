//! In-process event bus
//!
//! One producer-side publish call fans out to any number of subscribers,
//! each consuming at its own pace through an independent cursor over a
//! bounded ring. A full/slow subscriber never blocks publication: when a
//! subscriber falls more than the ring capacity behind, the oldest events
//! are dropped *for that subscriber only* and counted on its
//! [`Subscription`].

use tokio::sync::broadcast;

use mirrorsync_core::domain::event::Event;
use mirrorsync_core::ports::event_bus::IEventPublisher;

/// Default ring capacity per bus
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out hub for session events.
///
/// Cheap to clone; clones publish into the same ring.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default ring capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit ring capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Open an independent subscription starting at the current position
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl IEventPublisher for EventBus {
    fn publish(&self, event: Event) {
        // send() only errors when no subscriber exists, which is fine:
        // publication is fire-and-forget.
        let _ = self.tx.send(event);
    }
}

/// One consumer's view of the event stream
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    dropped: u64,
}

impl Subscription {
    /// Receive the next event.
    ///
    /// Returns `None` once the bus is gone and the backlog is drained.
    /// Lag (events this subscriber was too slow for) is absorbed here and
    /// tallied in [`dropped`](Subscription::dropped).
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is pending right now
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// How many events this subscriber has missed so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorsync_core::domain::event::{HostRole, LogEvent, LogLevel};

    fn log(msg: &str) -> Event {
        Event::Log(LogEvent::new(
            LogLevel::Info,
            "test",
            HostRole::Source,
            msg,
        ))
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(log("hello"));

        assert!(matches!(a.next().await, Some(Event::Log(e)) if e.message == "hello"));
        assert!(matches!(b.next().await, Some(Event::Log(e)) if e.message == "hello"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::new();
        bus.publish(log("into the void"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_only_for_itself() {
        let bus = EventBus::with_capacity(4);
        let mut slow = bus.subscribe();

        for i in 0..10 {
            bus.publish(log(&format!("event-{i}")));
        }

        // The slow subscriber lost the oldest six and still sees the rest.
        let first = slow.next().await.unwrap();
        assert!(matches!(first, Event::Log(e) if e.message == "event-6"));
        assert_eq!(slow.dropped(), 6);

        // A fresh subscriber starts at the current position, unaffected.
        let mut fresh = bus.subscribe();
        bus.publish(log("after"));
        assert!(matches!(fresh.next().await, Some(Event::Log(e)) if e.message == "after"));
        assert_eq!(fresh.dropped(), 0);
    }

    #[tokio::test]
    async fn test_subscription_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(log("last"));
        drop(bus);

        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_try_next() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        assert!(sub.try_next().is_none());
        bus.publish(log("x"));
        assert!(sub.try_next().is_some());
        assert!(sub.try_next().is_none());
    }
}
