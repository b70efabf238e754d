//! Event bus for tile notifications
//!
//! Broadcasts connection state, health and failure events to the host
//! (dashboard backend, CLI logger, tests).

pub mod types;

pub use types::TileEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus shared by every tile
///
/// # Example
///
/// ```no_run
/// use camview::events::EventBus;
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}: {}", event.tile_id(), event.event_name());
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<TileEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published with no subscribers are dropped.
    pub fn publish(&self, event: TileEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    ///
    /// A subscriber that falls more than the channel capacity behind
    /// gets `Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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
    use chrono::Utc;

    fn removed(tile: &str) -> TileEvent {
        TileEvent::Removed {
            tile_id: tile.to_string(),
            stream_id: tile.to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(removed("gate"));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TileEvent::Removed { .. }));
        assert_eq!(event.tile_id(), "gate");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(removed("yard"));

        assert_eq!(rx1.recv().await.unwrap().tile_id(), "yard");
        assert_eq!(rx2.recv().await.unwrap().tile_id(), "yard");
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(removed("gate"));
    }
}
