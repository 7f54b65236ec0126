//! Subscriber Hub
//!
//! Registry of live SSE subscribers. Each subscriber owns a bounded outbox;
//! broadcasting never waits on a subscriber. A full outbox drops the event
//! for that subscriber only.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};
use uuid::Uuid;

/// Events buffered per subscriber before new ones are dropped
pub const OUTBOX_CAPACITY: usize = 100;

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Shared registry of subscriber outboxes
///
/// The lock is never held across an await.
#[derive(Debug, Default)]
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<String, mpsc::Sender<String>>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber and return its id and outbox
    pub fn register(&self) -> (String, mpsc::Receiver<String>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);

        let count = {
            let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
            subscribers.insert(id.clone(), tx);
            subscribers.len()
        };
        info!(subscriber = %id, subscribers = count, "sse subscriber connected");
        (id, rx)
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn unregister(&self, id: &str) -> bool {
        let (removed, count) = {
            let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
            let removed = subscribers.remove(id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            info!(subscriber = %id, subscribers = count, "sse subscriber disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Offer `event` to every subscriber without waiting
    pub fn broadcast(&self, event: &str) -> BroadcastReport {
        let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        let mut report = BroadcastReport::default();

        for (id, outbox) in subscribers.iter() {
            match outbox.try_send(event.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = %id, "subscriber outbox full, dropping event");
                    report.dropped += 1;
                }
                // receiver gone; the handler unregisters on its way out
                Err(TrySendError::Closed(_)) => report.dropped += 1,
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== registry tests ====================

    #[test]
    fn test_register_assigns_unique_ids() {
        let hub = SubscriberHub::new();
        let (a, _rx_a) = hub.register();
        let (b, _rx_b) = hub.register();

        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[test]
    fn test_unregister_removes_once() {
        let hub = SubscriberHub::new();
        let (id, _rx) = hub.register();

        assert!(hub.unregister(&id));
        assert!(!hub.unregister(&id));
        assert_eq!(hub.subscriber_count(), 0);
    }

    // ==================== broadcast tests ====================

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let hub = SubscriberHub::new();
        let (_, mut rx_a) = hub.register();
        let (_, mut rx_b) = hub.register();

        let report = hub.broadcast("0x02aa");
        assert_eq!(report, BroadcastReport { delivered: 2, dropped: 0 });
        assert_eq!(rx_a.recv().await.unwrap(), "0x02aa");
        assert_eq!(rx_b.recv().await.unwrap(), "0x02aa");
    }

    #[tokio::test]
    async fn test_full_outbox_drops_without_blocking_others() {
        let hub = SubscriberHub::new();
        let (_, _stalled) = hub.register();
        let (_, mut reader) = hub.register();

        let mut dropped = 0;
        for i in 0..OUTBOX_CAPACITY + 20 {
            dropped += hub.broadcast(&format!("0x{i:04x}")).dropped;
            assert_eq!(reader.recv().await.unwrap(), format!("0x{i:04x}"));
        }
        assert_eq!(dropped, 20);
    }

    #[test]
    fn test_broadcast_with_no_subscribers() {
        let hub = SubscriberHub::new();
        assert_eq!(hub.broadcast("0x02"), BroadcastReport::default());
    }
}
