//! Wallet lifecycle event fan-out.
//!
//! Events are delivered to subscribers over a bounded broadcast channel.
//! Delivery is best-effort and lossy under backpressure: a subscriber that
//! falls behind loses the oldest undelivered events rather than blocking a
//! producer. Dropping a subscription unsubscribes and releases its
//! resources.

use tokio::sync::broadcast;
use tracing::warn;

/// A wallet lifecycle event, carrying the wallet's URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    Arrived { url: String },
    Opened { url: String },
    Dropped { url: String },
}

impl WalletEvent {
    pub fn url(&self) -> &str {
        match self {
            WalletEvent::Arrived { url } | WalletEvent::Opened { url } | WalletEvent::Dropped { url } => url,
        }
    }
}

/// Broadcaster for wallet events.
///
/// Clone this to share across the backend; events are delivered to every
/// live subscription.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    /// Create a new bus whose subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: WalletEvent) {
        // Ignore send errors - they just mean no subscribers are connected
        let _ = self.sender.send(event);
    }

    pub fn wallet_arrived(&self, url: &str) {
        self.publish(WalletEvent::Arrived { url: url.to_string() });
    }

    pub fn wallet_opened(&self, url: &str) {
        self.publish(WalletEvent::Opened { url: url.to_string() });
    }

    pub fn wallet_dropped(&self, url: &str) {
        self.publish(WalletEvent::Dropped { url: url.to_string() });
    }
}

/// One subscriber's view of the event stream.
pub struct Subscription {
    receiver: broadcast::Receiver<WalletEvent>,
}

impl Subscription {
    /// The next event, or `None` once the bus has shut down. A lagging
    /// subscriber silently skips the events it lost.
    pub async fn recv(&mut self) -> Option<WalletEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged, dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();

        bus.wallet_arrived("file://v:1/a.json");
        bus.wallet_opened("file://v:1/a.json");

        assert_eq!(
            sub.recv().await.unwrap(),
            WalletEvent::Arrived { url: "file://v:1/a.json".into() }
        );
        assert_eq!(
            sub.recv().await.unwrap(),
            WalletEvent::Opened { url: "file://v:1/a.json".into() }
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.wallet_dropped("file://v:1/a.json");
    }

    #[tokio::test]
    async fn test_backpressure_drops_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.wallet_arrived(&format!("file://v:1/{}.json", i));
        }

        // The two newest survive; the oldest three were dropped
        assert_eq!(sub.recv().await.unwrap().url(), "file://v:1/3.json");
        assert_eq!(sub.recv().await.unwrap().url(), "file://v:1/4.json");
    }

    #[tokio::test]
    async fn test_subscriptions_are_independent() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.wallet_arrived("file://v:1/a.json");
        assert!(a.recv().await.is_some());

        // Dropping one subscription does not affect the other
        drop(a);
        bus.wallet_arrived("file://v:1/b.json");
        assert_eq!(b.recv().await.unwrap().url(), "file://v:1/a.json");
        assert_eq!(b.recv().await.unwrap().url(), "file://v:1/b.json");
    }
}
