//! Broadcast publisher for ledger events

use super::{Channel, LedgerMessage};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    /// Messages sent while nobody was subscribed
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Fan-out of [`LedgerMessage`]s over tokio broadcast channels
///
/// One sender per [`Channel`] plus a combined feed. Cloning is cheap; all
/// clones publish into the same channels.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    channels: Arc<BTreeMap<Channel, broadcast::Sender<LedgerMessage>>>,
    all: broadcast::Sender<LedgerMessage>,
    counters: Arc<Counters>,
}

impl EventPublisher {
    /// Create a publisher with per-channel default buffer sizes
    pub fn new() -> Self {
        Self::build(|channel| channel.default_capacity(), 1024)
    }

    /// Create a publisher where every buffer holds `capacity` messages
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self::build(|_| capacity, capacity)
    }

    fn build(per_channel: impl Fn(Channel) -> usize, combined: usize) -> Self {
        let channels = Channel::ALL
            .iter()
            .map(|c| (*c, broadcast::channel(per_channel(*c)).0))
            .collect();
        Self {
            channels: Arc::new(channels),
            all: broadcast::channel(combined).0,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Publish a message to its channel and the combined feed
    ///
    /// Having no subscribers is a valid state; the message is dropped.
    #[instrument(skip(self, message), fields(event = %message.description()))]
    pub fn publish(&self, message: LedgerMessage) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        if let Some(tx) = self.channels.get(&message.channel()) {
            delivered += tx.send(message.clone()).unwrap_or(0);
        }
        delivered += self.all.send(message).unwrap_or(0);

        if delivered == 0 {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("No receivers for event, message dropped");
        } else {
            debug!(receivers = delivered, "Published ledger event");
        }
    }

    /// Subscribe to one channel
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<LedgerMessage> {
        match self.channels.get(&channel) {
            Some(tx) => tx.subscribe(),
            // Every channel is created in `build`
            None => self.all.subscribe(),
        }
    }

    /// Subscribe to every channel through the combined feed
    pub fn subscribe_all(&self) -> broadcast::Receiver<LedgerMessage> {
        self.all.subscribe()
    }

    pub fn receiver_count(&self, channel: Channel) -> usize {
        self.channels
            .get(&channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SubnetEvent;
    use crate::models::SubnetId;
    use chrono::Utc;

    fn created(id: u64) -> LedgerMessage {
        LedgerMessage::SubnetCreated(SubnetEvent {
            subnet_id: SubnetId::new(id),
            name: format!("net-{}", id),
            cidr: "10.0.0.0/24".to_string(),
            parent: None,
            at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_publish_routes_to_channel() {
        let publisher = EventPublisher::new();
        let mut topology = publisher.subscribe(Channel::Topology);
        let mut conflicts = publisher.subscribe(Channel::Conflicts);
        let mut all = publisher.subscribe_all();

        publisher.publish(created(1));

        let msg = topology.recv().await.unwrap();
        assert!(matches!(msg, LedgerMessage::SubnetCreated(_)));
        assert!(all.recv().await.is_ok());
        assert!(conflicts.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = EventPublisher::with_capacity(4);
        publisher.publish(created(1));
        publisher.publish(created(2));

        assert_eq!(
            publisher.stats(),
            PublisherStats {
                published: 2,
                dropped: 2
            }
        );
    }

    #[test]
    fn test_clones_share_channels() {
        let publisher = EventPublisher::new();
        let clone = publisher.clone();
        let _rx = publisher.subscribe(Channel::Topology);
        assert_eq!(clone.receiver_count(Channel::Topology), 1);
    }
}
