//! ==============================================================================
//! registry.rs - live viewer set
//! ==============================================================================
//!
//! ```text
//! purpose:
//!     owns the set of connected viewers. this is the only shared mutable
//!     state in the host:
//!     - the web server adds on websocket upgrade and removes on close
//!     - the dispatcher reads a snapshot per event and removes on failed sends
//!
//!     each subscriber is a bounded outbound queue. the websocket task owns
//!     the receiving end and does the actual (slow) socket write, so a
//!     publish never waits on the network.
//! ```
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub type SubscriberId = u64;

/// frames queued per viewer before it counts as too slow
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("subscriber {0} disconnected")]
    Closed(SubscriberId),
    #[error("subscriber {0} queue full")]
    Lagging(SubscriberId),
}

/// handle to one connected viewer
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Arc<str>>,
}

impl Subscriber {
    pub fn new(id: SubscriberId, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// queue a frame without waiting
    pub fn try_deliver(&self, frame: Arc<str>) -> Result<(), DeliveryFailure> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed(self.id),
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::Lagging(self.id),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberRegistry {
    subscribers: Arc<RwLock<HashMap<SubscriberId, Subscriber>>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SubscriberRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Create a subscriber with a fresh id and add it.
    ///
    /// The receiver yields every frame published while the subscriber is
    /// registered; it returns `None` once the subscriber has been removed.
    pub async fn register(&self) -> (Subscriber, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let subscriber = Subscriber::new(id, tx);
        self.add(subscriber.clone()).await;
        (subscriber, rx)
    }

    pub async fn add(&self, subscriber: Subscriber) {
        let id = subscriber.id;
        let count = {
            let mut guard = self.subscribers.write().await;
            guard.insert(id, subscriber);
            guard.len()
        };
        tracing::info!(subscriber = id, count, "viewer connected");
    }

    /// Returns `false` when the subscriber was already gone.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut guard = self.subscribers.write().await;
            let removed = guard.remove(&id).is_some();
            (removed, guard.len())
        };
        if removed {
            tracing::info!(subscriber = id, count, "viewer removed");
        }
        removed
    }

    /// point-in-time copy; the lock is not held while callers iterate
    pub async fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers.read().await.values().cloned().collect()
    }

    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Subscriber),
    {
        for subscriber in self.snapshot().await {
            f(&subscriber);
        }
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_remove() {
        let registry = SubscriberRegistry::default();
        let (a, _rx_a) = registry.register().await;
        let (b, _rx_b) = registry.register().await;
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len().await, 2);

        assert!(registry.remove(a.id()).await);
        assert!(!registry.remove(a.id()).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_removed_subscriber_receiver_ends() {
        let registry = SubscriberRegistry::default();
        let (sub, mut rx) = registry.register().await;
        sub.try_deliver(Arc::from("one")).unwrap();
        registry.remove(sub.id()).await;
        drop(sub);

        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_under_removal() {
        let registry = SubscriberRegistry::default();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(registry.register().await.1);
        }
        let snapshot = registry.snapshot().await;
        for s in &snapshot {
            registry.remove(s.id()).await;
        }
        assert_eq!(snapshot.len(), 3);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_delivery_failures() {
        let registry = SubscriberRegistry::new(1);
        let (sub, rx) = registry.register().await;
        sub.try_deliver(Arc::from("a")).unwrap();
        assert_eq!(
            sub.try_deliver(Arc::from("b")),
            Err(DeliveryFailure::Lagging(sub.id()))
        );
        drop(rx);
        assert_eq!(
            sub.try_deliver(Arc::from("c")),
            Err(DeliveryFailure::Closed(sub.id()))
        );
    }

    #[tokio::test]
    async fn test_concurrent_add_remove() {
        let registry = SubscriberRegistry::default();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (sub, _rx) = registry.register().await;
                tokio::task::yield_now().await;
                registry.remove(sub.id()).await
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }
        assert!(registry.is_empty().await);
    }
}
