//! Bounded multi-consumer channel that drops the oldest items for slow readers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

/// Default buffer size for measurement and status fan-out
pub const DEFAULT_CAPACITY: usize = 100;

/// Producer side of a fan-out channel
///
/// Publishing never blocks. A consumer that falls more than `capacity` items
/// behind loses the oldest items; losses are counted per subscription and in
/// aggregate.
#[derive(Debug)]
pub struct FanOut<T> {
    sender: broadcast::Sender<T>,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for FanOut<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            published: Arc::clone(&self.published),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T: Clone> FanOut<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send to every current subscriber, returning how many there are
    pub fn publish(&self, item: T) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error for a live feed
        self.sender.send(item).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            receiver: self.sender.subscribe(),
            dropped: 0,
            total_dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Items lost by lagging subscribers, across all subscriptions
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of a fan-out channel
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: broadcast::Receiver<T>,
    dropped: u64,
    total_dropped: Arc<AtomicU64>,
}

impl<T: Clone> Subscription<T> {
    /// Next item, skipping past anything lost to lag.
    ///
    /// Returns `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(n)) => self.record_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`]
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(item) => return Some(item),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(_) => return None,
            }
        }
    }

    /// Items this subscription has lost to lag
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        self.total_dropped.fetch_add(n, Ordering::Relaxed);
        warn!(skipped = n, total = self.dropped, "Subscriber lagging, oldest items dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let fanout = FanOut::new(8);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        assert_eq!(fanout.publish(1u32), 2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let fanout = FanOut::new(4);
        assert_eq!(fanout.publish("hr"), 0);
        assert_eq!(fanout.published(), 1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let fanout = FanOut::new(4);
        let mut slow = fanout.subscribe();

        for i in 0..10u32 {
            fanout.publish(i);
        }

        // Only the newest 4 survive
        assert_eq!(slow.recv().await, Some(6));
        assert_eq!(slow.dropped(), 6);
        assert_eq!(fanout.dropped(), 6);
        assert_eq!(slow.try_recv(), Some(7));
        assert_eq!(slow.try_recv(), Some(8));
        assert_eq!(slow.try_recv(), Some(9));
        assert_eq!(slow.try_recv(), None);
    }

    #[tokio::test]
    async fn test_closed_after_producers_drop() {
        let fanout = FanOut::new(4);
        let mut sub = fanout.subscribe();
        fanout.publish(5u8);
        drop(fanout);

        assert_eq!(sub.recv().await, Some(5));
        assert_eq!(sub.recv().await, None);
    }
}
