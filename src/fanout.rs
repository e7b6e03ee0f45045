//! Notification fan-out - best-effort in-process pub/sub
//!
//! Subscribers get their own mpsc channel; `publish` walks the
//! registry with a non-blocking send. A subscriber that cannot keep
//! up loses that event - there are no delivery guarantees, and
//! consumers are expected to reconcile state from the store after a
//! gap. Buffering that would change this semantic is deliberately
//! absent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Default per-subscriber delivery buffer
pub const DEFAULT_BUFFER: usize = 16;

/// In-process pub/sub over one event type.
pub struct FanOut<T> {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> FanOut<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a subscriber. The subscription ends when `token` is
    /// cancelled or the receiver is dropped.
    pub async fn subscribe(
        self: &Arc<Self>,
        token: CancellationToken,
        buffer: usize,
    ) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers.lock().await.insert(id, tx.clone());

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tx.closed() => {}
            }
            registry.subscribers.lock().await.remove(&id);
        });

        rx
    }

    /// Deliver an event to every live subscriber without blocking.
    /// Slow subscribers drop this event; closed ones are pruned.
    pub async fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock().await;
        let mut closed = Vec::new();

        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = *id, "Subscriber lagging, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }

        for id in closed {
            subscribers.remove(&id);
        }
    }

    /// Current number of registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let fanout: Arc<FanOut<u32>> = FanOut::new();
        let token = CancellationToken::new();

        let mut a = fanout.subscribe(token.clone(), DEFAULT_BUFFER).await;
        let mut b = fanout.subscribe(token.clone(), DEFAULT_BUFFER).await;

        fanout.publish(7).await;

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_events() {
        let fanout: Arc<FanOut<u32>> = FanOut::new();
        let token = CancellationToken::new();

        // Buffer of one: the second publish must be dropped, not
        // queued and not block the publisher.
        let mut rx = fanout.subscribe(token.clone(), 1).await;

        fanout.publish(1).await;
        fanout.publish(2).await;

        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancellation_removes_subscription() {
        let fanout: Arc<FanOut<u32>> = FanOut::new();
        let token = CancellationToken::new();

        let _rx = fanout.subscribe(token.clone(), DEFAULT_BUFFER).await;
        assert_eq!(fanout.subscriber_count().await, 1);

        token.cancel();

        // The watcher task runs on cancel; give it a tick.
        tokio::task::yield_now().await;
        for _ in 0..50 {
            if fanout.subscriber_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fanout.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let fanout: Arc<FanOut<u32>> = FanOut::new();
        let token = CancellationToken::new();

        let rx = fanout.subscribe(token.clone(), DEFAULT_BUFFER).await;
        drop(rx);

        fanout.publish(1).await;
        assert_eq!(fanout.subscriber_count().await, 0);
    }
}
