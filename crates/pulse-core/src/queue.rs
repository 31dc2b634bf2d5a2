//! Bounded async delivery queues.
//!
//! One bounded MPMC ring buffer per worker (`crossbeam-channel` array
//! flavor: lock-free slots with atomic head/tail stamps). A subscription
//! always maps to the same shard, so its work items are handled FIFO by a
//! single worker. There is no ordering across shards.
//!
//! ```text
//! publish ──▶ WorkItem ──(subscription id % shards)──▶ [shard 0] ──▶ worker 0
//!                                                  ├─▶ [shard 1] ──▶ worker 1
//!                                                  └─▶ [shard N] ──▶ worker N
//! ```
//!
//! When a shard is full the configured [`BackpressurePolicy`] decides what
//! happens to the producer.

use crate::config::BackpressurePolicy;
use crate::error::QueueSaturationError;
use crate::event::Event;
use crate::metrics;
use crate::subscription::{Subscription, SubscriptionId};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// One pending async handler invocation.
pub struct WorkItem<T> {
    pub(crate) event: Arc<Event<T>>,
    pub(crate) subscription: Arc<Subscription<T>>,
    pub(crate) enqueued_at: Instant,
}

impl<T> WorkItem<T> {
    pub(crate) fn new(event: Arc<Event<T>>, subscription: Arc<Subscription<T>>) -> Self {
        Self {
            event,
            subscription,
            enqueued_at: Instant::now(),
        }
    }

    fn saturation(&self, policy: BackpressurePolicy) -> QueueSaturationError {
        QueueSaturationError {
            subscription: self.subscription.id,
            subscriber: Arc::clone(self.subscription.subscriber.shared_name()),
            event_id: self.event.id,
            policy,
        }
    }
}

/// Outcome of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Stored without displacing anything.
    Accepted,
    /// Stored after evicting this many older items.
    Evicted(u64),
}

struct Shard<T> {
    tx: Sender<WorkItem<T>>,
    /// Kept for head eviction under `DropOldest`.
    rx: Receiver<WorkItem<T>>,
}

/// Sharded bounded queue of [`WorkItem`]s.
pub(crate) struct DeliveryQueue<T> {
    shards: Vec<Shard<T>>,
    policy: BackpressurePolicy,
    block_timeout: Duration,
}

impl<T> DeliveryQueue<T> {
    /// Create `shards` queues of `capacity` items each.
    pub(crate) fn new(
        shards: usize,
        capacity: usize,
        policy: BackpressurePolicy,
        block_timeout: Duration,
    ) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| {
                let (tx, rx) = bounded(capacity.max(1));
                Shard { tx, rx }
            })
            .collect();

        Self {
            shards,
            policy,
            block_timeout,
        }
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Consumer end of a shard.
    pub(crate) fn receiver(&self, shard: usize) -> Receiver<WorkItem<T>> {
        self.shards[shard].rx.clone()
    }

    /// Number of queued items across all shards.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.rx.len()).sum()
    }

    fn shard_for(&self, id: SubscriptionId) -> &Shard<T> {
        &self.shards[(id.0 % self.shards.len() as u64) as usize]
    }

    /// Enqueue a work item, applying the backpressure policy if the target
    /// shard is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueSaturationError`] if the item was rejected.
    pub(crate) fn push(&self, item: WorkItem<T>) -> Result<Enqueued, QueueSaturationError> {
        let shard = self.shard_for(item.subscription.id);

        match self.policy {
            BackpressurePolicy::DropNewest => match shard.tx.try_send(item) {
                Ok(()) => Ok(Enqueued::Accepted),
                Err(TrySendError::Full(item) | TrySendError::Disconnected(item)) => {
                    Err(self.reject(&item))
                }
            },
            BackpressurePolicy::Block => match shard.tx.send_timeout(item, self.block_timeout) {
                Ok(()) => Ok(Enqueued::Accepted),
                Err(SendTimeoutError::Timeout(item) | SendTimeoutError::Disconnected(item)) => {
                    Err(self.reject(&item))
                }
            },
            BackpressurePolicy::DropOldest => {
                let mut item = item;
                let mut evicted = 0;
                loop {
                    match shard.tx.try_send(item) {
                        Ok(()) if evicted == 0 => return Ok(Enqueued::Accepted),
                        Ok(()) => return Ok(Enqueued::Evicted(evicted)),
                        Err(TrySendError::Full(back)) => {
                            item = back;
                            if let Ok(oldest) = shard.rx.try_recv() {
                                evicted += 1;
                                metrics::record_evicted();
                                warn!(
                                    subscription = %oldest.subscription.id,
                                    subscriber = %oldest.subscription.subscriber.name(),
                                    event_id = oldest.event.id,
                                    "Evicted oldest queued work item"
                                );
                            }
                        }
                        Err(TrySendError::Disconnected(back)) => return Err(self.reject(&back)),
                    }
                }
            }
        }
    }

    fn reject(&self, item: &WorkItem<T>) -> QueueSaturationError {
        metrics::record_rejected(self.policy.as_str());
        trace!(
            subscription = %item.subscription.id,
            policy = self.policy.as_str(),
            "Rejected work item"
        );
        item.saturation(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::subscription::{DeliveryMode, Subscriber};

    fn subscription(id: u64) -> Arc<Subscription<u32>> {
        Arc::new(Subscription {
            id: SubscriptionId(id),
            event_type: EventType::new(0, 0),
            subscriber: Subscriber::from_fn("worker", |_: &Event<u32>| Ok(())),
            priority: 0,
            mode: DeliveryMode::Async,
            filter: None,
            seq: id,
        })
    }

    fn item(sub: &Arc<Subscription<u32>>, payload: u32) -> WorkItem<u32> {
        WorkItem::new(Arc::new(Event::new(EventType::new(0, 0), payload)), Arc::clone(sub))
    }

    #[test]
    fn test_drop_newest_rejects_when_full() {
        let queue = DeliveryQueue::new(1, 1, BackpressurePolicy::DropNewest, Duration::ZERO);
        let sub = subscription(1);

        assert_eq!(queue.push(item(&sub, 1)), Ok(Enqueued::Accepted));
        let err = queue.push(item(&sub, 2)).unwrap_err();
        assert_eq!(err.subscription, SubscriptionId(1));
        assert_eq!(err.policy, BackpressurePolicy::DropNewest);

        let rx = queue.receiver(0);
        assert_eq!(rx.try_recv().unwrap().event.payload, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_oldest_evicts_head() {
        let queue = DeliveryQueue::new(1, 2, BackpressurePolicy::DropOldest, Duration::ZERO);
        let sub = subscription(1);

        queue.push(item(&sub, 1)).unwrap();
        queue.push(item(&sub, 2)).unwrap();
        assert_eq!(queue.push(item(&sub, 3)), Ok(Enqueued::Evicted(1)));
        assert_eq!(queue.len(), 2);

        let rx = queue.receiver(0);
        assert_eq!(rx.try_recv().unwrap().event.payload, 2);
        assert_eq!(rx.try_recv().unwrap().event.payload, 3);
    }

    #[test]
    fn test_block_times_out() {
        let timeout = Duration::from_millis(20);
        let queue = DeliveryQueue::new(1, 1, BackpressurePolicy::Block, timeout);
        let sub = subscription(1);

        queue.push(item(&sub, 1)).unwrap();
        let start = Instant::now();
        let err = queue.push(item(&sub, 2)).unwrap_err();
        assert!(start.elapsed() >= timeout);
        assert_eq!(err.policy, BackpressurePolicy::Block);
    }

    #[test]
    fn test_block_succeeds_once_space_frees() {
        let queue = Arc::new(DeliveryQueue::new(
            1,
            1,
            BackpressurePolicy::Block,
            Duration::from_secs(5),
        ));
        let sub = subscription(1);
        queue.push(item(&sub, 1)).unwrap();

        let rx = queue.receiver(0);
        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            rx.recv().unwrap().event.payload
        });

        assert_eq!(queue.push(item(&sub, 2)), Ok(Enqueued::Accepted));
        assert_eq!(consumer.join().unwrap(), 1);
    }

    #[test]
    fn test_subscription_sticks_to_one_shard() {
        let queue = DeliveryQueue::new(4, 8, BackpressurePolicy::DropNewest, Duration::ZERO);
        let sub = subscription(6);

        for i in 0..3 {
            queue.push(item(&sub, i)).unwrap();
        }

        let rx = queue.receiver(2);
        let payloads: Vec<u32> = rx.try_iter().map(|w| w.event.payload).collect();
        assert_eq!(payloads, vec![0, 1, 2]);
        assert_eq!(queue.len(), 0);
    }
}
