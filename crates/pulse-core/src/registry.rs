//! Subscriber registry.
//!
//! Each event type holds an immutable [`SubscriberList`] behind an atomically
//! swapped pointer. Mutations copy the current list, apply the change and
//! publish the copy with compare-and-swap, retrying if another writer won.
//! Readers pin whichever generation is current and never take a lock, so a
//! dispatch sees either the list before a mutation or after it, never a
//! partial one.
//!
//! Removal is not retroactive: a dispatch that already pinned a generation
//! containing a removed subscription still invokes it.

use crate::error::BusError;
use crate::event::EventType;
use crate::index::EventIndex;
use crate::metrics;
use crate::subscription::{
    SubscribeOptions, Subscriber, Subscription, SubscriptionHandle, SubscriptionId,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Immutable, ordered subscriptions for one event type.
///
/// Ordered by priority descending, then registration order.
pub struct SubscriberList<T> {
    generation: u64,
    entries: Vec<Arc<Subscription<T>>>,
}

impl<T> SubscriberList<T> {
    pub(crate) fn empty() -> Self {
        Self {
            generation: 0,
            entries: Vec::new(),
        }
    }

    /// Generation number, incremented by every mutation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate subscriptions in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscription<T>>> {
        self.entries.iter()
    }

    /// Subscription ids in dispatch order.
    #[must_use]
    pub fn ids(&self) -> Vec<SubscriptionId> {
        self.entries.iter().map(|s| s.id).collect()
    }

    /// Whether a subscription is part of this generation.
    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.iter().any(|s| s.id == id)
    }

    fn with_inserted(&self, subscription: Arc<Subscription<T>>) -> Self {
        let key = subscription.sort_key();
        let at = self.entries.partition_point(|s| s.sort_key() <= key);

        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend_from_slice(&self.entries[..at]);
        entries.push(subscription);
        entries.extend_from_slice(&self.entries[at..]);

        Self {
            generation: self.generation + 1,
            entries,
        }
    }

    fn without(&self, mut remove: impl FnMut(&Subscription<T>) -> bool) -> Self {
        Self {
            generation: self.generation + 1,
            entries: self
                .entries
                .iter()
                .filter(|s| !remove(s))
                .cloned()
                .collect(),
        }
    }
}

impl<T> std::fmt::Debug for SubscriberList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("generation", &self.generation)
            .field("entries", &self.entries)
            .finish()
    }
}

/// Concurrent registry of subscriptions keyed by event type.
pub struct SubscriberRegistry<T> {
    index: EventIndex<T>,
    /// Source of subscription ids and registration sequence numbers.
    next_id: AtomicU64,
    /// Live subscription count.
    active: AtomicUsize,
}

impl<T> SubscriberRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: EventIndex::new(),
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
        }
    }

    /// The underlying event type index.
    #[must_use]
    pub fn index(&self) -> &EventIndex<T> {
        &self.index
    }

    /// Register `subscriber` for `event_type`.
    ///
    /// The subscription is placed after every existing subscription with a
    /// priority greater than or equal to its own.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidSubscription`] if the subscriber name is
    /// empty or the event type was not issued by this registry.
    pub fn subscribe(
        &self,
        event_type: EventType,
        subscriber: Subscriber<T>,
        options: SubscribeOptions<T>,
    ) -> Result<SubscriptionHandle, BusError> {
        if subscriber.name().trim().is_empty() {
            return Err(BusError::InvalidSubscription(
                "Subscriber name cannot be empty".to_string(),
            ));
        }
        let slot = self.index.slot(event_type).ok_or_else(|| {
            BusError::InvalidSubscription(format!(
                "Event type {} was not issued by this bus",
                event_type
            ))
        })?;

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = SubscriptionId(seq);
        let subscription = Arc::new(Subscription {
            id,
            event_type,
            subscriber,
            priority: options.priority,
            mode: options.mode,
            filter: options.filter,
            seq,
        });

        let previous =
            slot.list
                .rcu(|current| current.with_inserted(Arc::clone(&subscription)));
        self.active.fetch_add(1, Ordering::Relaxed);
        metrics::record_subscription();

        debug!(
            event_type = %slot.name,
            subscription = %id,
            subscriber = %subscription.subscriber.name(),
            priority = subscription.priority,
            mode = subscription.mode.as_str(),
            generation = previous.generation() + 1,
            "Subscribed"
        );

        Ok(SubscriptionHandle { id, event_type })
    }

    /// Remove a subscription.
    ///
    /// Returns `true` if it was removed by this call. Removing an already
    /// removed subscription is a no-op returning `false`.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let Some(slot) = self.index.slot(handle.event_type) else {
            return false;
        };
        if !slot.list.load().contains(handle.id) {
            return false;
        }

        let previous = slot.list.rcu(|current| {
            if current.contains(handle.id) {
                Arc::new(current.without(|s| s.id == handle.id))
            } else {
                Arc::clone(current)
            }
        });

        let removed = previous.contains(handle.id);
        if removed {
            self.active.fetch_sub(1, Ordering::Relaxed);
            metrics::record_unsubscription(1);
            debug!(
                event_type = %slot.name,
                subscription = %handle.id,
                "Unsubscribed"
            );
        }
        removed
    }

    /// Remove every subscription registered under `subscriber_name`.
    ///
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe_all(&self, subscriber_name: &str) -> usize {
        let mut total = 0;

        for slot in self.index.slots().iter() {
            if !slot
                .list
                .load()
                .iter()
                .any(|s| s.subscriber.name() == subscriber_name)
            {
                continue;
            }

            let previous = slot.list.rcu(|current| {
                Arc::new(current.without(|s| s.subscriber.name() == subscriber_name))
            });
            total += previous
                .iter()
                .filter(|s| s.subscriber.name() == subscriber_name)
                .count();
        }

        if total > 0 {
            self.active.fetch_sub(total, Ordering::Relaxed);
            metrics::record_unsubscription(total);
        }
        debug!(subscriber = %subscriber_name, removed = total, "Unsubscribed from all event types");
        total
    }

    /// Current subscriber list generation for `event_type`.
    ///
    /// O(1): lists are rebuilt when mutated, not when read.
    #[must_use]
    pub fn snapshot(&self, event_type: EventType) -> Option<Arc<SubscriberList<T>>> {
        self.index.resolve(event_type)
    }

    /// Number of subscriptions for an event type.
    #[must_use]
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.snapshot(event_type).map(|l| l.len()).unwrap_or(0)
    }

    /// Total number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

impl<T> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
