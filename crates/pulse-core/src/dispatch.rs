//! Dispatch engine.
//!
//! Resolves the subscriber list for a published event and walks it in
//! snapshot order. Sync subscriptions run inline on the publishing thread;
//! async ones become [`WorkItem`]s on the delivery queue. Every call into
//! subscriber code (filters included) goes through a failure boundary that
//! turns an `Err` or a panic into a [`SubscriberInvocationError`].

use crate::error::{
    panic_message, FailureCause, QueueSaturationError, SubscriberInvocationError,
};
use crate::event::Event;
use crate::metrics;
use crate::queue::{DeliveryQueue, Enqueued, WorkItem};
use crate::registry::SubscriberRegistry;
use crate::subscription::{DeliveryMode, Subscription};
use crate::BusError;
use crossbeam_channel::{Sender, TrySendError};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

thread_local! {
    /// Buses whose subscriber code is running on this thread, innermost last.
    static ACTIVE_HANDLERS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Whether the current thread is running subscriber code of bus `bus`.
pub(crate) fn in_handler(bus: u64) -> bool {
    ACTIVE_HANDLERS.with(|active| active.borrow().contains(&bus))
}

struct HandlerScope;

impl HandlerScope {
    fn enter(bus: u64) -> Self {
        ACTIVE_HANDLERS.with(|active| active.borrow_mut().push(bus));
        HandlerScope
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        ACTIVE_HANDLERS.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

fn invocation_error<T>(
    subscription: &Subscription<T>,
    event: &Event<T>,
    cause: FailureCause,
) -> SubscriberInvocationError {
    SubscriberInvocationError {
        subscription: subscription.id,
        subscriber: Arc::clone(subscription.subscriber.shared_name()),
        event_type: event.event_type,
        event_id: event.id,
        mode: subscription.mode,
        cause,
    }
}

/// Evaluate the subscription's filter inside a failure boundary.
pub(crate) fn passes_filter<T: 'static>(
    subscription: &Subscription<T>,
    event: &Event<T>,
) -> Result<bool, SubscriberInvocationError> {
    let Some(filter) = subscription.filter.as_ref() else {
        return Ok(true);
    };

    let _scope = HandlerScope::enter(subscription.event_type.bus());
    panic::catch_unwind(AssertUnwindSafe(|| filter(event))).map_err(|payload| {
        invocation_error(
            subscription,
            event,
            FailureCause::FilterPanicked(panic_message(payload.as_ref())),
        )
    })
}

/// Invoke the subscription's handler inside a failure boundary.
pub(crate) fn invoke<T: 'static>(
    subscription: &Subscription<T>,
    event: &Event<T>,
) -> Result<(), SubscriberInvocationError> {
    let _scope = HandlerScope::enter(subscription.event_type.bus());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        subscription.subscriber.handler().handle(event)
    }));

    let cause = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => FailureCause::Failed(err.to_string()),
        Err(payload) => FailureCause::Panicked(panic_message(payload.as_ref())),
    };
    Err(invocation_error(subscription, event, cause))
}

/// Delivery counters shared by publishers and workers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) published: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) discarded: AtomicU64,
}

/// Sink for delivery outcomes: counters, metrics, logs and the
/// collected-errors channel.
pub(crate) struct Reporter {
    pub(crate) counters: Counters,
    errors: Sender<SubscriberInvocationError>,
}

impl Reporter {
    pub(crate) fn new(errors: Sender<SubscriberInvocationError>) -> Self {
        Self {
            counters: Counters::default(),
            errors,
        }
    }

    pub(crate) fn delivered(&self, mode: DeliveryMode) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::record_delivery(mode.as_str());
    }

    pub(crate) fn failed(&self, error: &SubscriberInvocationError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_failure(error.mode.as_str());
        warn!(
            subscription = %error.subscription,
            subscriber = %error.subscriber,
            event_type = %error.event_type,
            event_id = error.event_id,
            mode = error.mode.as_str(),
            cause = %error.cause,
            "Subscriber invocation failed"
        );

        match self.errors.try_send(error.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::record_error_dropped();
                trace!(subscription = %error.subscription, "Error channel full, dropping report");
            }
            // All receivers are owned by the bus, so this only happens mid-drop.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(crate) fn rejected(&self, error: &QueueSaturationError) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            subscription = %error.subscription,
            subscriber = %error.subscriber,
            event_id = error.event_id,
            policy = error.policy.as_str(),
            "Async delivery rejected"
        );
    }

    pub(crate) fn evicted(&self, count: u64) {
        self.counters.evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn discarded(&self, count: u64) {
        self.counters.discarded.fetch_add(count, Ordering::Relaxed);
        metrics::record_discarded(count);
    }
}

/// Outcome of one `publish` call.
#[must_use = "queue rejections are only reported here"]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscriptions in the resolved snapshot.
    pub matched: usize,
    /// Subscriptions skipped by their filter.
    pub filtered: usize,
    /// Sync handlers that completed successfully.
    pub invoked: usize,
    /// Async work items accepted by the queue.
    pub enqueued: usize,
    /// Older queued work items evicted to make room (`drop_oldest`).
    pub evicted: u64,
    /// Sync handler and filter failures, in dispatch order.
    pub failures: Vec<SubscriberInvocationError>,
    /// Async work items rejected by the backpressure policy.
    pub rejected: Vec<QueueSaturationError>,
}

impl PublishReport {
    /// Whether nothing failed and nothing was rejected.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.rejected.is_empty()
    }

    /// Surface the first queue rejection as an error.
    ///
    /// Handler failures are not errors for the publisher and are kept in the
    /// report.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::QueueSaturated`] if any async item was rejected.
    pub fn into_result(mut self) -> Result<Self, BusError> {
        if self.rejected.is_empty() {
            Ok(self)
        } else {
            Err(BusError::QueueSaturated(self.rejected.swap_remove(0)))
        }
    }
}

/// Walks subscriber snapshots and routes each subscription to inline or
/// queued delivery.
pub(crate) struct Dispatcher<T> {
    pub(crate) registry: SubscriberRegistry<T>,
    pub(crate) queue: Option<DeliveryQueue<T>>,
    pub(crate) reporter: Arc<Reporter>,
}

impl<T: 'static> Dispatcher<T> {
    pub(crate) fn new(
        registry: SubscriberRegistry<T>,
        queue: Option<DeliveryQueue<T>>,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            registry,
            queue,
            reporter,
        }
    }

    /// Deliver `event` to every subscription of its type.
    pub(crate) fn dispatch(&self, event: Event<T>) -> PublishReport {
        self.reporter
            .counters
            .published
            .fetch_add(1, Ordering::Relaxed);
        metrics::record_publish();

        let list = match self.registry.snapshot(event.event_type) {
            Some(list) if !list.is_empty() => list,
            _ => return PublishReport::default(),
        };

        let mut report = PublishReport {
            matched: list.len(),
            ..PublishReport::default()
        };
        let event = Arc::new(event);

        for subscription in list.iter() {
            match passes_filter(subscription, &event) {
                Ok(true) => {}
                Ok(false) => {
                    report.filtered += 1;
                    continue;
                }
                Err(err) => {
                    self.reporter.failed(&err);
                    report.failures.push(err);
                    continue;
                }
            }

            match (subscription.mode, self.queue.as_ref()) {
                (DeliveryMode::Async, Some(queue)) => {
                    let item = WorkItem::new(Arc::clone(&event), Arc::clone(subscription));
                    match queue.push(item) {
                        Ok(Enqueued::Accepted) => report.enqueued += 1,
                        Ok(Enqueued::Evicted(count)) => {
                            report.enqueued += 1;
                            report.evicted += count;
                            self.reporter.evicted(count);
                        }
                        Err(err) => {
                            self.reporter.rejected(&err);
                            report.rejected.push(err);
                        }
                    }
                }
                // Async subscriptions are refused at registration when there
                // is no worker pool, so only sync ones reach this arm.
                (_, _) => match invoke(subscription, &event) {
                    Ok(()) => {
                        report.invoked += 1;
                        self.reporter.delivered(DeliveryMode::Sync);
                    }
                    Err(err) => {
                        self.reporter.failed(&err);
                        report.failures.push(err);
                    }
                },
            }
        }

        trace!(
            event_type = %event.event_type,
            event_id = event.id,
            generation = list.generation(),
            matched = report.matched,
            invoked = report.invoked,
            enqueued = report.enqueued,
            "Published event"
        );
        report
    }
}
