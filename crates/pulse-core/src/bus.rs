//! The event bus.
//!
//! [`EventBus`] ties the registry, dispatcher, delivery queue and worker pool
//! together behind `subscribe` / `unsubscribe` / `publish` / `shutdown`.

use crate::config::{BusConfig, ShutdownMode};
use crate::dispatch::{in_handler, Dispatcher, PublishReport, Reporter};
use crate::error::{BusError, SubscriberInvocationError};
use crate::event::{Event, EventType};
use crate::lifecycle::{BusState, Lifecycle};
use crate::queue::DeliveryQueue;
use crate::registry::{SubscriberList, SubscriberRegistry};
use crate::subscription::{DeliveryMode, SubscribeOptions, Subscriber, SubscriptionHandle};
use crate::worker::WorkerPool;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    /// Live async delivery workers.
    pub workers: usize,
    /// Number of registered event types.
    pub event_types: usize,
    /// Number of live subscriptions.
    pub subscriptions: usize,
    /// Async work items currently queued.
    pub queued: usize,
    /// Events published.
    pub published: u64,
    /// Successful handler invocations, sync and async.
    pub delivered: u64,
    /// Failed handler invocations, sync and async.
    pub failed: u64,
    /// Async work items rejected by backpressure.
    pub rejected: u64,
    /// Async work items evicted by `drop_oldest`.
    pub evicted: u64,
    /// Async work items dropped by a discarding shutdown.
    pub discarded: u64,
}

/// A concurrent in-process event bus.
///
/// Publishing never takes a lock: the subscriber list for the event type is
/// pinned from an atomically swapped snapshot, sync handlers run inline and
/// async handlers are queued to the worker pool.
///
/// Dropping a running bus shuts it down with the configured
/// [`ShutdownMode`].
pub struct EventBus<T: Send + Sync + 'static> {
    dispatcher: Dispatcher<T>,
    workers: Option<WorkerPool>,
    lifecycle: Lifecycle,
    errors: Receiver<SubscriberInvocationError>,
    config: BusConfig,
}

impl<T: Send + Sync + 'static> EventBus<T> {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new() -> Result<Self, BusError> {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a worker thread
    /// cannot be spawned.
    pub fn with_config(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        info!("Creating event bus with config: {:?}", config);

        let (errors_tx, errors) = bounded(config.error_channel_capacity);
        let reporter = Arc::new(Reporter::new(errors_tx));

        let (queue, workers) = if config.worker_count > 0 {
            let queue = DeliveryQueue::new(
                config.worker_count,
                config.queue_capacity,
                config.backpressure,
                config.block_timeout(),
            );
            let workers = WorkerPool::spawn(&queue, Arc::clone(&reporter))?;
            (Some(queue), Some(workers))
        } else {
            (None, None)
        };

        Ok(Self {
            dispatcher: Dispatcher::new(SubscriberRegistry::new(), queue, reporter),
            workers,
            lifecycle: Lifecycle::new(),
            errors,
            config,
        })
    }

    /// The configuration this bus was built with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> BusState {
        self.lifecycle.state()
    }

    /// Whether the bus accepts publishes and subscriptions.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == BusState::Running
    }

    /// Intern an event type name.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidSubscription`] if the name is invalid.
    pub fn register(&self, name: &str) -> Result<EventType, BusError> {
        self.dispatcher
            .registry
            .index()
            .register(name)
            .map_err(|reason| BusError::InvalidSubscription(reason.to_string()))
    }

    /// Look up an event type without registering it.
    #[must_use]
    pub fn event_type(&self, name: &str) -> Option<EventType> {
        self.dispatcher.registry.index().lookup(name)
    }

    /// Subscribe to an event type.
    ///
    /// # Errors
    ///
    /// - [`BusError::ShutdownInProgress`] after `shutdown`
    /// - [`BusError::InvalidSubscription`] for an empty subscriber name, an
    ///   event type not issued by this bus, or async delivery on a bus with
    ///   no workers
    pub fn subscribe(
        &self,
        event_type: EventType,
        subscriber: Subscriber<T>,
        options: SubscribeOptions<T>,
    ) -> Result<SubscriptionHandle, BusError> {
        let _active = self.lifecycle.enter()?;

        if options.mode == DeliveryMode::Async && self.workers.is_none() {
            return Err(BusError::InvalidSubscription(
                "Async delivery requires worker_count > 0".to_string(),
            ));
        }

        self.dispatcher
            .registry
            .subscribe(event_type, subscriber, options)
    }

    /// Register `name` if needed and subscribe to it.
    ///
    /// # Errors
    ///
    /// See [`EventBus::register`] and [`EventBus::subscribe`].
    pub fn subscribe_to(
        &self,
        name: &str,
        subscriber: Subscriber<T>,
        options: SubscribeOptions<T>,
    ) -> Result<SubscriptionHandle, BusError> {
        let _active = self.lifecycle.enter()?;
        let event_type = self.register(name)?;
        self.subscribe(event_type, subscriber, options)
    }

    /// Remove a subscription.
    ///
    /// Returns `true` if this call removed it; a second call is a no-op
    /// returning `false`. Dispatches already in flight may still invoke the
    /// subscription, and its queued async work still runs.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.dispatcher.registry.unsubscribe(handle)
    }

    /// Remove every subscription registered under `subscriber_name`.
    pub fn unsubscribe_all(&self, subscriber_name: &str) -> usize {
        self.dispatcher.registry.unsubscribe_all(subscriber_name)
    }

    /// Publish an event.
    ///
    /// Sync subscribers have run by the time this returns. Handler failures
    /// are reported in the returned [`PublishReport`], never as `Err`.
    ///
    /// # Errors
    ///
    /// - [`BusError::ShutdownInProgress`] after `shutdown`
    /// - [`BusError::UnknownEventType`] if the event type came from another
    ///   bus
    pub fn publish(&self, event: Event<T>) -> Result<PublishReport, BusError> {
        let _active = self.lifecycle.enter()?;
        if !self.dispatcher.registry.index().contains(event.event_type) {
            return Err(BusError::UnknownEventType(event.event_type));
        }
        Ok(self.dispatcher.dispatch(event))
    }

    /// Publish `payload` under `event_type`.
    ///
    /// # Errors
    ///
    /// See [`EventBus::publish`].
    pub fn emit(&self, event_type: EventType, payload: T) -> Result<PublishReport, BusError> {
        self.publish(Event::new(event_type, payload))
    }

    /// Publish `payload` under a type name.
    ///
    /// A name nobody ever registered has no subscribers: the call returns an
    /// empty report without registering the name.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ShutdownInProgress`] after `shutdown`.
    pub fn publish_to(&self, name: &str, payload: T) -> Result<PublishReport, BusError> {
        match self.event_type(name) {
            Some(event_type) => self.emit(event_type, payload),
            None => {
                let _active = self.lifecycle.enter()?;
                Ok(PublishReport::default())
            }
        }
    }

    /// Current subscriber list for an event type.
    #[must_use]
    pub fn snapshot(&self, event_type: EventType) -> Option<Arc<SubscriberList<T>>> {
        self.dispatcher.registry.snapshot(event_type)
    }

    /// Number of subscriptions for an event type.
    #[must_use]
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.dispatcher.registry.subscriber_count(event_type)
    }

    /// Receiver for the collected-errors channel.
    ///
    /// Every handler failure, sync or async, is pushed here. When the channel
    /// is full, further reports are dropped and counted in metrics.
    #[must_use]
    pub fn errors(&self) -> Receiver<SubscriberInvocationError> {
        self.errors.clone()
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let counters = &self.dispatcher.reporter.counters;
        BusStats {
            workers: self.workers.as_ref().map_or(0, |w| w.len()),
            event_types: self.dispatcher.registry.index().len(),
            subscriptions: self.dispatcher.registry.subscription_count(),
            queued: self.dispatcher.queue.as_ref().map_or(0, |q| q.len()),
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Shut down with the configured [`ShutdownMode`].
    ///
    /// # Errors
    ///
    /// See [`EventBus::shutdown_with`].
    pub fn shutdown(&self) -> Result<(), BusError> {
        self.shutdown_with(self.config.shutdown)
    }

    /// Stop accepting publishes and subscriptions, wait for in-flight
    /// publishes, then drain or discard queued async work and join the
    /// workers.
    ///
    /// Calling it again after shutdown has begun is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ReentrantShutdown`] if called from inside one of
    /// this bus's handlers, where waiting for in-flight work would deadlock.
    /// Handlers of other buses may shut this one down.
    pub fn shutdown_with(&self, mode: ShutdownMode) -> Result<(), BusError> {
        if in_handler(self.dispatcher.registry.index().bus_id()) {
            return Err(BusError::ReentrantShutdown);
        }
        if !self.lifecycle.begin_shutdown() {
            debug!("Shutdown already in progress");
            return Ok(());
        }

        info!(mode = ?mode, "Shutting down event bus");
        self.lifecycle.wait_idle();

        if let Some(workers) = &self.workers {
            workers.stop(mode);
        }
        self.lifecycle.finish();

        let stats = self.stats();
        info!(
            published = stats.published,
            delivered = stats.delivered,
            failed = stats.failed,
            rejected = stats.rejected,
            discarded = stats.discarded,
            "Event bus stopped"
        );
        Ok(())
    }
}

impl<T: Send + Sync + 'static> Drop for EventBus<T> {
    fn drop(&mut self) {
        if self.lifecycle.state() == BusState::Running {
            if let Err(err) = self.shutdown() {
                warn!(error = %err, "Event bus dropped without clean shutdown");
            }
        }
    }
}
