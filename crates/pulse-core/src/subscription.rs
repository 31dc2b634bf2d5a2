//! Subscriptions: who listens to an event type, how, and in what order.

use crate::error::HandlerError;
use crate::event::{Event, EventType};
use std::fmt;
use std::sync::Arc;

/// Unique subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// How a subscriber receives events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMode {
    /// Invoked inline on the publishing thread.
    #[default]
    Sync,
    /// Queued and invoked by the worker pool.
    Async,
}

impl DeliveryMode {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Sync => "sync",
            DeliveryMode::Async => "async",
        }
    }
}

/// Something that handles events of payload type `T`.
///
/// Handlers run either on the publishing thread or on a worker thread, so
/// they must be `Send + Sync`. A returned error or a panic is reported as a
/// [`SubscriberInvocationError`](crate::SubscriberInvocationError) and does not
/// affect other subscribers.
pub trait Handler<T>: Send + Sync + 'static {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Any error is captured and reported; it never reaches the publisher.
    fn handle(&self, event: &Event<T>) -> Result<(), HandlerError>;
}

/// Adapter turning a closure into a [`Handler`].
struct FnHandler<F>(F);

impl<T, F> Handler<T> for FnHandler<F>
where
    F: Fn(&Event<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, event: &Event<T>) -> Result<(), HandlerError> {
        (self.0)(event)
    }
}

/// A named handler.
pub struct Subscriber<T> {
    name: Arc<str>,
    handler: Arc<dyn Handler<T>>,
}

impl<T> Subscriber<T> {
    /// Create a subscriber from a handler implementation.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, handler: impl Handler<T>) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
        }
    }

    /// Create a subscriber from an already shared handler.
    #[must_use]
    pub fn from_arc(name: impl Into<Arc<str>>, handler: Arc<dyn Handler<T>>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    /// Create a subscriber from a closure.
    #[must_use]
    pub fn from_fn<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        T: 'static,
        F: Fn(&Event<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::new(name, FnHandler(f))
    }

    /// Get the subscriber name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn handler(&self) -> &dyn Handler<T> {
        self.handler.as_ref()
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("name", &self.name).finish()
    }
}

/// Predicate deciding whether a subscription sees an event.
pub type Filter<T> = Arc<dyn Fn(&Event<T>) -> bool + Send + Sync>;

/// Options for a new subscription.
pub struct SubscribeOptions<T> {
    pub(crate) priority: i32,
    pub(crate) mode: DeliveryMode,
    pub(crate) filter: Option<Filter<T>>,
}

impl<T> SubscribeOptions<T> {
    /// Sync delivery, priority 0, no filter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            priority: 0,
            mode: DeliveryMode::Sync,
            filter: None,
        }
    }

    /// Set the priority. Higher priorities are invoked first.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the delivery mode.
    #[must_use]
    pub fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Shorthand for `mode(DeliveryMode::Async)`.
    #[must_use]
    pub fn asynchronous(self) -> Self {
        self.mode(DeliveryMode::Async)
    }

    /// Only deliver events for which `filter` returns `true`.
    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event<T>) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl<T> Default for SubscribeOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered interest in an event type.
///
/// Immutable once created; shared between subscriber list generations and
/// queued work items.
pub struct Subscription<T> {
    pub(crate) id: SubscriptionId,
    pub(crate) event_type: EventType,
    pub(crate) subscriber: Subscriber<T>,
    pub(crate) priority: i32,
    pub(crate) mode: DeliveryMode,
    pub(crate) filter: Option<Filter<T>>,
    /// Registration sequence, the tie-break for equal priorities.
    pub(crate) seq: u64,
}

impl<T> Subscription<T> {
    /// Subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Event type this subscription listens to.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Subscriber name.
    #[must_use]
    pub fn subscriber_name(&self) -> &str {
        self.subscriber.name()
    }

    /// Priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Delivery mode.
    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Whether a filter is attached.
    #[must_use]
    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Sort key: priority descending, then registration order.
    pub(crate) fn sort_key(&self) -> (std::cmp::Reverse<i32>, u64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("subscriber", &self.subscriber.name())
            .field("priority", &self.priority)
            .field("mode", &self.mode)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub(crate) id: SubscriptionId,
    pub(crate) event_type: EventType,
}

impl SubscriptionHandle {
    /// Subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Event type the subscription belongs to.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }
}
