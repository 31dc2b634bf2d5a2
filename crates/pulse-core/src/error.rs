//! Error types for the event bus.
//!
//! Registration and queue failures propagate to the caller as typed results.
//! Handler failures never do: they are captured as
//! [`SubscriberInvocationError`] values and reported out of band.

use crate::config::{BackpressurePolicy, ConfigError};
use crate::event::{EventId, EventType};
use crate::subscription::{DeliveryMode, SubscriptionId};
use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Registration input was rejected before insertion.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// An async work item could not be enqueued.
    #[error(transparent)]
    QueueSaturated(#[from] QueueSaturationError),

    /// The event type was issued by a different bus.
    #[error("Event type {0} was not issued by this bus")]
    UnknownEventType(EventType),

    /// The bus is shutting down or already stopped.
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// `shutdown` was called from inside a handler.
    #[error("Shutdown cannot be requested from inside a handler")]
    ReentrantShutdown,

    /// A worker thread could not be spawned.
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a handler invocation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The handler returned an error.
    Failed(String),
    /// The handler panicked.
    Panicked(String),
    /// The filter predicate panicked.
    FilterPanicked(String),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Failed(msg) => write!(f, "returned error: {msg}"),
            FailureCause::Panicked(msg) => write!(f, "panicked: {msg}"),
            FailureCause::FilterPanicked(msg) => write!(f, "filter panicked: {msg}"),
        }
    }
}

/// A handler failed while processing an event.
///
/// Isolated per subscriber: the failure is reported but never aborts dispatch
/// to the remaining subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Subscriber '{subscriber}' ({subscription}) failed on event {event_id} of type {event_type}: {cause}")]
pub struct SubscriberInvocationError {
    /// The failing subscription.
    pub subscription: SubscriptionId,
    /// Subscriber name.
    pub subscriber: Arc<str>,
    /// Type of the event being delivered.
    pub event_type: EventType,
    /// Id of the event being delivered.
    pub event_id: EventId,
    /// How the event was being delivered.
    pub mode: DeliveryMode,
    /// What went wrong.
    pub cause: FailureCause,
}

/// An async work item was rejected by the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Queue saturated for subscriber '{subscriber}' ({subscription}) on event {event_id}: {policy:?} policy rejected the item")]
pub struct QueueSaturationError {
    /// The subscription whose work item was rejected.
    pub subscription: SubscriptionId,
    /// Subscriber name.
    pub subscriber: Arc<str>,
    /// Id of the rejected event.
    pub event_id: EventId,
    /// Policy in force when the item was rejected.
    pub policy: BackpressurePolicy,
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
