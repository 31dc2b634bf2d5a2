//! Event types for Pulse.
//!
//! An [`Event`] is the unit handed to subscribers. Event types are interned
//! into dense [`EventType`] ids so the dispatch path never hashes strings.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum event type name length.
pub const MAX_EVENT_TYPE_NAME_LENGTH: usize = 256;

/// A unique event identifier.
pub type EventId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique event ID.
#[must_use]
pub fn generate_event_id() -> EventId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Validate an event type name.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_event_type_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Event type name cannot be empty");
    }
    if name.len() > MAX_EVENT_TYPE_NAME_LENGTH {
        return Err("Event type name too long");
    }
    if name.starts_with('$') {
        return Err("Event type names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Event type name contains invalid characters");
    }
    Ok(())
}

/// Source of bus identities stamped into every [`EventType`].
static BUS_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique bus identity. Zero is never issued.
pub(crate) fn next_bus_id() -> u64 {
    BUS_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Dense identifier of an interned event type.
///
/// Issued by a bus on first registration of a name and valid only on that
/// bus: the id carries the identity of the bus that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType {
    bus: u64,
    raw: u32,
}

impl EventType {
    #[inline]
    pub(crate) const fn new(bus: u64, raw: u32) -> Self {
        Self { bus, raw }
    }

    /// Raw index of this type within its bus.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.raw
    }

    #[inline]
    pub(crate) fn bus(self) -> u64 {
        self.bus
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.raw as usize
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.raw)
    }
}

/// A published event.
#[derive(Debug, Clone)]
pub struct Event<T> {
    /// Unique event identifier.
    pub id: EventId,
    /// Type the event was published under.
    pub event_type: EventType,
    /// Event payload.
    pub payload: T,
    /// Milliseconds since the UNIX epoch at creation.
    pub timestamp: u64,
}

impl<T> Event<T> {
    /// Create a new event.
    #[must_use]
    pub fn new(event_type: EventType, payload: T) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            payload,
            timestamp: now_millis(),
        }
    }

    /// Get the payload.
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }
}
