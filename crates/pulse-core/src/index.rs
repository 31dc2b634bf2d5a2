//! Primitive index from event types to subscriber lists.
//!
//! Names are interned once into dense [`EventType`] ids. Each id owns a slot
//! in a table that is itself published copy-on-write, so `resolve` is a pinned
//! pointer load plus a vector index: no hashing, no locks, no allocation.
//!
//! ```text
//!   "order:created" ──(DashMap, registration only)──▶ EventType #3
//!
//!   slots: ArcSwap<Vec<Arc<Slot>>>
//!     [0] ─▶ ArcSwap<SubscriberList gen 4>
//!     [1] ─▶ ArcSwap<SubscriberList gen 1>
//!     [2] ─▶ ArcSwap<SubscriberList gen 0>
//!     [3] ─▶ ArcSwap<SubscriberList gen 2>   ◀── resolve(#3)
//! ```

use crate::event::{next_bus_id, validate_event_type_name, EventType};
use crate::registry::SubscriberList;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Per-type slot holding the current subscriber list generation.
pub(crate) struct Slot<T> {
    pub(crate) name: Arc<str>,
    pub(crate) list: ArcSwap<SubscriberList<T>>,
}

/// Event type index.
pub struct EventIndex<T> {
    /// Identity stamped into every issued `EventType`.
    bus: u64,
    /// Name to id, consulted only when registering or publishing by name.
    names: DashMap<Arc<str>, EventType>,
    /// Slot table indexed by `EventType`.
    slots: ArcSwap<Vec<Arc<Slot<T>>>>,
    /// Serializes slot table growth.
    grow: Mutex<()>,
}

impl<T> EventIndex<T> {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bus: next_bus_id(),
            names: DashMap::new(),
            slots: ArcSwap::from_pointee(Vec::new()),
            grow: Mutex::new(()),
        }
    }

    /// Intern an event type name, allocating its slot on first use.
    ///
    /// # Errors
    ///
    /// Returns an error message if the name is invalid or the id space is
    /// exhausted.
    pub fn register(&self, name: &str) -> Result<EventType, &'static str> {
        validate_event_type_name(name)?;

        if let Some(id) = self.names.get(name) {
            return Ok(*id);
        }

        let _guard = self.grow.lock();
        if let Some(id) = self.names.get(name) {
            return Ok(*id);
        }

        let current = self.slots.load_full();
        let raw = u32::try_from(current.len()).map_err(|_| "Too many event types")?;
        let event_type = EventType::new(self.bus, raw);
        let name: Arc<str> = Arc::from(name);

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::new(Slot {
            name: Arc::clone(&name),
            list: ArcSwap::from_pointee(SubscriberList::empty()),
        }));
        // Slot must be visible before the name can be resolved to it.
        self.slots.store(Arc::new(next));
        self.names.insert(Arc::clone(&name), event_type);

        debug!(event_type = %event_type, name = %name, "Registered event type");
        Ok(event_type)
    }

    /// Identity of this index, shared by every `EventType` it issues.
    #[must_use]
    pub fn bus_id(&self) -> u64 {
        self.bus
    }

    /// Look up an already registered name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<EventType> {
        self.names.get(name).map(|id| *id)
    }

    /// Resolve the current subscriber list for an event type.
    ///
    /// Returns `None` if the type was never registered on this index.
    #[inline]
    #[must_use]
    pub fn resolve(&self, event_type: EventType) -> Option<Arc<SubscriberList<T>>> {
        if event_type.bus() != self.bus {
            return None;
        }
        self.slots
            .load()
            .get(event_type.index())
            .map(|slot| slot.list.load_full())
    }

    /// Name of a registered event type.
    #[must_use]
    pub fn name_of(&self, event_type: EventType) -> Option<Arc<str>> {
        if event_type.bus() != self.bus {
            return None;
        }
        self.slots
            .load()
            .get(event_type.index())
            .map(|slot| Arc::clone(&slot.name))
    }

    /// Whether an event type was issued by this index.
    #[must_use]
    pub fn contains(&self, event_type: EventType) -> bool {
        event_type.bus() == self.bus && event_type.index() < self.slots.load().len()
    }

    /// Number of registered event types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.load().len()
    }

    /// Whether no event type has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn slot(&self, event_type: EventType) -> Option<Arc<Slot<T>>> {
        if event_type.bus() != self.bus {
            return None;
        }
        self.slots.load().get(event_type.index()).cloned()
    }

    pub(crate) fn slots(&self) -> Arc<Vec<Arc<Slot<T>>>> {
        self.slots.load_full()
    }
}

impl<T> Default for EventIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}
