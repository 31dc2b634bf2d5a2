//! # pulse-core
//!
//! A concurrent, in-process event bus for the Pulse engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Index** - Interned event types mapped to subscriber lists, lock-free reads
//! - **Registry** - Copy-on-write subscriber lists ordered by priority
//! - **Dispatch** - Inline delivery with per-subscriber failure isolation
//! - **Queue** - Bounded sharded queues with configurable backpressure
//! - **Bus** - The public `subscribe` / `unsubscribe` / `publish` / `shutdown` surface
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Publisher  │────▶│  Dispatch   │────▶│    Index    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │               │ snapshot
//!                  sync  │       │ async         ▼
//!                        ▼       ▼        ┌─────────────┐
//!                   handler   ┌───────┐   │  Registry   │
//!                             │ Queue │   └─────────────┘
//!                             └───────┘
//!                                 │
//!                                 ▼
//!                          worker ─▶ handler
//! ```
//!
//! ## Example
//!
//! ```
//! use tenvis_pulse_core::{BusConfig, Event, EventBus, SubscribeOptions, Subscriber};
//!
//! let bus: EventBus<String> = EventBus::with_config(BusConfig::default().with_workers(1)).unwrap();
//!
//! bus.subscribe_to(
//!     "user:login",
//!     Subscriber::from_fn("audit", |event: &Event<String>| {
//!         println!("login: {}", event.payload);
//!         Ok(())
//!     }),
//!     SubscribeOptions::new().priority(10),
//! )
//! .unwrap();
//!
//! let report = bus.publish_to("user:login", "alice".to_string()).unwrap();
//! assert_eq!(report.invoked, 1);
//! bus.shutdown().unwrap();
//! ```

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod index;
pub mod lifecycle;
pub mod metrics;
mod queue;
pub mod registry;
pub mod subscription;
mod worker;

pub use bus::{BusStats, EventBus};
pub use config::{BackpressurePolicy, BusConfig, ConfigError, ShutdownMode};
pub use dispatch::PublishReport;
pub use error::{
    BusError, FailureCause, HandlerError, QueueSaturationError, SubscriberInvocationError,
};
pub use event::{Event, EventId, EventType};
pub use index::EventIndex;
pub use lifecycle::BusState;
pub use registry::{SubscriberList, SubscriberRegistry};
pub use subscription::{
    DeliveryMode, Filter, Handler, SubscribeOptions, Subscriber, Subscription,
    SubscriptionHandle, SubscriptionId,
};
