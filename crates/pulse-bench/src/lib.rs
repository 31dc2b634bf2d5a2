//! Shared fixtures for the Pulse benchmarks.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tenvis_pulse_core::{
    BackpressurePolicy, BusConfig, BusError, Event, EventBus, EventType, SubscribeOptions,
    Subscriber,
};

/// Event type used by every benchmark.
pub const BENCH_EVENT: &str = "bench:event";

/// A payload of `size` zero bytes.
pub fn payload(size: usize) -> Bytes {
    Bytes::from(vec![0u8; size])
}

/// A bus that only delivers inline.
///
/// # Errors
///
/// Returns an error if the bus cannot be built.
pub fn sync_bus() -> Result<EventBus<Bytes>, BusError> {
    EventBus::with_config(BusConfig::default().with_workers(0))
}

/// A bus with `workers` delivery threads and a blocking queue.
///
/// # Errors
///
/// Returns an error if a worker thread cannot be spawned.
pub fn async_bus(workers: usize, capacity: usize) -> Result<EventBus<Bytes>, BusError> {
    EventBus::with_config(
        BusConfig::default()
            .with_workers(workers)
            .with_queue_capacity(capacity)
            .with_backpressure(BackpressurePolicy::Block),
    )
}

/// Subscriber that counts deliveries.
pub fn counting_subscriber(name: impl Into<Arc<str>>, counter: &Arc<AtomicU64>) -> Subscriber<Bytes> {
    let counter = Arc::clone(counter);
    Subscriber::from_fn(name, move |_: &Event<Bytes>| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })
}

/// Subscribe `count` counting subscribers to [`BENCH_EVENT`].
///
/// # Errors
///
/// Propagates subscription failures from the bus.
pub fn fan_out(
    bus: &EventBus<Bytes>,
    count: usize,
    asynchronous: bool,
    counter: &Arc<AtomicU64>,
) -> Result<EventType, BusError> {
    let event_type = bus.register(BENCH_EVENT)?;
    for i in 0..count {
        let options = if asynchronous {
            SubscribeOptions::new().asynchronous()
        } else {
            SubscribeOptions::new()
        };
        bus.subscribe(
            event_type,
            counting_subscriber(format!("sub-{}", i), counter),
            options.priority((i % 8) as i32),
        )?;
    }
    Ok(event_type)
}
