//! End-to-end behaviour of the event bus.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tenvis_pulse_core::{
    BackpressurePolicy, BusConfig, BusError, Event, EventBus, FailureCause, ShutdownMode,
    SubscribeOptions, Subscriber,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tenvis_pulse_core=debug")
        .with_test_writer()
        .try_init();
}

/// Holds the single worker inside a handler until released.
struct Gate {
    started: Receiver<()>,
    release: Sender<()>,
}

impl Gate {
    fn install(bus: &EventBus<u32>) -> Self {
        let (started_tx, started) = bounded(1);
        let (release, release_rx) = bounded::<()>(0);
        bus.subscribe_to(
            "gate",
            Subscriber::from_fn("gate", move |_: &Event<u32>| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            }),
            SubscribeOptions::new().asynchronous(),
        )
        .unwrap();
        Self { started, release }
    }

    /// Occupy the worker and wait until it is blocked.
    fn close(&self, bus: &EventBus<u32>) {
        assert!(bus.publish_to("gate", 0).unwrap().is_clean());
        self.started.recv().unwrap();
    }

    fn open(self) {
        drop(self.release);
    }
}

fn single_worker(capacity: usize, policy: BackpressurePolicy) -> EventBus<u32> {
    EventBus::with_config(
        BusConfig::default()
            .with_workers(1)
            .with_queue_capacity(capacity)
            .with_backpressure(policy)
            .with_block_timeout(Duration::from_millis(20)),
    )
    .unwrap()
}

fn collector(name: &str, seen: &Arc<Mutex<Vec<u32>>>) -> Subscriber<u32> {
    let seen = Arc::clone(seen);
    Subscriber::from_fn(name, move |e: &Event<u32>| {
        seen.lock().push(e.payload);
        Ok(())
    })
}

#[test]
fn test_priority_order_then_unsubscribe() {
    init_tracing();
    let bus: EventBus<u32> = EventBus::with_config(BusConfig::default().with_workers(0)).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let record = |name: &'static str| {
        let order = Arc::clone(&order);
        Subscriber::from_fn(name, move |_: &Event<u32>| {
            order.lock().push(name);
            Ok(())
        })
    };

    let a = bus
        .subscribe_to("T", record("A"), SubscribeOptions::new().priority(10))
        .unwrap();
    bus.subscribe_to("T", record("B"), SubscribeOptions::new().priority(5))
        .unwrap();

    assert!(bus.publish_to("T", 0).unwrap().is_clean());
    assert_eq!(*order.lock(), vec!["A", "B"]);

    order.lock().clear();
    assert!(bus.unsubscribe(a));
    assert!(!bus.unsubscribe(a));
    assert!(bus.publish_to("T", 0).unwrap().is_clean());
    assert_eq!(*order.lock(), vec!["B"]);
}

#[test]
fn test_failing_subscriber_does_not_block_later_ones() {
    init_tracing();
    let bus: EventBus<u32> = EventBus::with_config(BusConfig::default().with_workers(0)).unwrap();
    let reached = Arc::new(AtomicBool::new(false));

    bus.subscribe_to(
        "T",
        Subscriber::from_fn("always-fails", |_: &Event<u32>| Err("broken".into())),
        SubscribeOptions::new().priority(100),
    )
    .unwrap();
    let flag = Arc::clone(&reached);
    bus.subscribe_to(
        "T",
        Subscriber::from_fn("later", move |_: &Event<u32>| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }),
        SubscribeOptions::new().priority(1),
    )
    .unwrap();

    let report = bus.publish_to("T", 0).unwrap();
    assert!(reached.load(Ordering::SeqCst));
    assert_eq!(report.invoked, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(&*report.failures[0].subscriber, "always-fails");

    let reported = bus.errors().try_recv().unwrap();
    assert_eq!(reported.cause, FailureCause::Failed("broken".to_string()));
}

#[test]
fn test_drop_newest_with_capacity_one() {
    init_tracing();
    let bus = single_worker(1, BackpressurePolicy::DropNewest);
    let gate = Gate::install(&bus);
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_to("T", collector("sink", &seen), SubscribeOptions::new().asynchronous())
        .unwrap();

    gate.close(&bus);
    let first = bus.publish_to("T", 1).unwrap();
    let second = bus.publish_to("T", 2).unwrap();
    gate.open();
    bus.shutdown().unwrap();

    assert_eq!(first.enqueued, 1);
    assert!(first.rejected.is_empty());
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.rejected.len(), 1);
    assert_eq!(second.rejected[0].policy, BackpressurePolicy::DropNewest);
    assert!(matches!(
        second.into_result(),
        Err(BusError::QueueSaturated(_))
    ));
    assert_eq!(*seen.lock(), vec![1]);
    assert_eq!(bus.stats().rejected, 1);
}

#[test]
fn test_drop_oldest_keeps_newest() {
    init_tracing();
    let bus = single_worker(1, BackpressurePolicy::DropOldest);
    let gate = Gate::install(&bus);
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_to("T", collector("sink", &seen), SubscribeOptions::new().asynchronous())
        .unwrap();

    gate.close(&bus);
    assert!(bus.publish_to("T", 1).unwrap().is_clean());
    assert!(bus.publish_to("T", 2).unwrap().is_clean());
    let third = bus.publish_to("T", 3).unwrap();
    gate.open();
    bus.shutdown().unwrap();

    assert_eq!(third.enqueued, 1);
    assert_eq!(third.evicted, 1);
    assert!(third.rejected.is_empty());
    assert_eq!(*seen.lock(), vec![3]);
    assert_eq!(bus.stats().evicted, 2);
}

#[test]
fn test_block_policy_times_out() {
    init_tracing();
    let bus = single_worker(1, BackpressurePolicy::Block);
    let gate = Gate::install(&bus);
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_to("T", collector("sink", &seen), SubscribeOptions::new().asynchronous())
        .unwrap();

    gate.close(&bus);
    assert_eq!(bus.publish_to("T", 1).unwrap().enqueued, 1);
    let blocked = bus.publish_to("T", 2).unwrap();
    gate.open();
    bus.shutdown().unwrap();

    assert_eq!(blocked.rejected.len(), 1);
    assert_eq!(blocked.rejected[0].policy, BackpressurePolicy::Block);
    assert_eq!(*seen.lock(), vec![1]);
}

#[test]
fn test_async_delivery_is_fifo_per_subscriber() {
    init_tracing();
    let bus: EventBus<u32> = EventBus::with_config(
        BusConfig::default()
            .with_workers(4)
            .with_queue_capacity(256)
            .with_backpressure(BackpressurePolicy::Block)
            .with_block_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_to("T", collector("first", &first), SubscribeOptions::new().asynchronous())
        .unwrap();
    bus.subscribe_to("T", collector("second", &second), SubscribeOptions::new().asynchronous())
        .unwrap();

    for i in 0..200 {
        assert!(bus.publish_to("T", i).unwrap().is_clean());
    }
    bus.shutdown().unwrap();

    let expected: Vec<u32> = (0..200).collect();
    assert_eq!(*first.lock(), expected);
    assert_eq!(*second.lock(), expected);
    assert_eq!(bus.stats().delivered, 400);
}

#[test]
fn test_unsubscribe_does_not_retract_queued_work() {
    init_tracing();
    let bus = single_worker(8, BackpressurePolicy::DropNewest);
    let gate = Gate::install(&bus);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = bus
        .subscribe_to("T", collector("sink", &seen), SubscribeOptions::new().asynchronous())
        .unwrap();

    gate.close(&bus);
    for i in 0..3 {
        assert!(bus.publish_to("T", i).unwrap().is_clean());
    }
    assert!(bus.unsubscribe(handle));
    assert_eq!(bus.publish_to("T", 99).unwrap().matched, 0);
    gate.open();
    bus.shutdown().unwrap();

    assert_eq!(*seen.lock(), vec![0, 1, 2]);
}

#[test]
fn test_discard_shutdown_drops_pending_work() {
    init_tracing();
    let bus = single_worker(8, BackpressurePolicy::DropNewest);
    let gate = Gate::install(&bus);
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_to("T", collector("sink", &seen), SubscribeOptions::new().asynchronous())
        .unwrap();

    gate.close(&bus);
    for i in 0..4 {
        assert!(bus.publish_to("T", i).unwrap().is_clean());
    }

    let bus = Arc::new(bus);
    let stopper = {
        let bus = Arc::clone(&bus);
        thread::spawn(move || bus.shutdown_with(ShutdownMode::Discard))
    };
    while bus.is_running() {
        thread::yield_now();
    }
    // Give the stopper time to signal the worker before it is released.
    thread::sleep(Duration::from_millis(50));
    gate.open();
    stopper.join().unwrap().unwrap();

    assert!(seen.lock().is_empty());
    assert_eq!(bus.stats().discarded, 4);
    assert!(matches!(
        bus.publish_to("T", 5),
        Err(BusError::ShutdownInProgress)
    ));
}

#[test]
fn test_async_failures_reach_error_channel() {
    init_tracing();
    let bus = single_worker(8, BackpressurePolicy::DropNewest);
    bus.subscribe_to(
        "T",
        Subscriber::from_fn("explodes", |_: &Event<u32>| panic!("worker boom")),
        SubscribeOptions::new().asynchronous(),
    )
    .unwrap();

    let report = bus.publish_to("T", 1).unwrap();
    assert!(report.is_clean());
    bus.shutdown().unwrap();

    let err = bus.errors().try_recv().unwrap();
    assert_eq!(&*err.subscriber, "explodes");
    assert_eq!(err.cause, FailureCause::Panicked("worker boom".to_string()));
    assert_eq!(bus.stats().failed, 1);
}

/// Every publish must see one complete, correctly ordered generation of the
/// subscriber list while other threads keep mutating it.
#[test]
fn test_concurrent_mutation_never_exposes_partial_lists() {
    init_tracing();
    type Trace = Arc<Mutex<Vec<(i32, u64)>>>;

    let bus: Arc<EventBus<Trace>> =
        Arc::new(EventBus::with_config(BusConfig::default().with_workers(0)).unwrap());
    let t = bus.register("T").unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let publishes = Arc::new(AtomicUsize::new(0));

    let tracer = |priority: i32, tag: u64| {
        Subscriber::from_fn(format!("tracer-{}", tag), move |e: &Event<Trace>| {
            e.payload.lock().push((priority, tag));
            Ok(())
        })
    };

    for tag in 0..4u64 {
        bus.subscribe(t, tracer(tag as i32 % 3, tag), SubscribeOptions::new().priority(tag as i32 % 3))
            .unwrap();
    }

    let mutators: Vec<_> = (0..2u64)
        .map(|m| {
            let bus = Arc::clone(&bus);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut tag = 1_000 * (m + 1);
                while !stop.load(Ordering::Relaxed) {
                    let priority = (tag % 5) as i32;
                    let handle = bus
                        .subscribe(t, tracer(priority, tag), SubscribeOptions::new().priority(priority))
                        .unwrap();
                    thread::yield_now();
                    assert!(bus.unsubscribe(handle));
                    tag += 1;
                }
            })
        })
        .collect();

    let publishers: Vec<_> = (0..4)
        .map(|_| {
            let bus = Arc::clone(&bus);
            let publishes = Arc::clone(&publishes);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
                    let report = bus.emit(t, Arc::clone(&trace)).unwrap();
                    let trace = trace.lock();

                    assert_eq!(report.invoked, report.matched);
                    assert_eq!(trace.len(), report.matched);
                    assert!(trace.len() >= 4 && trace.len() <= 6);
                    assert!(trace.windows(2).all(|w| w[0].0 >= w[1].0));
                    publishes.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for p in publishers {
        p.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for m in mutators {
        m.join().unwrap();
    }

    assert_eq!(publishes.load(Ordering::Relaxed), 8_000);
    assert_eq!(bus.subscriber_count(t), 4);
}
