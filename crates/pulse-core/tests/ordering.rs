use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use tenvis_pulse_core::{BusConfig, Event, EventBus, SubscribeOptions, Subscriber};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invocation order is priority descending, ties in subscription order.
    #[test]
    fn test_sync_invocation_matches_stable_priority_sort(
        priorities in prop::collection::vec(-5i32..5, 1..24),
        removals in prop::collection::vec(any::<bool>(), 24),
    ) {
        let bus: EventBus<()> = EventBus::with_config(BusConfig::default().with_workers(0)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (position, priority) in priorities.iter().copied().enumerate() {
            let order = Arc::clone(&order);
            let handle = bus
                .subscribe_to(
                    "T",
                    Subscriber::from_fn(format!("s{}", position), move |_: &Event<()>| {
                        order.lock().push(position);
                        Ok(())
                    }),
                    SubscribeOptions::new().priority(priority),
                )
                .unwrap();
            handles.push(handle);
        }

        let mut expected = Vec::new();
        for (position, handle) in handles.into_iter().enumerate() {
            if removals[position] {
                prop_assert!(bus.unsubscribe(handle));
            } else {
                expected.push(position);
            }
        }
        // `sort_by_key` is stable, so equal priorities keep insertion order.
        expected.sort_by_key(|&position| std::cmp::Reverse(priorities[position]));

        let report = bus.publish_to("T", ()).unwrap();
        prop_assert_eq!(report.invoked, expected.len());
        prop_assert_eq!(&*order.lock(), &expected);
    }
}
