//! Metrics instrumentation for the bus.
//!
//! Uses the `metrics` facade; nothing is recorded until the embedding
//! application installs a recorder (the bench binary installs the Prometheus
//! one).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    pub const EVENTS_PUBLISHED: &str = "pulse_events_published_total";
    pub const DELIVERIES_TOTAL: &str = "pulse_deliveries_total";
    pub const FAILURES_TOTAL: &str = "pulse_subscriber_failures_total";
    pub const QUEUE_REJECTED: &str = "pulse_queue_rejected_total";
    pub const QUEUE_EVICTED: &str = "pulse_queue_evicted_total";
    pub const QUEUE_DISCARDED: &str = "pulse_queue_discarded_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "pulse_subscriptions_active";
    pub const DELIVERY_LATENCY_SECONDS: &str = "pulse_delivery_latency_seconds";
    pub const ERRORS_DROPPED: &str = "pulse_errors_dropped_total";
}

/// Describe all bus metrics to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::EVENTS_PUBLISHED, "Total number of events published");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total number of successful handler invocations"
    );
    metrics::describe_counter!(names::FAILURES_TOTAL, "Total number of failed handler invocations");
    metrics::describe_counter!(
        names::QUEUE_REJECTED,
        "Async work items rejected by the backpressure policy"
    );
    metrics::describe_counter!(
        names::QUEUE_EVICTED,
        "Async work items evicted by the drop_oldest policy"
    );
    metrics::describe_counter!(
        names::QUEUE_DISCARDED,
        "Async work items dropped by a discarding shutdown"
    );
    metrics::describe_gauge!(names::SUBSCRIPTIONS_ACTIVE, "Current number of subscriptions");
    metrics::describe_histogram!(
        names::DELIVERY_LATENCY_SECONDS,
        "Time from enqueue to async invocation in seconds"
    );
    metrics::describe_counter!(
        names::ERRORS_DROPPED,
        "Invocation errors dropped because the error channel was full"
    );
}

pub(crate) fn record_publish() {
    counter!(names::EVENTS_PUBLISHED).increment(1);
}

pub(crate) fn record_delivery(mode: &'static str) {
    counter!(names::DELIVERIES_TOTAL, "mode" => mode).increment(1);
}

pub(crate) fn record_failure(mode: &'static str) {
    counter!(names::FAILURES_TOTAL, "mode" => mode).increment(1);
}

pub(crate) fn record_rejected(policy: &'static str) {
    counter!(names::QUEUE_REJECTED, "policy" => policy).increment(1);
}

pub(crate) fn record_evicted() {
    counter!(names::QUEUE_EVICTED).increment(1);
}

pub(crate) fn record_discarded(count: u64) {
    counter!(names::QUEUE_DISCARDED).increment(count);
}

pub(crate) fn record_subscription() {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).increment(1.0);
}

pub(crate) fn record_unsubscription(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).decrement(count as f64);
}

pub(crate) fn record_latency(latency: Duration) {
    histogram!(names::DELIVERY_LATENCY_SECONDS).record(latency.as_secs_f64());
}

pub(crate) fn record_error_dropped() {
    counter!(names::ERRORS_DROPPED).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: every call is a no-op.
        describe_metrics();
        record_publish();
        record_delivery("sync");
        record_latency(Duration::from_millis(3));
    }
}
