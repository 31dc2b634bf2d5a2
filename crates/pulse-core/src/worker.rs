//! Async delivery worker pool.
//!
//! One OS thread per queue shard. A worker blocks on its shard and on a stop
//! channel; the stop channel is never written to, only disconnected, which
//! wakes every worker at once. After waking for stop, a worker either runs or
//! drops what is left in its shard depending on the [`ShutdownMode`].

use crate::config::ShutdownMode;
use crate::dispatch::{invoke, Reporter};
use crate::metrics;
use crate::queue::{DeliveryQueue, WorkItem};
use crate::subscription::DeliveryMode;
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

const MODE_DRAIN: u8 = 0;
const MODE_DISCARD: u8 = 1;

fn encode_mode(mode: ShutdownMode) -> u8 {
    match mode {
        ShutdownMode::Drain => MODE_DRAIN,
        ShutdownMode::Discard => MODE_DISCARD,
    }
}

/// Fixed-size pool of delivery threads.
pub(crate) struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Dropping this sender disconnects every worker's stop receiver.
    stop: Mutex<Option<Sender<()>>>,
    mode: Arc<AtomicU8>,
}

impl WorkerPool {
    /// Spawn one worker per shard of `queue`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a thread cannot be spawned. Workers spawned
    /// before the failure are stopped.
    pub(crate) fn spawn<T>(queue: &DeliveryQueue<T>, reporter: Arc<Reporter>) -> std::io::Result<Self>
    where
        T: Send + Sync + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let pool = Self {
            handles: Mutex::new(Vec::with_capacity(queue.shard_count())),
            stop: Mutex::new(Some(stop_tx)),
            mode: Arc::new(AtomicU8::new(MODE_DRAIN)),
        };

        for shard in 0..queue.shard_count() {
            let worker = Worker {
                id: shard,
                work: queue.receiver(shard),
                stop: stop_rx.clone(),
                reporter: Arc::clone(&reporter),
                mode: Arc::clone(&pool.mode),
            };
            let spawned = thread::Builder::new()
                .name(format!("pulse-worker-{}", shard))
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(err) => {
                    pool.stop(ShutdownMode::Discard);
                    return Err(err);
                }
            }
        }

        debug!(workers = queue.shard_count(), "Worker pool started");
        Ok(pool)
    }

    /// Number of live worker threads.
    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Signal every worker to stop and wait for them to exit.
    ///
    /// Idempotent; later calls return immediately.
    pub(crate) fn stop(&self, mode: ShutdownMode) {
        self.mode.store(encode_mode(mode), Ordering::SeqCst);
        drop(self.stop.lock().take());

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                error!(worker = ?name, "Worker thread panicked");
            }
        }
    }
}

struct Worker<T> {
    id: usize,
    work: Receiver<WorkItem<T>>,
    stop: Receiver<()>,
    reporter: Arc<Reporter>,
    mode: Arc<AtomicU8>,
}

impl<T: 'static> Worker<T> {
    fn stop_requested(&self) -> bool {
        matches!(self.stop.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn run(self) {
        // `select!` picks randomly among ready operations, so check stop
        // first to keep a backlog from delaying it.
        while !self.stop_requested() {
            select! {
                recv(self.work) -> item => match item {
                    Ok(item) => self.deliver(item),
                    Err(_) => break,
                },
                recv(self.stop) -> _ => break,
            }
        }

        if self.mode.load(Ordering::SeqCst) == MODE_DISCARD {
            let discarded = self.work.try_iter().count() as u64;
            if discarded > 0 {
                self.reporter.discarded(discarded);
            }
            debug!(worker = self.id, discarded, "Worker stopped, queue discarded");
        } else {
            let mut drained = 0u64;
            while let Ok(item) = self.work.try_recv() {
                self.deliver(item);
                drained += 1;
            }
            debug!(worker = self.id, drained, "Worker stopped, queue drained");
        }
    }

    fn deliver(&self, item: WorkItem<T>) {
        metrics::record_latency(item.enqueued_at.elapsed());
        match invoke(&item.subscription, &item.event) {
            Ok(()) => self.reporter.delivered(DeliveryMode::Async),
            Err(err) => self.reporter.failed(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressurePolicy;
    use crate::event::{Event, EventType};
    use crate::subscription::{Subscriber, Subscription, SubscriptionId};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting(
        id: u64,
        hits: &Arc<AtomicUsize>,
    ) -> Arc<Subscription<u32>> {
        let hits = Arc::clone(hits);
        Arc::new(Subscription {
            id: SubscriptionId(id),
            event_type: EventType::new(0, 0),
            subscriber: Subscriber::from_fn("counter", move |_: &Event<u32>| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            priority: 0,
            mode: DeliveryMode::Async,
            filter: None,
            seq: id,
        })
    }

    fn reporter() -> Arc<Reporter> {
        let (tx, _rx) = bounded(1);
        Arc::new(Reporter::new(tx))
    }

    #[test]
    fn test_pool_drains_on_stop() {
        let queue = DeliveryQueue::new(2, 64, BackpressurePolicy::DropNewest, Duration::ZERO);
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = counting(1, &hits);
        let reporter = reporter();

        let pool = WorkerPool::spawn(&queue, Arc::clone(&reporter)).unwrap();
        assert_eq!(pool.len(), 2);
        for i in 0..32 {
            queue
                .push(WorkItem::new(Arc::new(Event::new(EventType::new(0, 0), i)), Arc::clone(&sub)))
                .unwrap();
        }

        pool.stop(ShutdownMode::Drain);
        assert_eq!(hits.load(Ordering::SeqCst), 32);
        assert_eq!(reporter.counters.delivered.load(Ordering::SeqCst), 32);
        assert_eq!(pool.len(), 0);

        // Idempotent.
        pool.stop(ShutdownMode::Drain);
    }

    #[test]
    fn test_pool_discard_drops_pending() {
        let queue = DeliveryQueue::new(1, 64, BackpressurePolicy::DropNewest, Duration::ZERO);
        let hits = Arc::new(AtomicUsize::new(0));
        let reporter = reporter();
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        let gate = Arc::new(Subscription {
            id: SubscriptionId(1),
            event_type: EventType::new(0, 0),
            subscriber: Subscriber::from_fn("gate", move |_: &Event<u32>| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            }),
            priority: 0,
            mode: DeliveryMode::Async,
            filter: None,
            seq: 1,
        });
        let sub = counting(2, &hits);

        let pool = WorkerPool::spawn(&queue, Arc::clone(&reporter)).unwrap();
        queue
            .push(WorkItem::new(Arc::new(Event::new(EventType::new(0, 0), 0)), gate))
            .unwrap();
        started_rx.recv().unwrap();
        for i in 0..5 {
            queue
                .push(WorkItem::new(Arc::new(Event::new(EventType::new(0, 0), i)), Arc::clone(&sub)))
                .unwrap();
        }

        let stopper = thread::spawn(move || pool.stop(ShutdownMode::Discard));
        thread::sleep(Duration::from_millis(50));
        drop(release_tx);
        stopper.join().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(reporter.counters.discarded.load(Ordering::SeqCst), 5);
    }
}
