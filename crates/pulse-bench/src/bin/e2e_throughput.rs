//! End-to-end throughput benchmark for Pulse.
//!
//! Several publisher threads drive one event type with a mix of sync and
//! async subscribers for a fixed window, then the bus is drained and the
//! Prometheus rendering of the bus metrics is printed.
//!
//! Usage: `e2e_throughput [publishers] [config.toml]`

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tenvis_pulse_bench::{counting_subscriber, payload, BENCH_EVENT};
use tenvis_pulse_core::{metrics::describe_metrics, BusConfig, EventBus, SubscribeOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;
const SYNC_SUBSCRIBERS: usize = 4;
const ASYNC_SUBSCRIBERS: usize = 4;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let num_publishers = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(4);
    let config = match args.get(2) {
        Some(path) => BusConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => BusConfig::load().context("failed to load config")?,
    };

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    describe_metrics();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Pulse End-to-End Throughput Benchmark                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Workers: {:>4}   Queue: {:>8}   Policy: {:<12}      ║",
        config.worker_count,
        config.queue_capacity,
        config.backpressure.as_str()
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_publish_benchmark(num_publishers, config)?;

    println!();
    println!("{}", prometheus.render());
    Ok(())
}

fn run_publish_benchmark(num_publishers: usize, config: BusConfig) -> Result<()> {
    println!("📊 Publish Benchmark: {} publishers", num_publishers);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let async_enabled = config.worker_count > 0;
    let bus = Arc::new(EventBus::with_config(config).context("failed to start event bus")?);
    let event_type = bus.register(BENCH_EVENT)?;

    let sync_count = Arc::new(AtomicU64::new(0));
    let async_count = Arc::new(AtomicU64::new(0));
    for i in 0..SYNC_SUBSCRIBERS {
        bus.subscribe(
            event_type,
            counting_subscriber(format!("sync-{}", i), &sync_count),
            SubscribeOptions::new().priority(i as i32),
        )?;
    }
    if async_enabled {
        for i in 0..ASYNC_SUBSCRIBERS {
            bus.subscribe(
                event_type,
                counting_subscriber(format!("async-{}", i), &async_count),
                SubscribeOptions::new().asynchronous(),
            )?;
        }
    }

    let published = Arc::new(AtomicU64::new(0));
    let running = Arc::new(AtomicBool::new(true));
    let barrier = Arc::new(Barrier::new(num_publishers + 1));

    let mut handles = Vec::new();

    // Spawn publisher threads
    for publisher_id in 0..num_publishers {
        let bus = Arc::clone(&bus);
        let published = Arc::clone(&published);
        let running = Arc::clone(&running);
        let barrier = Arc::clone(&barrier);

        let handle = thread::Builder::new()
            .name(format!("publisher-{}", publisher_id))
            .spawn(move || {
                let message = payload(64);
                barrier.wait();
                while running.load(Ordering::Relaxed) {
                    match bus.emit(event_type, message.clone()) {
                        Ok(_) => {
                            published.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => break,
                    }
                }
            })
            .context("failed to spawn publisher")?;
        handles.push(handle);
    }

    barrier.wait();
    println!("✓ All {} publishers started", num_publishers);

    // Warmup phase
    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    thread::sleep(Duration::from_secs(WARMUP_SECS));

    // Reset counters and start measurement
    published.store(0, Ordering::SeqCst);
    sync_count.store(0, Ordering::SeqCst);
    let async_before = async_count.load(Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    thread::sleep(Duration::from_secs(BENCH_SECS));

    let elapsed = start.elapsed();
    let total_published = published.load(Ordering::SeqCst);
    let total_sync = sync_count.load(Ordering::SeqCst);

    running.store(false, Ordering::SeqCst);
    for handle in handles {
        let _ = handle.join();
    }
    bus.shutdown()?;
    let total_async = async_count.load(Ordering::SeqCst) - async_before;
    let stats = bus.stats();

    let events_per_sec = total_published as f64 / elapsed.as_secs_f64();
    let deliveries_per_sec = total_sync as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Publishers:           {:>10}                           ║",
        num_publishers
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Events Published:     {:>10}                           ║",
        total_published
    );
    println!(
        "║  Throughput:           {:>10.0} evt/s                    ║",
        events_per_sec
    );
    println!(
        "║  Sync Deliveries:      {:>10.0} /s                       ║",
        deliveries_per_sec
    );
    println!(
        "║  Async Deliveries:     {:>10}                           ║",
        total_async
    );
    println!(
        "║  Rejected:             {:>10}                           ║",
        stats.rejected
    );
    println!(
        "║  Evicted:              {:>10}                           ║",
        stats.evicted
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    info!(
        published = stats.published,
        delivered = stats.delivered,
        failed = stats.failed,
        "Benchmark complete"
    );
    Ok(())
}
