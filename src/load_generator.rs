use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkloadConfig;
use crate::workload::{
    key_name, value_of_size, Store, WorkloadInstruments, MAX_VALUE_SIZE, MIN_VALUE_SIZE, NUM_KEYS,
};

// ─── Public entry point ──────────────────────────────────────────

/// Spawns `concurrency` Tokio tasks that drive the store until the
/// deadline or the `running` flag is set to false.
pub async fn run(
    running: Arc<AtomicBool>,
    instruments: Arc<WorkloadInstruments>,
    store: Arc<Store>,
    config: WorkloadConfig,
) {
    let deadline = Instant::now() + Duration::from_secs(config.duration_secs);
    info!(
        workers = config.concurrency,
        duration_secs = config.duration_secs,
        read_pct = config.read_pct,
        "starting workload"
    );

    let mut handles = Vec::with_capacity(config.concurrency as usize);

    for worker_id in 0..config.concurrency {
        let running = running.clone();
        let instruments = instruments.clone();
        let store = store.clone();
        let seed = config.seed + worker_id as u64;
        let read_pct = config.read_pct;

        handles.push(tokio::spawn(async move {
            worker(running, instruments, store, seed, deadline, read_pct).await;
        }));
    }
    instruments.active_workers.set(config.concurrency as f64);

    // Wait for all workers to finish
    let failed = join_workers(handles).await;
    if failed > 0 {
        warn!(failed, "some load workers did not finish cleanly");
    }

    instruments.active_workers.set(0.0);
    running.store(false, Ordering::SeqCst);
    info!("workload finished");
}

/// Awaits every worker; returns how many panicked or were cancelled.
async fn join_workers(handles: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for h in handles {
        if let Err(e) = h.await {
            warn!(error = %e, "load worker failed");
            failed += 1;
        }
    }
    failed
}

// ─── Worker loop ─────────────────────────────────────────────────

async fn worker(
    running: Arc<AtomicBool>,
    instruments: Arc<WorkloadInstruments>,
    store: Arc<Store>,
    seed: u64,
    deadline: Instant,
    read_pct: u8,
) {
    // Each worker gets its own deterministic RNG seeded uniquely.
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ops = 0u64;

    while running.load(Ordering::Relaxed) && Instant::now() < deadline {
        let is_read = rng.gen_range(0u8..100) < read_pct;
        instruments.requests.inc();

        if is_read {
            do_read(&mut rng, &instruments, &store).await;
        } else {
            do_write(&mut rng, &instruments, &store).await;
        }
        instruments.throughput.mark(1);
        ops += 1;
    }
    debug!(seed, ops, "worker stopped");
}

/// Stand-in for network and service time.
async fn service_time(rng: &mut StdRng, max_us: u64) {
    tokio::time::sleep(Duration::from_micros(rng.gen_range(50..=max_us))).await;
}

// ─── Read operation ──────────────────────────────────────────────

async fn do_read(rng: &mut StdRng, instruments: &WorkloadInstruments, store: &Store) {
    let t0 = Instant::now();

    // A few ids fall outside the seeded keyspace.
    let key = key_name(rng.gen_range(1..=NUM_KEYS + NUM_KEYS / 20));

    let found = store.get(&key).is_some();
    service_time(rng, 800).await;
    instruments.read_latency.record(t0.elapsed());

    if !found {
        instruments.misses.inc();
    }
}

// ─── Write operation ─────────────────────────────────────────────

async fn do_write(rng: &mut StdRng, instruments: &WorkloadInstruments, store: &Store) {
    let t0 = Instant::now();

    // Writes past the seeded range grow the keyspace.
    let key = key_name(rng.gen_range(1..=NUM_KEYS * 2));
    let value = value_of_size(rng.gen_range(MIN_VALUE_SIZE..=MAX_VALUE_SIZE));
    instruments.value_size.record(value.len() as u64);
    store.put(key, value);

    service_time(rng, 1_500).await;
    instruments.write_latency.record(t0.elapsed());
    instruments.keyspace.set(store.len() as f64);
}
