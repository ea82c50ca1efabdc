use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use snapshot_export::config::ExportConfig;
use snapshot_export::reporters::{
    ConsoleReporter, CsvReporter, InstanceFilter, LogReporter, ScrapeEndpoint, SqliteReporter,
};
use snapshot_export::rollup::Rollup;
use snapshot_export::scheduler::{Attached, SnapshotConsumer, SnapshotScheduler};
use snapshot_export::workload::{self, Store, WorkloadInstruments};
use snapshot_export::{load_generator, server, telemetry, AppState, ExportError, Registry, Result, Scope};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("snapshot-export: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // ── 1. Configuration and logging ─────────────────────────────
    let config = match std::env::args().nth(1) {
        Some(path) => ExportConfig::load_from_file(path)?,
        None => {
            let config = ExportConfig::default();
            config.validate()?;
            config
        }
    };
    telemetry::init_tracing(&config.logging)?;

    // ── 2. Registry and demo instruments ─────────────────────────
    let registry = Arc::new(Registry::with_labels(workload::session_labels()));
    let instruments = Arc::new(WorkloadInstruments::register(&registry, "demo")?);
    let store = Arc::new(Store::seeded(config.workload.seed));

    // ── 3. Scheduler and reporters ───────────────────────────────
    let scheduler = SnapshotScheduler::new(registry.clone())?;
    let scope = Scope::root();

    if let Some(mut failures) = scheduler.take_failures() {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                warn!(
                    consumer = %failure.consumer,
                    captured_at_ms = failure.captured_at_ms,
                    error = %failure.error,
                    "reporter failed a snapshot"
                );
            }
        });
    }

    let console = match config.console.enabled {
        true => {
            let c = &config.console;
            let reporter = ConsoleReporter::stdout()
                .disable(c.disabled_attributes.iter().copied())
                .with_duration_unit(c.duration_unit)
                .one_last_time(c.one_last_time)
                .counts_only(c.counts_only)
                .utc(c.utc)
                .with_filter(InstanceFilter::from_specs(&c.filters)?);
            Some(attach(&scheduler, &config, &scope, c.interval_ms, reporter)?)
        }
        false => None,
    };

    let csv = match config.csv.enabled {
        true => {
            let c = &config.csv;
            let reporter = CsvReporter::new(&c.directory, InstanceFilter::from_specs(&c.filters)?)?
                .with_duration_unit(c.duration_unit);
            Some(attach(&scheduler, &config, &scope, c.interval_ms, reporter)?)
        }
        false => None,
    };

    let log = match config.log_reporter.enabled {
        true => {
            let c = &config.log_reporter;
            let reporter = LogReporter::new(c.level)
                .with_prefix(c.prefix.clone())
                .with_duration_unit(c.duration_unit)
                .with_filter(InstanceFilter::from_specs(&c.filters)?);
            Some(attach(&scheduler, &config, &scope, c.interval_ms, reporter)?)
        }
        false => None,
    };

    let sqlite = match config.sqlite.enabled {
        true => {
            let c = &config.sqlite;
            let reporter = SqliteReporter::open(&c.path, InstanceFilter::from_specs(&c.filters)?)?
                .include_histograms(c.include_histograms);
            Some(attach(&scheduler, &config, &scope, c.interval_ms, reporter)?)
        }
        false => None,
    };

    // ── 4. Scrape endpoint ───────────────────────────────────────
    let mut endpoint = None;
    let mut http = None;
    if config.exposition.enabled {
        let attached = attach(
            &scheduler,
            &config,
            &scope,
            config.exposition.interval_ms,
            ScrapeEndpoint::new(),
        )?;
        let state = Arc::new(AppState {
            endpoint: attached.consumer().inner().clone(),
            stream_interval_ms: config.exposition.stream_interval_ms,
        });
        let app = server::create_router(state);

        let addr = config.exposition.bind;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ExportError::Runtime(format!("failed to bind {addr}: {e}")))?;
        info!(%addr, "scrape endpoint listening on /metrics, /api/metrics, /api/metrics/stream");

        http = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "scrape endpoint exited");
            }
        }));
        endpoint = Some(attached);
    }

    // ── 5. Workload ──────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(config.workload.enabled));
    let workload_done = {
        let running = running.clone();
        let workload = config.workload.clone();
        let enabled = workload.enabled;
        tokio::spawn(async move {
            if enabled {
                load_generator::run(running, instruments, store, workload).await;
            } else {
                std::future::pending::<()>().await;
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted; shutting down"),
        _ = workload_done => info!("workload complete; shutting down"),
    }
    running.store(false, Ordering::SeqCst);

    // ── 6. Teardown ──────────────────────────────────────────────
    // Closing waits for a delivery in flight, so it runs off the async workers.
    tokio::task::spawn_blocking(move || {
        close(endpoint);
        close(sqlite);
        close(log);
        close(csv);
        close(console);
        scheduler.shutdown();
    })
    .await
    .map_err(|e| ExportError::Runtime(format!("teardown failed: {e}")))?;
    if let Some(http) = http {
        http.abort();
    }
    Ok(())
}

/// Attaches a reporter at its configured interval. Intervals that are a
/// multiple of the base interval ride the base timer through a [`Rollup`].
fn attach<C: SnapshotConsumer + 'static>(
    scheduler: &SnapshotScheduler,
    config: &ExportConfig,
    scope: &Scope,
    section_interval_ms: Option<u64>,
    reporter: C,
) -> Result<Attached<Rollup<C>>> {
    let interval_ms = config.interval_for(section_interval_ms);
    let timer_ms = config.timer_interval_for(interval_ms);
    let rollup = Rollup::new(Arc::new(reporter), interval_ms);
    scheduler.attach(scope.clone(), timer_ms, Arc::new(rollup))
}

fn close<C: SnapshotConsumer>(attached: Option<Attached<C>>) {
    let Some(attached) = attached else {
        return;
    };
    let name = attached.consumer().name().to_owned();
    if let Err(e) = attached.close() {
        error!(consumer = %name, error = %e, "closing reporter failed");
    }
}
