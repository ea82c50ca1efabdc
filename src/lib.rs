//! Metrics snapshot capture and export.
//!
//! A [`SnapshotScheduler`] periodically captures an immutable
//! [`MetricsSnapshot`] from an [`InstrumentRegistry`] and hands it to every
//! registered [`SnapshotConsumer`]: console, CSV, structured log, SQLite and
//! the HTTP scrape endpoint.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod labels;
pub mod load_generator;
pub mod metrics;
pub mod registry;
pub mod reporters;
pub mod rollup;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod workload;

pub mod middleware {
    pub mod timing;
}

pub use config::ExportConfig;
pub use error::{ExportError, Result};
pub use labels::LabelSet;
pub use metrics::{MetricFamily, MetricType, MetricsSnapshot, Sample};
pub use registry::{InstrumentRegistry, Registry, Scope};
pub use reporters::{
    ConsoleReporter, CsvReporter, InstanceFilter, LogReporter, ScrapeEndpoint, SqliteReporter,
};
pub use rollup::Rollup;
pub use scheduler::{Attached, DeliveryFailure, Registration, SnapshotConsumer, SnapshotScheduler};

/// Shared state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Latest snapshot delivered by the scheduler.
    pub endpoint: Arc<ScrapeEndpoint>,

    /// SSE push period in milliseconds.
    pub stream_interval_ms: u64,
}
