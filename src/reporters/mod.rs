//! Snapshot sinks.
//!
//! Every reporter implements [`SnapshotConsumer`](crate::scheduler::SnapshotConsumer)
//! and owns its own output resources.

pub mod console;
pub mod csv;
pub mod endpoint;
pub mod exposition;
pub mod filter;
pub mod log;
pub mod sqlite;

use serde::Deserialize;

pub use console::ConsoleReporter;
pub use csv::CsvReporter;
pub use endpoint::ScrapeEndpoint;
pub use filter::InstanceFilter;
pub use log::LogReporter;
pub use sqlite::SqliteReporter;

/// Individually suppressible lines of the console and log renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricAttribute {
    Count,
    Max,
    Mean,
    Min,
    Stddev,
    P50,
    P75,
    P95,
    P98,
    P99,
    P999,
    MeanRate,
    M1Rate,
    M5Rate,
    M15Rate,
}

/// Unit durations are reported in; recorded values are nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl DurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nanoseconds => "nanoseconds",
            Self::Microseconds => "microseconds",
            Self::Milliseconds => "milliseconds",
            Self::Seconds => "seconds",
        }
    }

    /// Nanoseconds per unit.
    pub fn factor(&self) -> f64 {
        match self {
            Self::Nanoseconds => 1.0,
            Self::Microseconds => 1_000.0,
            Self::Milliseconds => 1_000_000.0,
            Self::Seconds => 1_000_000_000.0,
        }
    }

    pub fn convert(&self, nanos: f64) -> f64 {
        nanos / self.factor()
    }
}

/// Rates are always reported per second.
pub const RATE_UNIT: &str = "second";
