use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ExportError, Result};
use crate::reporters::log::LogLevel;
use crate::reporters::{DurationUnit, InstanceFilter, MetricAttribute};

/// Full runtime configuration. Every field has a default, so an empty
/// TOML document is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub console: ConsoleConfig,
    pub csv: CsvConfig,
    pub log_reporter: LogReporterConfig,
    pub sqlite: SqliteConfig,
    pub exposition: ExpositionConfig,
    pub workload: WorkloadConfig,
}

// ─── Sections ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval for every reporter that does not set its own.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Reporters whose interval is a whole multiple of `interval_ms` combine
    /// base ticks instead of running a timer of their own.
    #[serde(default = "default_true")]
    pub aggregate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub disabled_attributes: Vec<MetricAttribute>,
    #[serde(default)]
    pub counts_only: bool,
    /// Print a final report when the reporter is closed.
    #[serde(default = "default_true")]
    pub one_last_time: bool,
    #[serde(default)]
    pub utc: bool,
    #[serde(default)]
    pub duration_unit: DurationUnit,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsvConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_csv_dir")]
    pub directory: PathBuf,
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub duration_unit: DurationUnit,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogReporterConfig {
    #[serde(default)]
    pub enabled: bool,
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_log_duration_unit")]
    pub duration_unit: DurationUnit,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub include_histograms: bool,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpositionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    pub interval_ms: Option<u64>,
    /// SSE push period for `/api/metrics/stream`.
    #[serde(default = "default_stream_interval_ms")]
    pub stream_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of concurrent Tokio tasks generating load
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// How long the workload runs (seconds)
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
    /// Percentage of operations that are reads (0–100)
    #[serde(default = "default_read_pct")]
    pub read_pct: u8,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

// ─── Defaults ────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_log_filter() -> String {
    "info,snapshot_export=debug".into()
}
fn default_interval_ms() -> u64 {
    10_000
}
fn default_csv_dir() -> PathBuf {
    PathBuf::from("metrics-csv")
}
fn default_log_duration_unit() -> DurationUnit {
    DurationUnit::Milliseconds
}
fn default_sqlite_path() -> PathBuf {
    PathBuf::from("metrics.db")
}
fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}
fn default_stream_interval_ms() -> u64 {
    1_000
}
fn default_concurrency() -> u32 {
    10
}
fn default_duration() -> u64 {
    30
}
fn default_read_pct() -> u8 {
    70
}
fn default_seed() -> u64 {
    1000
}

macro_rules! section_default {
    ($($ty:ty),* $(,)?) => {
        $(impl Default for $ty {
            fn default() -> Self {
                // Same defaults as an empty TOML table.
                toml::from_str("").unwrap_or_else(|e| unreachable!("empty section must parse: {e}"))
            }
        })*
    };
}

section_default!(
    LoggingConfig,
    SchedulerConfig,
    ConsoleConfig,
    CsvConfig,
    LogReporterConfig,
    SqliteConfig,
    ExpositionConfig,
    WorkloadConfig,
);

// ─── Loading and validation ──────────────────────────────────────

impl ExportConfig {
    /// Reads and validates a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ExportError::io(path, e))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ExportConfig = toml::from_str(content)
            .map_err(|e| ExportError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective interval of a reporter section.
    pub fn interval_for(&self, section_interval_ms: Option<u64>) -> u64 {
        section_interval_ms.unwrap_or(self.scheduler.interval_ms)
    }

    /// Timer a reporter with effective interval `interval_ms` is attached to.
    pub fn timer_interval_for(&self, interval_ms: u64) -> u64 {
        let base = self.scheduler.interval_ms;
        if self.scheduler.aggregate && base > 0 && interval_ms > base && interval_ms % base == 0 {
            base
        } else {
            interval_ms
        }
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("scheduler", Some(self.scheduler.interval_ms)),
            ("console", self.console.interval_ms),
            ("csv", self.csv.interval_ms),
            ("log_reporter", self.log_reporter.interval_ms),
            ("sqlite", self.sqlite.interval_ms),
            ("exposition", self.exposition.interval_ms),
            ("exposition.stream", Some(self.exposition.stream_interval_ms)),
        ];
        if let Some((section, _)) = intervals.iter().find(|(_, ms)| *ms == Some(0)) {
            return Err(ExportError::Config(format!("{section}: interval_ms must be > 0")));
        }

        if self.csv.enabled && self.csv.directory.as_os_str().is_empty() {
            return Err(ExportError::Config("csv: directory must not be empty".into()));
        }
        if self.sqlite.enabled && self.sqlite.path.as_os_str().is_empty() {
            return Err(ExportError::Config("sqlite: path must not be empty".into()));
        }

        for specs in [
            &self.console.filters,
            &self.csv.filters,
            &self.log_reporter.filters,
            &self.sqlite.filters,
        ] {
            InstanceFilter::from_specs(specs)?;
        }

        let w = &self.workload;
        if w.concurrency == 0 || w.concurrency > 500 {
            return Err(ExportError::Config("workload: concurrency must be between 1 and 500".into()));
        }
        if w.duration_secs == 0 || w.duration_secs > 300 {
            return Err(ExportError::Config("workload: duration_secs must be between 1 and 300".into()));
        }
        if w.read_pct > 100 {
            return Err(ExportError::Config("workload: read_pct must be between 0 and 100".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ExportConfig::from_toml("").unwrap();
        assert_eq!(config.scheduler.interval_ms, 10_000);
        assert!(config.console.enabled);
        assert!(config.console.one_last_time);
        assert!(!config.csv.enabled);
        assert_eq!(config.log_reporter.duration_unit, DurationUnit::Milliseconds);
        assert_eq!(config.exposition.bind.port(), 3000);
        assert_eq!(config.workload.read_pct, 70);
        assert_eq!(config.interval_for(None), 10_000);
        assert_eq!(config.interval_for(Some(500)), 500);
        assert!(config.scheduler.aggregate);
    }

    #[test]
    fn multiples_of_the_base_interval_share_its_timer() {
        let config = ExportConfig::from_toml("[scheduler]\ninterval_ms = 1000").unwrap();
        assert_eq!(config.timer_interval_for(1_000), 1_000);
        assert_eq!(config.timer_interval_for(5_000), 1_000);
        assert_eq!(config.timer_interval_for(1_500), 1_500);
        assert_eq!(config.timer_interval_for(500), 500);

        let separate =
            ExportConfig::from_toml("[scheduler]\ninterval_ms = 1000\naggregate = false").unwrap();
        assert_eq!(separate.timer_interval_for(5_000), 5_000);
    }

    #[test]
    fn sections_parse() {
        let config = ExportConfig::from_toml(
            r#"
            [logging]
            format = "json"

            [console]
            disabled_attributes = ["stddev", "m15_rate"]
            duration_unit = "milliseconds"

            [csv]
            enabled = true
            directory = "out"
            interval_ms = 2000
            filters = ["ops.*", "!ops_errors"]

            [log_reporter]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.console.disabled_attributes,
            vec![MetricAttribute::Stddev, MetricAttribute::M15Rate]
        );
        assert_eq!(config.console.duration_unit, DurationUnit::Milliseconds);
        assert_eq!(config.interval_for(config.csv.interval_ms), 2_000);
        assert_eq!(config.log_reporter.level, LogLevel::Debug);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(ExportConfig::from_toml("[scheduler]\ninterval_ms = 0").is_err());
        assert!(ExportConfig::from_toml("[csv]\nenabled = true\ndirectory = \"\"").is_err());
        assert!(ExportConfig::from_toml("[sqlite]\nfilters = [\"a=b;c\"]").is_err());
        assert!(ExportConfig::from_toml("[workload]\nconcurrency = 501").is_err());
        assert!(ExportConfig::from_toml("[workload]\nread_pct = 101").is_err());
        assert!(ExportConfig::from_toml("[workload]\nduration_secs = 0").is_err());
    }
}
