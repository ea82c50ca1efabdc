use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::filter::InstanceFilter;
use super::{DurationUnit, RATE_UNIT};
use crate::error::{ExportError, Result};
use crate::labels::LabelSet;
use crate::metrics::{MeterSample, MetricsSnapshot, PointSample, Sample, SummarySample};
use crate::scheduler::SnapshotConsumer;

const TIMER_HEADER: &str = "count,max,mean,min,stddev,p50,p75,p95,p98,p99,p999,mean_rate,m1_rate,m5_rate,m15_rate,rate_unit,duration_unit";
const METER_HEADER: &str = "count,mean_rate,m1_rate,m5_rate,m15_rate,rate_unit";
const HISTOGRAM_HEADER: &str = "count,max,mean,min,stddev,p50,p75,p95,p98,p99,p999";
const POINT_HEADER: &str = "value";

/// Label keys whose bare values lead a file name.
const FILE_NAME_KEYS: [&str; 3] = ["scenario", "activity", "name"];

const PERCENTILES: [f64; 6] = [0.5, 0.75, 0.95, 0.98, 0.99, 0.999];

/// Appends one row per sample per tick to `<dir>/<name>.csv`.
///
/// File names come from each sample's labels after removing the labels
/// shared by every sample in the snapshot.
pub struct CsvReporter {
    directory: PathBuf,
    filter: InstanceFilter,
    duration_unit: DurationUnit,
    writers: Mutex<HashMap<PathBuf, BufWriter<File>>>,
}

impl CsvReporter {
    /// Creates the target directory if it is missing.
    pub fn new(directory: impl Into<PathBuf>, filter: InstanceFilter) -> Result<Self> {
        let directory = directory.into();
        if directory.exists() && !directory.is_dir() {
            return Err(ExportError::NotADirectory { path: directory });
        }
        if !directory.exists() {
            fs::create_dir_all(&directory).map_err(|e| ExportError::io(&directory, e))?;
            info!(dir = %directory.display(), "created CSV report directory");
        }
        Ok(Self {
            directory,
            filter,
            duration_unit: DurationUnit::default(),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_duration_unit(mut self, unit: DurationUnit) -> Self {
        self.duration_unit = unit;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Writes one row per accepted sample.
    pub fn report(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let timestamp = snapshot.captured_at_ms().div_euclid(1000);
        let common = common_labels(snapshot);
        debug!(common = %common, "factoring out common labels for CSV output");

        for (_, sample) in snapshot.samples() {
            if !self.filter.matches_sample(sample) {
                continue;
            }
            let file_name = file_name_for(sample, &common);
            let (header, row) = match sample {
                Sample::Point(point) => (POINT_HEADER, point_row(point)),
                Sample::Meter(meter) => (METER_HEADER, meter_row(meter)),
                Sample::Summary(summary) if summary.rates.is_some() => {
                    (TIMER_HEADER, self.timer_row(summary))
                }
                Sample::Summary(summary) => (HISTOGRAM_HEADER, histogram_row(summary)),
            };
            self.append(&file_name, header, timestamp, &row)?;
        }
        Ok(())
    }

    fn timer_row(&self, summary: &SummarySample) -> String {
        let du = self.duration_unit;
        let stats = &summary.statistics;
        let mut fields = vec![stats.count.to_string()];
        fields.extend(
            [stats.max, stats.mean, stats.min, stats.stddev]
                .into_iter()
                .chain(PERCENTILES.iter().map(|q| summary.quantiles.value_or_nan(*q)))
                .map(|v| format!("{:.6}", du.convert(v))),
        );
        let rates = summary.rates.unwrap_or_default();
        fields.extend(
            [rates.mean, rates.one_minute, rates.five_minute, rates.fifteen_minute]
                .into_iter()
                .map(|v| format!("{v:.6}")),
        );
        fields.push(format!("calls/{RATE_UNIT}"));
        fields.push(du.as_str().to_owned());
        fields.join(",")
    }

    fn append(&self, file_name: &str, header: &str, timestamp: i64, row: &str) -> Result<()> {
        let path = self.directory.join(format!("{file_name}.csv"));
        let mut writers = self.writers.lock();
        if !writers.contains_key(&path) {
            let writer = open_writer(&path, header)?;
            writers.insert(path.clone(), writer);
        }
        let Some(writer) = writers.get_mut(&path) else {
            return Ok(());
        };
        writeln!(writer, "{timestamp},{row}")
            .and_then(|_| writer.flush())
            .map_err(|e| ExportError::io(&path, e))
    }

    /// Number of files currently held open.
    pub fn open_files(&self) -> usize {
        self.writers.lock().len()
    }
}

impl SnapshotConsumer for CsvReporter {
    fn name(&self) -> &str {
        "csv"
    }

    fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        self.report(snapshot)
    }

    fn close(&self) -> Result<()> {
        let mut writers = self.writers.lock();
        for (path, writer) in writers.iter_mut() {
            writer.flush().map_err(|e| ExportError::io(path, e))?;
        }
        writers.clear();
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

/// The header line goes only into files that did not exist yet.
fn open_writer(path: &Path, header: &str) -> Result<BufWriter<File>> {
    let existed = path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ExportError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    if !existed {
        writeln!(writer, "t,{header}").map_err(|e| ExportError::io(path, e))?;
        debug!(file = %path.display(), "created CSV file");
    }
    Ok(writer)
}

/// Labels that every sample in the snapshot carries with the same value.
fn common_labels(snapshot: &MetricsSnapshot) -> LabelSet {
    let mut samples = snapshot.samples().map(|(_, s)| s.labels());
    let Some(first) = samples.next() else {
        return LabelSet::empty();
    };
    samples.fold(first.clone(), |common, labels| common.intersection(labels))
}

fn file_name_for(sample: &Sample, common: &LabelSet) -> String {
    let bare = sample
        .labels()
        .difference(common)
        .linearize_bare(&FILE_NAME_KEYS);
    let name = if bare.is_empty() {
        sample.name().to_owned()
    } else {
        bare
    };
    name.replace(['/', '\\'], "_")
}

fn point_row(point: &PointSample) -> String {
    format!("{:?}", point.value)
}

fn meter_row(meter: &MeterSample) -> String {
    format!(
        "{},{:.6},{:.6},{:.6},{:.6},events/{RATE_UNIT}",
        meter.count, meter.mean_rate, meter.m1_rate, meter.m5_rate, meter.m15_rate
    )
}

fn histogram_row(summary: &SummarySample) -> String {
    let stats = &summary.statistics;
    let mut fields = vec![
        stats.count.to_string(),
        format!("{}", stats.max.round() as i64),
        format!("{:.6}", stats.mean),
        format!("{}", stats.min.round() as i64),
        format!("{:.6}", stats.stddev),
    ];
    fields.extend(
        PERCENTILES
            .iter()
            .map(|q| format!("{:.6}", summary.quantiles.value_or_nan(*q))),
    );
    fields.join(",")
}
