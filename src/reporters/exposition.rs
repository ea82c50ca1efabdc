//! Text exposition format for pull-based scrapers.
//!
//! Formatting is a pure function of the snapshot and the clock. Each metric
//! name gets at most one `# HELP` / `# TYPE` / `# UNIT` block, written right
//! before its first data line.

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::labels::RESERVED_KEYS;
use crate::metrics::{
    MetricFamily, MetricType, MetricsSnapshot, RateStatistics, Sample, SummarySample,
};

/// Source of the per-line timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    /// The snapshot's capture time; output is fully deterministic.
    #[default]
    CaptureTime,
    /// A fixed epoch-millisecond value.
    Fixed(i64),
    /// Wall-clock time at formatting.
    Wall,
}

impl Clock {
    fn epoch_millis(&self, snapshot: &MetricsSnapshot) -> i64 {
        match self {
            Self::CaptureTime => snapshot.captured_at_ms(),
            Self::Fixed(ms) => *ms,
            Self::Wall => chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Renders the snapshot with its own capture time.
pub fn format_snapshot(snapshot: &MetricsSnapshot) -> String {
    format(Clock::CaptureTime, snapshot)
}

pub fn format(clock: Clock, snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    format_into(clock, &mut out, snapshot);
    out
}

/// Appends the rendering to `out`.
pub fn format_into(clock: Clock, out: &mut String, snapshot: &MetricsSnapshot) {
    let mut encoder = Encoder {
        out,
        declared: HashSet::new(),
        epoch_millis: clock.epoch_millis(snapshot),
    };
    for family in snapshot.families() {
        for sample in family.samples() {
            encoder.encode(family, sample);
        }
    }
}

// ─── Encoding ────────────────────────────────────────────────────

/// Numeric value; counts keep their integral type.
#[derive(Debug, Clone, Copy)]
enum Number {
    Integral(u64),
    Real(f64),
}

impl From<u64> for Number {
    fn from(value: u64) -> Self {
        Self::Integral(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

struct Encoder<'a> {
    out: &'a mut String,
    /// Per-call header registry.
    declared: HashSet<String>,
    epoch_millis: i64,
}

impl Encoder<'_> {
    fn encode(&mut self, family: &MetricFamily, sample: &Sample) {
        match (family.metric_type(), sample) {
            (MetricType::Gauge, Sample::Point(point)) => {
                self.header(&point.sample_name, "gauge", family.help(), family.unit(), family.categories());
                let labels = base_labels(sample);
                self.line(&point.sample_name, &labels, point.value.into());
            }
            (MetricType::Gauge, Sample::Meter(meter)) => {
                let counter = format!("{}_total", meter.sample_name);
                self.header(&counter, "counter", family.help(), family.unit(), family.categories());
                let labels = base_labels(sample);
                self.line(&counter, &labels, meter.count.into());
                self.rate_gauges(family, &meter.sample_name, &labels, &meter.rates());
            }
            (MetricType::Counter, Sample::Point(point)) => {
                self.header(&point.sample_name, "counter", family.help(), family.unit(), family.categories());
                let labels = base_labels(sample);
                self.line(&point.sample_name, &labels, point.value.into());
            }
            // Histograms are expressed as summaries.
            (MetricType::Summary | MetricType::Histogram, Sample::Summary(summary)) => {
                self.summary(family, sample, summary);
            }
            (metric_type, other) => unreachable!(
                "{} family '{}' holds a {} sample",
                metric_type,
                family.family_name(),
                other.variant_name()
            ),
        }
    }

    fn summary(&mut self, family: &MetricFamily, sample: &Sample, summary: &SummarySample) {
        let base = summary.sample_name.as_str();
        let labels = base_labels(sample);

        self.header(base, "summary", family.help(), family.unit(), family.categories());
        for q in summary.quantiles.iter() {
            let mut quantile_labels = labels.clone();
            quantile_labels.push(("quantile".to_owned(), trim_quantile(q.quantile)));
            self.line(base, &quantile_labels, q.value.into());
        }

        let stats = &summary.statistics;
        let count = format!("{base}_count");
        self.header(&count, "counter", "", "", family.categories());
        self.line(&count, &labels, stats.count.into());

        let sum = format!("{base}_sum");
        self.header(&sum, "counter", "", "", family.categories());
        self.line(&sum, &labels, summary.sum.into());

        let min = format!("{base}_min");
        self.header(&min, "gauge", "", family.unit(), family.categories());
        self.line(&min, &labels, stats.min.into());

        let max = format!("{base}_max");
        self.header(&max, "gauge", "", family.unit(), family.categories());
        self.line(&max, &labels, stats.max.into());

        if let Some(rates) = &summary.rates {
            self.rate_gauges(family, base, &labels, rates);
        }
    }

    fn rate_gauges(
        &mut self,
        family: &MetricFamily,
        base: &str,
        labels: &[(String, String)],
        rates: &RateStatistics,
    ) {
        for (suffix, value) in [
            ("_mean_rate", rates.mean),
            ("_m1_rate", rates.one_minute),
            ("_m5_rate", rates.five_minute),
            ("_m15_rate", rates.fifteen_minute),
        ] {
            let name = format!("{base}{suffix}");
            self.header(&name, "gauge", family.help(), family.unit(), family.categories());
            self.line(&name, labels, value.into());
        }
    }

    fn header(&mut self, name: &str, metric_type: &str, help: &str, unit: &str, categories: &[String]) {
        if !self.declared.insert(name.to_owned()) {
            return;
        }
        if !help.trim().is_empty() {
            let _ = writeln!(self.out, "# HELP {name} {}", escape_help(help));
        }
        let _ = writeln!(self.out, "# TYPE {name} {metric_type}");
        if !unit.trim().is_empty() {
            let _ = writeln!(self.out, "# UNIT {name} {unit}");
        }
        if !categories.is_empty() {
            let _ = writeln!(self.out, "# CATEGORIES {name} {}", categories.join(","));
        }
    }

    fn line(&mut self, name: &str, labels: &[(String, String)], value: Number) {
        self.out.push_str(name);
        if !labels.is_empty() {
            let body = labels
                .iter()
                .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
                .collect::<Vec<_>>()
                .join(",");
            self.out.push('{');
            self.out.push_str(&body);
            self.out.push('}');
        }
        let _ = writeln!(self.out, " {} {}", format_number(value), self.epoch_millis);
    }
}

/// Sample labels minus the reserved keys, sorted by key.
fn base_labels(sample: &Sample) -> Vec<(String, String)> {
    sample
        .labels()
        .without(&RESERVED_KEYS)
        .iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

fn format_number(value: Number) -> String {
    match value {
        Number::Integral(n) => n.to_string(),
        Number::Real(v) if v.is_nan() => "NaN".to_owned(),
        Number::Real(v) if v == f64::INFINITY => "+Inf".to_owned(),
        Number::Real(v) if v == f64::NEG_INFINITY => "-Inf".to_owned(),
        Number::Real(v) if v == v.round() && v.abs() < i64::MAX as f64 => (v as i64).to_string(),
        Number::Real(v) => v.to_string(),
    }
}

/// Whole quantiles print as integers, others in shortest decimal form.
fn trim_quantile(quantile: f64) -> String {
    if quantile == quantile.round() {
        (quantile as i64).to_string()
    } else {
        quantile.to_string()
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}
