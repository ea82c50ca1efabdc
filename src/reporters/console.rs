use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::filter::InstanceFilter;
use super::{DurationUnit, MetricAttribute, RATE_UNIT};
use crate::error::{ExportError, Result};
use crate::labels::RESERVED_KEYS;
use crate::metrics::{
    MeterSample, MetricFamily, MetricType, MetricsSnapshot, PointSample, RateStatistics, Sample,
    SummarySample,
};
use crate::scheduler::SnapshotConsumer;

const CONSOLE_WIDTH: usize = 80;

/// `M/D/YY, H:MM:SS AM/PM`
const BANNER_TIME_FORMAT: &str = "%-m/%-d/%y, %-I:%M:%S %p";

/// Section a family is printed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Gauges,
    Counters,
    Meters,
    Summaries,
    Other,
}

impl Section {
    const ORDER: [Section; 5] = [
        Section::Gauges,
        Section::Counters,
        Section::Meters,
        Section::Summaries,
        Section::Other,
    ];

    fn of(family: &MetricFamily) -> Self {
        match family.metric_type() {
            MetricType::Gauge if family.has_meter_samples() => Self::Meters,
            MetricType::Gauge => Self::Gauges,
            MetricType::Summary => Self::Summaries,
            MetricType::Counter => Self::Counters,
            MetricType::Histogram => Self::Other,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Gauges => "-- Gauges",
            Self::Counters => "-- Counters",
            Self::Meters => "-- Meters",
            Self::Summaries => "-- Summaries",
            Self::Other => "-- Other Metrics",
        }
    }
}

/// Human-readable report on an output stream, 80 columns wide.
pub struct ConsoleReporter {
    output: Mutex<Box<dyn Write + Send>>,
    disabled: HashSet<MetricAttribute>,
    duration_unit: DurationUnit,
    one_last_time: bool,
    counts_only: bool,
    utc: bool,
    filter: InstanceFilter,
    last: Mutex<Option<Arc<MetricsSnapshot>>>,
}

impl ConsoleReporter {
    pub fn new(output: impl Write + Send + 'static) -> Self {
        Self {
            output: Mutex::new(Box::new(output)),
            disabled: HashSet::new(),
            duration_unit: DurationUnit::default(),
            one_last_time: false,
            counts_only: false,
            utc: false,
            filter: InstanceFilter::new(),
            last: Mutex::new(None),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn disable(mut self, attributes: impl IntoIterator<Item = MetricAttribute>) -> Self {
        self.disabled.extend(attributes);
        self
    }

    pub fn with_duration_unit(mut self, unit: DurationUnit) -> Self {
        self.duration_unit = unit;
        self
    }

    /// Render the last snapshot once more on close.
    pub fn one_last_time(mut self, enabled: bool) -> Self {
        self.one_last_time = enabled;
        self
    }

    /// Scheduler deliveries use the counts-only rendering.
    pub fn counts_only(mut self, enabled: bool) -> Self {
        self.counts_only = enabled;
        self
    }

    /// Banner timestamps in UTC instead of local time.
    pub fn utc(mut self, enabled: bool) -> Self {
        self.utc = enabled;
        self
    }

    pub fn with_filter(mut self, filter: InstanceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Full report stamped with the current wall-clock time.
    pub fn report(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        self.emit(&self.render(snapshot, Utc::now().timestamp_millis()))
    }

    /// Counts-only report stamped with the capture time.
    pub fn report_counts(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        self.emit(&self.render_counts(snapshot, snapshot.captured_at_ms()))
    }

    // ── Rendering ───────────────────────────────────────────────

    fn render(&self, snapshot: &MetricsSnapshot, epoch_ms: i64) -> String {
        let mut out = String::new();
        banner(&mut out, &self.timestamp(epoch_ms), '=');
        out.push('\n');

        for section in Section::ORDER {
            let families: Vec<&MetricFamily> = snapshot
                .families()
                .iter()
                .filter(|f| Section::of(f) == section)
                .collect();
            if families.is_empty() {
                continue;
            }
            banner(&mut out, section.title(), '-');
            for family in families {
                self.render_family(&mut out, section, family);
            }
            out.push('\n');
        }
        out
    }

    fn render_family(&self, out: &mut String, section: Section, family: &MetricFamily) {
        for sample in family.samples() {
            if !self.filter.matches_sample(sample) {
                continue;
            }
            match (section, sample) {
                (Section::Counters, Sample::Point(point)) => {
                    line(out, &sample_header(family, sample));
                    self.counter_lines(out, point);
                }
                (Section::Gauges | Section::Meters | Section::Other, Sample::Point(point)) => {
                    line(out, &sample_header(family, sample));
                    gauge_lines(out, point);
                }
                (Section::Meters, Sample::Meter(meter)) => {
                    line(out, &sample_header(family, sample));
                    self.meter_lines(out, meter);
                }
                (Section::Summaries | Section::Other, Sample::Summary(summary)) => {
                    line(out, &sample_header(family, sample));
                    self.summary_lines(out, family, summary);
                }
                // Combinations the family type rules out.
                _ => {}
            }
        }
    }

    fn render_counts(&self, snapshot: &MetricsSnapshot, epoch_ms: i64) -> String {
        let mut out = String::new();
        banner(&mut out, &self.timestamp(epoch_ms), '=');
        out.push('\n');

        let mut printed = false;
        for (family, sample) in snapshot.samples() {
            if !self.filter.matches_sample(sample) {
                continue;
            }
            let Some(count) = extract_count(family, sample) else {
                continue;
            };
            if !printed {
                banner(&mut out, "-- Counts", '-');
                printed = true;
            }
            line(&mut out, &sample_header(family, sample));
            line(&mut out, &format!("             count = {count}"));
        }
        if !printed {
            line(&mut out, "no countable metrics available");
        }
        out.push('\n');
        out
    }

    fn counter_lines(&self, out: &mut String, point: &PointSample) {
        line(out, &format!("             count = {}", point.value.round() as i64));
    }

    fn meter_lines(&self, out: &mut String, meter: &MeterSample) {
        self.attr(out, MetricAttribute::Count, || {
            format!("             count = {}", meter.count)
        });
        self.rate_lines(out, "events", &meter.rates());
    }

    fn summary_lines(&self, out: &mut String, family: &MetricFamily, summary: &SummarySample) {
        // Timers record nanoseconds; plain histograms keep their own unit.
        let (convert, unit): (Box<dyn Fn(f64) -> f64>, String) = if summary.rates.is_some() {
            let du = self.duration_unit;
            (Box::new(move |v| du.convert(v)), format!(" {}", du.as_str()))
        } else if family.unit().trim().is_empty() {
            (Box::new(|v| v), String::new())
        } else {
            (Box::new(|v| v), format!(" {}", family.unit()))
        };

        let stats = &summary.statistics;
        self.attr(out, MetricAttribute::Count, || {
            format!("             count = {}", stats.count)
        });
        let rows: [(MetricAttribute, &str, f64); 10] = [
            (MetricAttribute::Min, "               min = ", stats.min),
            (MetricAttribute::Max, "               max = ", stats.max),
            (MetricAttribute::Mean, "              mean = ", stats.mean),
            (MetricAttribute::Stddev, "            stddev = ", stats.stddev),
            (MetricAttribute::P50, "            median = ", summary.quantiles.value_or_nan(0.5)),
            (MetricAttribute::P75, "              75% <= ", summary.quantiles.value_or_nan(0.75)),
            (MetricAttribute::P95, "              95% <= ", summary.quantiles.value_or_nan(0.95)),
            (MetricAttribute::P98, "              98% <= ", summary.quantiles.value_or_nan(0.98)),
            (MetricAttribute::P99, "              99% <= ", summary.quantiles.value_or_nan(0.99)),
            (MetricAttribute::P999, "            99.9% <= ", summary.quantiles.value_or_nan(0.999)),
        ];
        for (attribute, label, value) in rows {
            self.attr(out, attribute, || format!("{label}{:.2}{unit}", convert(value)));
        }

        if let Some(rates) = &summary.rates {
            self.rate_lines(out, "calls", rates);
        }
    }

    fn rate_lines(&self, out: &mut String, noun: &str, rates: &RateStatistics) {
        for (attribute, label, value) in [
            (MetricAttribute::MeanRate, "         mean rate = ", rates.mean),
            (MetricAttribute::M1Rate, "     1-minute rate = ", rates.one_minute),
            (MetricAttribute::M5Rate, "     5-minute rate = ", rates.five_minute),
            (MetricAttribute::M15Rate, "    15-minute rate = ", rates.fifteen_minute),
        ] {
            self.attr(out, attribute, || format!("{label}{value:.2} {noun}/{RATE_UNIT}"));
        }
    }

    /// Suppressed attributes are omitted entirely.
    fn attr(&self, out: &mut String, attribute: MetricAttribute, text: impl FnOnce() -> String) {
        if !self.disabled.contains(&attribute) {
            line(out, &text());
        }
    }

    fn timestamp(&self, epoch_ms: i64) -> String {
        let Some(at) = DateTime::<Utc>::from_timestamp_millis(epoch_ms) else {
            return epoch_ms.to_string();
        };
        if self.utc {
            at.format(BANNER_TIME_FORMAT).to_string()
        } else {
            at.with_timezone(&Local).format(BANNER_TIME_FORMAT).to_string()
        }
    }

    fn emit(&self, text: &str) -> Result<()> {
        let mut output = self.output.lock();
        output
            .write_all(text.as_bytes())
            .and_then(|_| output.flush())
            .map_err(|e| ExportError::io("<console>", e))
    }
}

impl SnapshotConsumer for ConsoleReporter {
    fn name(&self) -> &str {
        "console"
    }

    fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        *self.last.lock() = Some(snapshot.clone());
        let text = if self.counts_only {
            self.render_counts(snapshot, snapshot.captured_at_ms())
        } else {
            self.render(snapshot, snapshot.captured_at_ms())
        };
        self.emit(&text)
    }

    fn close(&self) -> Result<()> {
        let last = self.last.lock().take();
        if let (true, Some(snapshot)) = (self.one_last_time, last) {
            debug!("console reporter rendering final snapshot");
            self.report(&snapshot)?;
        }
        self.output
            .lock()
            .flush()
            .map_err(|e| ExportError::io("<console>", e))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

fn line(out: &mut String, text: &str) {
    out.push_str(text);
    out.push('\n');
}

fn banner(out: &mut String, text: &str, fill: char) {
    out.push_str(text);
    out.push(' ');
    let width = CONSOLE_WIDTH.saturating_sub(text.chars().count() + 1);
    out.extend(std::iter::repeat(fill).take(width));
    out.push('\n');
}

fn gauge_lines(out: &mut String, point: &PointSample) {
    let _ = writeln!(out, "             value = {:?}", point.value);
}

/// Original name when set, then `{k="v",...}` without the reserved keys.
fn sample_header(family: &MetricFamily, sample: &Sample) -> String {
    let base = if family.original_name().trim().is_empty() {
        family.family_name()
    } else {
        family.original_name()
    };
    let labels = sample.labels().without(&RESERVED_KEYS);
    if labels.is_empty() {
        base.to_owned()
    } else {
        format!("{base}{}", labels.linearize_as_metrics())
    }
}

fn extract_count(family: &MetricFamily, sample: &Sample) -> Option<u64> {
    match sample {
        Sample::Point(point) if family.metric_type() == MetricType::Counter => {
            Some(point.value.round().max(0.0) as u64)
        }
        other => other.count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelSet;
    use crate::metrics::{Quantiles, SummaryStatistics};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn labels() -> LabelSet {
        LabelSet::from_pairs([("name", "x"), ("unit", "ns"), ("region", "us")])
    }

    fn snapshot() -> MetricsSnapshot {
        let rates = RateStatistics {
            mean: 2.0,
            one_minute: 1.0,
            five_minute: 0.5,
            fifteen_minute: 0.25,
        };
        let mut timer = Sample::summary(
            "op_latency",
            labels(),
            SummaryStatistics { count: 4, min: 1.0, max: 9.0, mean: 5.0, stddev: 1.5 },
            Quantiles::from_pairs([(0.5, 4.0), (0.999, 9.0)]),
            20.0,
        );
        if let Sample::Summary(s) = &mut timer {
            s.rates = Some(rates);
        }
        MetricsSnapshot::new(
            0,
            1_000,
            vec![
                MetricFamily::new("reqs_total", MetricType::Counter, vec![Sample::point("reqs_total", labels(), 12.0)]).unwrap(),
                MetricFamily::new("depth", MetricType::Gauge, vec![Sample::point("depth", labels(), 2.5)]).unwrap(),
                MetricFamily::new("ops", MetricType::Gauge, vec![Sample::meter("ops", labels(), 7, rates)]).unwrap(),
                MetricFamily::new("op_latency", MetricType::Summary, vec![timer])
                    .unwrap()
                    .with_original_name("op.latency"),
            ],
        )
    }

    #[test]
    fn sections_follow_fixed_order() {
        let buf = SharedBuf::default();
        let reporter = ConsoleReporter::new(buf.clone()).utc(true);
        reporter.on_snapshot(&Arc::new(snapshot())).unwrap();
        let text = buf.text();

        let first = text.lines().next().unwrap();
        assert_eq!(first.len(), CONSOLE_WIDTH);
        assert!(first.starts_with("1/1/70, 12:00:00 AM ="));

        let gauges = text.find("-- Gauges").unwrap();
        let counters = text.find("-- Counters").unwrap();
        let meters = text.find("-- Meters").unwrap();
        let summaries = text.find("-- Summaries").unwrap();
        assert!(gauges < counters && counters < meters && meters < summaries);
        assert!(!text.contains("-- Other Metrics"));

        assert!(text.contains("depth{region=\"us\"}\n             value = 2.5\n"));
        assert!(text.contains("reqs_total{region=\"us\"}\n             count = 12\n"));
        assert!(text.contains("         mean rate = 2.00 events/second\n"));
        assert!(text.contains("op.latency{region=\"us\"}\n"));
        assert!(text.contains("            median = 4.00 nanoseconds\n"));
        assert!(text.contains("            99.9% <= 9.00 nanoseconds\n"));
        assert!(text.contains("              75% <= NaN nanoseconds\n"));
        assert!(text.contains("     1-minute rate = 1.00 calls/second\n"));
    }

    #[test]
    fn disabled_attributes_are_omitted() {
        let buf = SharedBuf::default();
        let reporter = ConsoleReporter::new(buf.clone())
            .disable([MetricAttribute::Stddev, MetricAttribute::M15Rate]);
        reporter.on_snapshot(&Arc::new(snapshot())).unwrap();
        let text = buf.text();
        assert!(!text.contains("stddev ="));
        assert!(!text.contains("15-minute rate"));
        assert!(text.contains("5-minute rate"));
    }

    #[test]
    fn counts_only_rendering() {
        let buf = SharedBuf::default();
        let reporter = ConsoleReporter::new(buf.clone());
        reporter.report_counts(&snapshot()).unwrap();
        let text = buf.text();
        assert!(text.contains("-- Counts "));
        assert!(text.contains("reqs_total{region=\"us\"}\n             count = 12\n"));
        assert!(text.contains("ops{region=\"us\"}\n             count = 7\n"));
        assert!(!text.contains("depth"));
    }

    #[test]
    fn counts_only_placeholder() {
        let buf = SharedBuf::default();
        let reporter = ConsoleReporter::new(buf.clone());
        let gauges_only = MetricsSnapshot::new(
            0,
            0,
            vec![MetricFamily::new("depth", MetricType::Gauge, vec![Sample::point("depth", labels(), 1.0)]).unwrap()],
        );
        reporter.report_counts(&gauges_only).unwrap();
        assert!(buf.text().contains("no countable metrics available\n"));
    }

    #[test]
    fn points_beside_meters_are_printed() {
        let buf = SharedBuf::default();
        let reporter = ConsoleReporter::new(buf.clone());
        let mixed = MetricFamily::new(
            "ops",
            MetricType::Gauge,
            vec![
                Sample::point("ops", LabelSet::from_pairs([("kind", "gauge")]), 99.5),
                Sample::meter("ops", LabelSet::from_pairs([("kind", "meter")]), 7, RateStatistics::default()),
            ],
        )
        .unwrap();
        reporter.report(&MetricsSnapshot::new(0, 1_000, vec![mixed])).unwrap();

        let text = buf.text();
        assert!(text.contains("-- Meters"));
        assert!(text.contains("ops{kind=\"gauge\"}\n             value = 99.5\n"));
        assert!(text.contains("ops{kind=\"meter\"}\n             count = 7\n"));
    }

    #[test]
    fn close_renders_last_snapshot_once_more() {
        let buf = SharedBuf::default();
        let reporter = ConsoleReporter::new(buf.clone()).one_last_time(true);
        reporter.on_snapshot(&Arc::new(snapshot())).unwrap();
        reporter.close().unwrap();
        assert_eq!(buf.text().matches("-- Summaries").count(), 2);
    }
}
