use std::sync::Arc;

use serde::Deserialize;

use super::filter::InstanceFilter;
use super::{DurationUnit, RATE_UNIT};
use crate::error::Result;
use crate::metrics::{MetricFamily, MetricType, MetricsSnapshot, Sample, SummarySample};
use crate::scheduler::SnapshotConsumer;

/// Target every metrics event is logged under.
pub const LOG_TARGET: &str = "metrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Field values of one logged sample. Unset fields are left off the event.
#[derive(Debug, Clone, Default, PartialEq)]
struct LogEvent {
    kind: &'static str,
    name: String,
    count: Option<u64>,
    value: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    mean: Option<f64>,
    stddev: Option<f64>,
    median: Option<f64>,
    p75: Option<f64>,
    p95: Option<f64>,
    p98: Option<f64>,
    p99: Option<f64>,
    p999: Option<f64>,
    mean_rate: Option<f64>,
    m1_rate: Option<f64>,
    m5_rate: Option<f64>,
    m15_rate: Option<f64>,
    rate_unit: Option<String>,
    duration_unit: Option<&'static str>,
}

// `tracing` levels are fixed per callsite, so each level gets its own.
macro_rules! emit {
    ($level:ident, $event:expr) => {{
        let e = $event;
        tracing::$level!(
            target: LOG_TARGET,
            {
            "type" = e.kind,
            name = e.name.as_str(),
            count = e.count,
            value = e.value,
            min = e.min,
            max = e.max,
            mean = e.mean,
            stddev = e.stddev,
            median = e.median,
            p75 = e.p75,
            p95 = e.p95,
            p98 = e.p98,
            p99 = e.p99,
            p999 = e.p999,
            mean_rate = e.mean_rate,
            m1_rate = e.m1_rate,
            m5_rate = e.m5_rate,
            m15_rate = e.m15_rate,
            rate_unit = e.rate_unit.as_deref(),
            duration_unit = e.duration_unit,
            },
            "metric sample"
        )
    }};
}

/// One structured `tracing` event per sample.
pub struct LogReporter {
    level: LogLevel,
    prefix: String,
    duration_unit: DurationUnit,
    filter: InstanceFilter,
}

impl LogReporter {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            prefix: String::new(),
            duration_unit: DurationUnit::Milliseconds,
            filter: InstanceFilter::new(),
        }
    }

    /// Prepended to every logged name, separated by a dot.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_duration_unit(mut self, unit: DurationUnit) -> Self {
        self.duration_unit = unit;
        self
    }

    pub fn with_filter(mut self, filter: InstanceFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn report(&self, snapshot: &MetricsSnapshot) {
        for (family, sample) in snapshot.samples() {
            if !self.filter.matches_sample(sample) {
                continue;
            }
            let event = self.event(family, sample);
            match self.level {
                LogLevel::Trace => emit!(trace, &event),
                LogLevel::Debug => emit!(debug, &event),
                LogLevel::Info => emit!(info, &event),
                LogLevel::Warn => emit!(warn, &event),
                LogLevel::Error => emit!(error, &event),
            }
        }
    }

    fn event(&self, family: &MetricFamily, sample: &Sample) -> LogEvent {
        let kind = event_type(family, sample);
        let mut event = LogEvent {
            kind,
            name: self.display_name(sample),
            ..LogEvent::default()
        };
        match sample {
            Sample::Point(point) if kind == "COUNTER" => {
                event.count = Some(point.value.max(0.0).round() as u64);
            }
            Sample::Point(point) => event.value = Some(point.value),
            Sample::Meter(meter) => {
                event.count = Some(meter.count);
                event.mean_rate = Some(meter.mean_rate);
                event.m1_rate = Some(meter.m1_rate);
                event.m5_rate = Some(meter.m5_rate);
                event.m15_rate = Some(meter.m15_rate);
                event.rate_unit = Some(format!("events/{RATE_UNIT}"));
            }
            Sample::Summary(summary) => self.fill_summary(&mut event, summary),
        }
        event
    }

    fn fill_summary(&self, event: &mut LogEvent, summary: &SummarySample) {
        let stats = &summary.statistics;
        let convert = |v: f64| match summary.rates {
            Some(_) => self.duration_unit.convert(v),
            None => v,
        };
        let q = |quantile: f64| Some(convert(summary.quantiles.value_or_nan(quantile)));

        event.count = Some(stats.count);
        event.min = Some(convert(stats.min));
        event.max = Some(convert(stats.max));
        event.mean = Some(convert(stats.mean));
        event.stddev = Some(convert(stats.stddev));
        event.median = q(0.5);
        event.p75 = q(0.75);
        event.p95 = q(0.95);
        event.p98 = q(0.98);
        event.p99 = q(0.99);
        event.p999 = q(0.999);

        if let Some(rates) = &summary.rates {
            event.mean_rate = Some(rates.mean);
            event.m1_rate = Some(rates.one_minute);
            event.m5_rate = Some(rates.five_minute);
            event.m15_rate = Some(rates.fifteen_minute);
            event.rate_unit = Some(format!("calls/{RATE_UNIT}"));
            event.duration_unit = Some(self.duration_unit.as_str());
        }
    }

    fn display_name(&self, sample: &Sample) -> String {
        let labels = sample.labels().dimensions();
        let name = if labels.is_empty() {
            sample.name().to_owned()
        } else {
            format!("{}{labels}", sample.name())
        };
        if self.prefix.is_empty() {
            name
        } else {
            format!("{}.{name}", self.prefix)
        }
    }
}

impl SnapshotConsumer for LogReporter {
    fn name(&self) -> &str {
        "log"
    }

    fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        self.report(snapshot);
        Ok(())
    }
}

fn event_type(family: &MetricFamily, sample: &Sample) -> &'static str {
    match (family.metric_type(), sample) {
        (MetricType::Counter, _) => "COUNTER",
        (_, Sample::Point(_)) => "GAUGE",
        (_, Sample::Meter(_)) => "METER",
        (_, Sample::Summary(s)) if s.rates.is_some() => "TIMER",
        (_, Sample::Summary(_)) => "HISTOGRAM",
    }
}
