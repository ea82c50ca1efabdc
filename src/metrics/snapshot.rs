use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use super::combine::FamilyAccumulator;
use super::family::{MetricFamily, MetricType};
use super::percentiles::{Quantiles, RateStatistics, SummaryStatistics};
use super::sample::{MeterSample, PointSample, Sample, SummarySample};
use crate::error::Result;
use crate::labels::LabelSet;
use crate::registry::{Instrument, InstrumentId, InstrumentKind, MeterReading};

/// Complete, immutable view of every metric family at one instant.
/// Built once per scheduler tick and shared read-only with every consumer.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    captured_at_ms: i64,
    interval_ms: i64,
    families: Vec<MetricFamily>,
}

impl MetricsSnapshot {
    pub fn new(captured_at_ms: i64, interval_ms: i64, families: Vec<MetricFamily>) -> Self {
        Self {
            captured_at_ms,
            interval_ms,
            families,
        }
    }

    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at_ms
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Start of the window this snapshot covers.
    pub fn window_start_ms(&self) -> i64 {
        if self.interval_ms > 0 {
            self.captured_at_ms - self.interval_ms
        } else {
            self.captured_at_ms
        }
    }

    pub fn families(&self) -> &[MetricFamily] {
        &self.families
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Every (family, sample) pair, in family then sample order.
    pub fn samples(&self) -> impl Iterator<Item = (&MetricFamily, &Sample)> {
        self.families
            .iter()
            .flat_map(|family| family.samples().iter().map(move |s| (family, s)))
    }

    /// Reads every instrument and groups the results into families.
    pub fn capture(
        instruments: &[Arc<Instrument>],
        interval_ms: i64,
        captured_at_ms: i64,
    ) -> Result<Self> {
        let mut order: Vec<FamilyBuilder> = Vec::new();
        let mut index: HashMap<(MetricType, String), usize> = HashMap::new();

        for instrument in instruments {
            let metric_type = classify(instrument.kind());
            let family_name = sanitize_metric_name(instrument.name(), metric_type);
            let slot = *index
                .entry((metric_type, family_name.clone()))
                .or_insert_with(|| {
                    order.push(FamilyBuilder {
                        family_name: family_name.clone(),
                        original_name: instrument.name().to_owned(),
                        help: instrument.description().to_owned(),
                        unit: instrument.unit().unwrap_or("").to_owned(),
                        categories: instrument.categories().to_vec(),
                        metric_type,
                        samples: Vec::new(),
                    });
                    order.len() - 1
                });
            order[slot]
                .samples
                .push(read_sample(instrument, &family_name));
        }

        let families = order
            .into_iter()
            .map(FamilyBuilder::build)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(captured_at_ms, interval_ms, families))
    }

    /// Merges several snapshots into one covering their summed interval.
    ///
    /// Samples are matched by family identity, sample name and labels.
    /// The result carries the latest capture time.
    pub fn combine(snapshots: &[MetricsSnapshot]) -> Result<Self> {
        let mut ordered: Vec<&MetricsSnapshot> = snapshots.iter().collect();
        ordered.sort_by_key(|s| s.captured_at_ms);

        let Some(latest) = ordered.last() else {
            return Ok(Self::new(chrono::Utc::now().timestamp_millis(), 0, Vec::new()));
        };
        let captured_at_ms = latest.captured_at_ms;
        let interval_ms = ordered.iter().map(|s| s.interval_ms).sum();

        let mut accumulators: Vec<FamilyAccumulator> = Vec::new();
        for snapshot in &ordered {
            for family in &snapshot.families {
                match accumulators.iter_mut().find(|a| a.matches(family)) {
                    Some(acc) => acc.add_family(family, snapshot.interval_ms),
                    None => {
                        let mut acc = FamilyAccumulator::new(family);
                        acc.add_family(family, snapshot.interval_ms);
                        accumulators.push(acc);
                    }
                }
            }
        }

        let families = accumulators
            .into_iter()
            .map(FamilyAccumulator::build)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(captured_at_ms, interval_ms, families))
    }
}

// ─── Capture helpers ─────────────────────────────────────────────

struct FamilyBuilder {
    family_name: String,
    original_name: String,
    help: String,
    unit: String,
    categories: Vec<String>,
    metric_type: MetricType,
    samples: Vec<Sample>,
}

impl FamilyBuilder {
    fn build(self) -> Result<MetricFamily> {
        Ok(MetricFamily::new(self.family_name, self.metric_type, self.samples)?
            .with_original_name(self.original_name)
            .with_help(self.help)
            .with_unit(self.unit)
            .with_categories(self.categories))
    }
}

fn classify(kind: &InstrumentKind) -> MetricType {
    match kind {
        InstrumentKind::Counter(_) => MetricType::Counter,
        InstrumentKind::Gauge(_) | InstrumentKind::Meter(_) => MetricType::Gauge,
        InstrumentKind::Histogram(_) | InstrumentKind::Timer(_) => MetricType::Summary,
    }
}

fn read_sample(instrument: &Instrument, family_name: &str) -> Sample {
    let sample_name = family_name.to_owned();
    let labels = instrument.labels().clone();
    let id = Some(instrument.id());

    match instrument.kind() {
        InstrumentKind::Counter(counter) => Sample::Point(PointSample {
            sample_name,
            labels,
            instrument: id,
            value: counter.get() as f64,
        }),
        InstrumentKind::Gauge(gauge) => Sample::Point(PointSample {
            sample_name,
            labels,
            instrument: id,
            value: gauge.get(),
        }),
        InstrumentKind::Meter(meter) => {
            let reading = meter.reading();
            Sample::Meter(MeterSample {
                sample_name,
                labels,
                instrument: id,
                count: reading.count,
                mean_rate: reading.mean_rate,
                m1_rate: reading.m1_rate,
                m5_rate: reading.m5_rate,
                m15_rate: reading.m15_rate,
            })
        }
        InstrumentKind::Histogram(histogram) => {
            summary_sample(sample_name, labels, id, histogram.snapshot(), None)
        }
        InstrumentKind::Timer(timer) => summary_sample(
            sample_name,
            labels,
            id,
            timer.snapshot(),
            Some(rates_of(timer.rates())),
        ),
    }
}

fn summary_sample(
    sample_name: String,
    labels: LabelSet,
    instrument: Option<InstrumentId>,
    hist: hdrhistogram::Histogram<u64>,
    rates: Option<RateStatistics>,
) -> Sample {
    let statistics = SummaryStatistics::from_histogram(&hist);
    Sample::Summary(SummarySample {
        sample_name,
        labels,
        instrument,
        quantiles: Quantiles::from_histogram(&hist),
        sum: statistics.count as f64 * statistics.mean,
        statistics,
        rates,
        histogram: Some(Arc::new(hist)),
    })
}

fn rates_of(reading: MeterReading) -> RateStatistics {
    RateStatistics {
        mean: reading.mean_rate,
        one_minute: reading.m1_rate,
        five_minute: reading.m5_rate,
        fifteen_minute: reading.m15_rate,
    }
}

/// Maps an instrument name onto `[a-zA-Z0-9_:]`, never starting with a digit.
/// Counter names always end in `_total`.
pub fn sanitize_metric_name(raw: &str, metric_type: MetricType) -> String {
    let trimmed = raw.trim();
    let mut name: String = if trimmed.is_empty() {
        "unnamed_metric".to_owned()
    } else {
        trimmed
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    if metric_type == MetricType::Counter && !name.ends_with("_total") {
        name.push_str("_total");
    }
    name
}
