//! Accumulators that fold several snapshots into one.
//!
//! Counters sum, points and rates are weighted by snapshot interval,
//! quantiles are weighted by observation count.

use std::collections::BTreeMap;
use std::sync::Arc;

use hdrhistogram::Histogram;

use super::family::{MetricFamily, MetricType};
use super::percentiles::{Quantiles, RateStatistics, SummaryStatistics};
use super::sample::{MeterSample, PointSample, Sample, SummarySample};
use crate::error::Result;
use crate::labels::LabelSet;
use crate::registry::InstrumentId;

/// Weight of one snapshot; a zero interval still counts once.
fn interval_weight(interval_ms: i64) -> f64 {
    if interval_ms > 0 {
        interval_ms as f64
    } else {
        1.0
    }
}

// ─── Families ────────────────────────────────────────────────────

pub(super) struct FamilyAccumulator {
    family_name: String,
    original_name: String,
    metric_type: MetricType,
    unit: String,
    help: String,
    categories: Vec<String>,
    samples: Vec<SampleAccumulator>,
}

impl FamilyAccumulator {
    pub(super) fn new(family: &MetricFamily) -> Self {
        Self {
            family_name: family.family_name().to_owned(),
            original_name: family.original_name().to_owned(),
            metric_type: family.metric_type(),
            unit: family.unit().to_owned(),
            help: family.help().to_owned(),
            categories: family.categories().to_vec(),
            samples: Vec::new(),
        }
    }

    pub(super) fn matches(&self, family: &MetricFamily) -> bool {
        self.family_name == family.family_name()
            && self.original_name == family.original_name()
            && self.metric_type == family.metric_type()
            && self.unit == family.unit()
            && self.help == family.help()
    }

    pub(super) fn add_family(&mut self, family: &MetricFamily, interval_ms: i64) {
        for sample in family.samples() {
            let existing = self
                .samples
                .iter_mut()
                .find(|acc| acc.accepts(sample));
            match existing {
                Some(acc) => acc.add(sample, interval_ms),
                None => {
                    let mut acc = SampleAccumulator::new(sample, self.metric_type);
                    acc.add(sample, interval_ms);
                    self.samples.push(acc);
                }
            }
        }
    }

    pub(super) fn build(self) -> Result<MetricFamily> {
        let samples = self.samples.into_iter().map(SampleAccumulator::build).collect();
        Ok(MetricFamily::new(self.family_name, self.metric_type, samples)?
            .with_original_name(self.original_name)
            .with_unit(self.unit)
            .with_help(self.help)
            .with_categories(self.categories))
    }
}

// ─── Samples ─────────────────────────────────────────────────────

struct SampleAccumulator {
    sample_name: String,
    labels: LabelSet,
    instrument: Option<InstrumentId>,
    state: SampleState,
}

enum SampleState {
    Counter { total: f64 },
    Point { value: WeightedValue },
    Meter(MeterState),
    Summary(Box<SummaryState>),
}

impl SampleAccumulator {
    fn new(sample: &Sample, family_type: MetricType) -> Self {
        let state = match sample {
            Sample::Point(_) if family_type == MetricType::Counter => {
                SampleState::Counter { total: 0.0 }
            }
            Sample::Point(_) => SampleState::Point {
                value: WeightedValue::default(),
            },
            Sample::Meter(_) => SampleState::Meter(MeterState::default()),
            Sample::Summary(_) => SampleState::Summary(Box::default()),
        };
        Self {
            sample_name: sample.name().to_owned(),
            labels: sample.labels().clone(),
            instrument: sample.instrument(),
            state,
        }
    }

    /// Same series and same sample variant.
    fn accepts(&self, sample: &Sample) -> bool {
        let same_kind = matches!(
            (&self.state, sample),
            (SampleState::Counter { .. } | SampleState::Point { .. }, Sample::Point(_))
                | (SampleState::Meter(_), Sample::Meter(_))
                | (SampleState::Summary(_), Sample::Summary(_))
        );
        same_kind && self.sample_name == sample.name() && &self.labels == sample.labels()
    }

    fn add(&mut self, sample: &Sample, interval_ms: i64) {
        let weight = interval_weight(interval_ms);
        match (&mut self.state, sample) {
            (SampleState::Counter { total }, Sample::Point(p)) => {
                if p.value.is_finite() {
                    *total += p.value;
                }
            }
            (SampleState::Point { value }, Sample::Point(p)) => value.add(p.value, weight),
            (SampleState::Meter(state), Sample::Meter(m)) => state.add(m, weight),
            (SampleState::Summary(state), Sample::Summary(s)) => state.add(s, weight),
            // accepts() keeps variants aligned
            _ => {}
        }
    }

    fn build(self) -> Sample {
        let Self {
            sample_name,
            labels,
            instrument,
            state,
        } = self;
        match state {
            SampleState::Counter { total } => Sample::Point(PointSample {
                sample_name,
                labels,
                instrument,
                value: total,
            }),
            SampleState::Point { value } => Sample::Point(PointSample {
                sample_name,
                labels,
                instrument,
                value: value.value(),
            }),
            SampleState::Meter(state) => {
                let rates = state.rates.value();
                Sample::Meter(MeterSample {
                    sample_name,
                    labels,
                    instrument,
                    count: state.count,
                    mean_rate: rates.mean,
                    m1_rate: rates.one_minute,
                    m5_rate: rates.five_minute,
                    m15_rate: rates.fifteen_minute,
                })
            }
            SampleState::Summary(state) => state.build(sample_name, labels, instrument),
        }
    }
}

#[derive(Default)]
struct WeightedValue {
    weighted_sum: f64,
    weight_total: f64,
}

impl WeightedValue {
    /// Non-finite values are ignored.
    fn add(&mut self, value: f64, weight: f64) {
        if !value.is_finite() {
            return;
        }
        self.weighted_sum += value * weight;
        self.weight_total += weight;
    }

    fn value(&self) -> f64 {
        if self.weight_total > 0.0 {
            self.weighted_sum / self.weight_total
        } else {
            f64::NAN
        }
    }
}

#[derive(Default)]
struct WeightedRates {
    mean: f64,
    one_minute: f64,
    five_minute: f64,
    fifteen_minute: f64,
    weight_total: f64,
}

impl WeightedRates {
    fn add(&mut self, rates: &RateStatistics, weight: f64) {
        self.mean += rates.mean * weight;
        self.one_minute += rates.one_minute * weight;
        self.five_minute += rates.five_minute * weight;
        self.fifteen_minute += rates.fifteen_minute * weight;
        self.weight_total += weight;
    }

    fn is_empty(&self) -> bool {
        self.weight_total <= 0.0
    }

    fn value(&self) -> RateStatistics {
        let divisor = if self.is_empty() { 1.0 } else { self.weight_total };
        RateStatistics {
            mean: self.mean / divisor,
            one_minute: self.one_minute / divisor,
            five_minute: self.five_minute / divisor,
            fifteen_minute: self.fifteen_minute / divisor,
        }
    }
}

#[derive(Default)]
struct MeterState {
    count: u64,
    rates: WeightedRates,
}

impl MeterState {
    fn add(&mut self, sample: &MeterSample, weight: f64) {
        self.count += sample.count;
        self.rates.add(&sample.rates(), weight);
    }
}

struct SummaryState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    sum_squares: f64,
    quantiles: BTreeMap<u64, (f64, WeightedValue)>,
    rates: WeightedRates,
    /// Merged distribution; dropped as soon as one input lacks one.
    histogram: Option<Histogram<u64>>,
    seen: usize,
}

impl Default for SummaryState {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum_squares: 0.0,
            quantiles: BTreeMap::new(),
            rates: WeightedRates::default(),
            histogram: None,
            seen: 0,
        }
    }
}

impl SummaryState {
    fn add(&mut self, sample: &SummarySample, interval_weight: f64) {
        let stats = &sample.statistics;
        let count = stats.count as f64;
        self.count += stats.count;
        self.sum += sample.sum;
        self.min = self.min.min(stats.min);
        self.max = self.max.max(stats.max);
        self.sum_squares += count * (stats.stddev * stats.stddev + stats.mean * stats.mean);

        let quantile_weight = if stats.count > 0 { count } else { 1.0 };
        for q in sample.quantiles.iter() {
            self.quantiles
                .entry(q.quantile.to_bits())
                .or_insert_with(|| (q.quantile, WeightedValue::default()))
                .1
                .add(q.value, quantile_weight);
        }

        if let Some(rates) = &sample.rates {
            self.rates.add(rates, interval_weight);
        }

        self.histogram = match (self.seen, self.histogram.take(), &sample.histogram) {
            (0, _, Some(h)) => Some(h.as_ref().clone()),
            (_, Some(mut merged), Some(h)) => merged.add(h.as_ref()).ok().map(|_| merged),
            _ => None,
        };
        self.seen += 1;
    }

    fn build(
        self,
        sample_name: String,
        labels: LabelSet,
        instrument: Option<InstrumentId>,
    ) -> Sample {
        let effective_count = if self.count > 0 { self.count as f64 } else { 1.0 };
        let mean = self.sum / effective_count;
        let variance = (self.sum_squares / effective_count - mean * mean).max(0.0);

        let statistics = SummaryStatistics {
            count: self.count,
            min: if self.min.is_finite() { self.min } else { f64::NAN },
            max: if self.max.is_finite() { self.max } else { f64::NAN },
            mean,
            stddev: variance.sqrt(),
        };
        let quantiles = Quantiles::from_pairs(
            self.quantiles
                .into_values()
                .map(|(quantile, weighted)| (quantile, weighted.value())),
        );
        let rates = (!self.rates.is_empty()).then(|| self.rates.value());

        Sample::Summary(SummarySample {
            sample_name,
            labels,
            instrument,
            statistics,
            quantiles,
            sum: self.sum,
            rates,
            histogram: self.histogram.map(Arc::new),
        })
    }
}
