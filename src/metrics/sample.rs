use std::sync::Arc;

use hdrhistogram::Histogram;
use serde::Serialize;

use super::percentiles::{Quantiles, RateStatistics, SummaryStatistics};
use crate::labels::LabelSet;
use crate::registry::InstrumentId;

/// Single value reported by a gauge or counter.
#[derive(Debug, Clone, Serialize)]
pub struct PointSample {
    pub sample_name: String,
    pub labels: LabelSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<InstrumentId>,
    pub value: f64,
}

/// Running total plus the four rate windows of a meter.
#[derive(Debug, Clone, Serialize)]
pub struct MeterSample {
    pub sample_name: String,
    pub labels: LabelSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<InstrumentId>,
    pub count: u64,
    pub mean_rate: f64,
    pub m1_rate: f64,
    pub m5_rate: f64,
    pub m15_rate: f64,
}

impl MeterSample {
    pub fn rates(&self) -> RateStatistics {
        RateStatistics {
            mean: self.mean_rate,
            one_minute: self.m1_rate,
            five_minute: self.m5_rate,
            fifteen_minute: self.m15_rate,
        }
    }
}

/// Statistical summary of a histogram or timer.
///
/// `rates` is present for timers only. `histogram` keeps a copy of the
/// recorded distribution so sinks can persist it.
#[derive(Debug, Clone, Serialize)]
pub struct SummarySample {
    pub sample_name: String,
    pub labels: LabelSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<InstrumentId>,
    pub statistics: SummaryStatistics,
    pub quantiles: Quantiles,
    pub sum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rates: Option<RateStatistics>,
    #[serde(skip)]
    pub histogram: Option<Arc<Histogram<u64>>>,
}

/// Everything an instrument can report at one instant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sample {
    Point(PointSample),
    Meter(MeterSample),
    Summary(SummarySample),
}

impl Sample {
    pub fn point(sample_name: impl Into<String>, labels: LabelSet, value: f64) -> Self {
        Self::Point(PointSample {
            sample_name: sample_name.into(),
            labels,
            instrument: None,
            value,
        })
    }

    pub fn meter(
        sample_name: impl Into<String>,
        labels: LabelSet,
        count: u64,
        rates: RateStatistics,
    ) -> Self {
        Self::Meter(MeterSample {
            sample_name: sample_name.into(),
            labels,
            instrument: None,
            count,
            mean_rate: rates.mean,
            m1_rate: rates.one_minute,
            m5_rate: rates.five_minute,
            m15_rate: rates.fifteen_minute,
        })
    }

    /// Summary without rates or a retained histogram.
    pub fn summary(
        sample_name: impl Into<String>,
        labels: LabelSet,
        statistics: SummaryStatistics,
        quantiles: Quantiles,
        sum: f64,
    ) -> Self {
        Self::Summary(SummarySample {
            sample_name: sample_name.into(),
            labels,
            instrument: None,
            statistics,
            quantiles,
            sum,
            rates: None,
            histogram: None,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Point(s) => &s.sample_name,
            Self::Meter(s) => &s.sample_name,
            Self::Summary(s) => &s.sample_name,
        }
    }

    pub fn labels(&self) -> &LabelSet {
        match self {
            Self::Point(s) => &s.labels,
            Self::Meter(s) => &s.labels,
            Self::Summary(s) => &s.labels,
        }
    }

    pub fn instrument(&self) -> Option<InstrumentId> {
        match self {
            Self::Point(s) => s.instrument,
            Self::Meter(s) => s.instrument,
            Self::Summary(s) => s.instrument,
        }
    }

    /// Ties the sample to the instrument that produced it.
    pub fn with_instrument(mut self, id: InstrumentId) -> Self {
        match &mut self {
            Self::Point(s) => s.instrument = Some(id),
            Self::Meter(s) => s.instrument = Some(id),
            Self::Summary(s) => s.instrument = Some(id),
        }
        self
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Point(_) => "point",
            Self::Meter(_) => "meter",
            Self::Summary(_) => "summary",
        }
    }

    /// The count a counts-only view would show, when the sample has one.
    pub fn count(&self) -> Option<u64> {
        match self {
            Self::Point(_) => None,
            Self::Meter(s) => Some(s.count),
            Self::Summary(s) => Some(s.statistics.count),
        }
    }
}
