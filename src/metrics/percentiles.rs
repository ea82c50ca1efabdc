use hdrhistogram::Histogram;
use serde::Serialize;

/// Quantiles reported for every summary sample captured from a histogram.
pub const DEFAULT_QUANTILES: [f64; 7] = [0.5, 0.75, 0.90, 0.95, 0.98, 0.99, 0.999];

/// Quantile keys closer than this are treated as the same quantile.
const QUANTILE_EPSILON: f64 = 1e-9;

/// One quantile → value pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuantileValue {
    pub quantile: f64,
    pub value: f64,
}

/// Quantile map kept sorted by quantile, ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Quantiles {
    entries: Vec<QuantileValue>,
}

impl Quantiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds from unordered pairs; a repeated quantile keeps its last value.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut quantiles = Self::new();
        for (quantile, value) in pairs {
            quantiles.insert(quantile, value);
        }
        quantiles
    }

    /// Extract the default quantile set from an HdrHistogram.
    /// Returns zeroed values if the histogram is empty.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        Self::from_pairs(DEFAULT_QUANTILES.iter().map(|&q| {
            let value = if hist.is_empty() {
                0.0
            } else {
                hist.value_at_quantile(q) as f64
            };
            (q, value)
        }))
    }

    pub fn insert(&mut self, quantile: f64, value: f64) {
        match self
            .entries
            .binary_search_by(|e| e.quantile.total_cmp(&quantile))
        {
            Ok(i) => self.entries[i].value = value,
            Err(i) => self.entries.insert(i, QuantileValue { quantile, value }),
        }
    }

    /// Value recorded for `quantile`, matched with a small tolerance.
    pub fn get(&self, quantile: f64) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| (e.quantile - quantile).abs() < QUANTILE_EPSILON)
            .map(|e| e.value)
    }

    /// Like [`get`](Self::get) but NaN when the quantile is missing.
    pub fn value_or_nan(&self, quantile: f64) -> f64 {
        self.get(quantile).unwrap_or(f64::NAN)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuantileValue> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Count / extremes / moments of one summary sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryStatistics {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

impl SummaryStatistics {
    /// Extract count and moments from an HdrHistogram.
    /// Returns zeroed values if the histogram is empty.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::empty();
        }

        Self {
            count: hist.len(),
            min: hist.min() as f64,
            max: hist.max() as f64,
            mean: hist.mean(),
            stddev: hist.stdev(),
        }
    }

    /// All-zero placeholder used before any observations are recorded.
    pub fn empty() -> Self {
        Self {
            count: 0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            stddev: 0.0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}

/// Rolling throughput averages, in events per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateStatistics {
    pub mean: f64,
    pub one_minute: f64,
    pub five_minute: f64,
    pub fifteen_minute: f64,
}
