pub mod combine;
pub mod family;
pub mod percentiles;
pub mod sample;
pub mod snapshot;
pub mod stream;

pub use family::{MetricFamily, MetricType};
pub use percentiles::{
    QuantileValue, Quantiles, RateStatistics, SummaryStatistics, DEFAULT_QUANTILES,
};
pub use sample::{MeterSample, PointSample, Sample, SummarySample};
pub use snapshot::{sanitize_metric_name, MetricsSnapshot};
