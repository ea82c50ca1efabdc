use std::fmt;

use serde::Serialize;

use super::sample::Sample;
use crate::error::{ExportError, Result};

/// Kind of a metric family; decides which sample variants it may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Gauge,
    Counter,
    Summary,
    Histogram,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::Summary => "summary",
            Self::Histogram => "histogram",
        }
    }

    /// Gauge holds points or meters, counter holds points, summary and
    /// histogram hold summaries.
    pub fn accepts(&self, sample: &Sample) -> bool {
        matches!(
            (self, sample),
            (Self::Gauge, Sample::Point(_) | Sample::Meter(_))
                | (Self::Counter, Sample::Point(_))
                | (Self::Summary | Self::Histogram, Sample::Summary(_))
        )
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named, typed group of samples.
#[derive(Debug, Clone, Serialize)]
pub struct MetricFamily {
    family_name: String,
    original_name: String,
    help: String,
    unit: String,
    metric_type: MetricType,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    categories: Vec<String>,
    samples: Vec<Sample>,
}

impl MetricFamily {
    /// Validates every sample against the family type.
    pub fn new(
        family_name: impl Into<String>,
        metric_type: MetricType,
        samples: Vec<Sample>,
    ) -> Result<Self> {
        let family_name = family_name.into();
        for sample in &samples {
            check_sample(&family_name, metric_type, sample)?;
        }
        Ok(Self {
            original_name: family_name.clone(),
            family_name,
            help: String::new(),
            unit: String::new(),
            metric_type,
            categories: Vec::new(),
            samples,
        })
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// Records the name the family had before normalization.
    pub fn with_original_name(mut self, original_name: impl Into<String>) -> Self {
        self.original_name = original_name.into();
        self
    }

    pub fn family_name(&self) -> &str {
        &self.family_name
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn has_meter_samples(&self) -> bool {
        self.samples.iter().any(|s| matches!(s, Sample::Meter(_)))
    }
}

fn check_sample(family: &str, metric_type: MetricType, sample: &Sample) -> Result<()> {
    let invalid = |reason: String| ExportError::InvalidFamily {
        family: family.to_owned(),
        reason,
    };

    if !metric_type.accepts(sample) {
        return Err(invalid(format!(
            "{} family cannot hold a {} sample",
            metric_type,
            sample.variant_name()
        )));
    }
    if let Sample::Summary(summary) = sample {
        if let Some(bad) = summary
            .quantiles
            .iter()
            .find(|q| !(0.0..=1.0).contains(&q.quantile))
        {
            return Err(invalid(format!(
                "quantile {} of sample '{}' is outside [0, 1]",
                bad.quantile, summary.sample_name
            )));
        }
    }
    Ok(())
}
