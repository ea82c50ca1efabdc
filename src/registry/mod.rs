//! In-memory instrument registry.
//!
//! The scheduler only depends on [`InstrumentRegistry`]; [`Registry`] is the
//! concrete implementation used by the demo binary and the tests.

mod instruments;
mod meter;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::labels::LabelSet;

pub use instruments::{Counter, Gauge, Histogram, Timer};
pub use meter::{Meter, MeterReading};

/// Process-wide id source, so ids stay unique across registries.
static NEXT_INSTRUMENT_ID: AtomicU64 = AtomicU64::new(1);

// ─── Errors ──────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("instrument registry unavailable: {0}")]
    Unavailable(String),

    #[error("histogram creation failed: {0}")]
    Histogram(String),
}

// ─── Identity and scope ──────────────────────────────────────────

/// Stable identity of one registered instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstrumentId(u64);

impl InstrumentId {
    fn next() -> Self {
        Self(NEXT_INSTRUMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Label selector deciding which instruments a timer sees.
///
/// An instrument is in scope when its labels contain every selector label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Scope {
    selector: LabelSet,
}

impl Scope {
    /// Scope that sees every instrument.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn matching(selector: LabelSet) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &LabelSet {
        &self.selector
    }

    pub fn contains(&self, labels: &LabelSet) -> bool {
        self.selector.is_subset_of(labels)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.selector.is_empty() {
            f.write_str("root")
        } else {
            f.write_str(&self.selector.canonical())
        }
    }
}

// ─── Instruments ─────────────────────────────────────────────────

/// Typed handle to an instrument's live state.
#[derive(Clone)]
pub enum InstrumentKind {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Meter(Arc<Meter>),
    Histogram(Arc<Histogram>),
    Timer(Arc<Timer>),
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter(_) => "counter",
            Self::Gauge(_) => "gauge",
            Self::Meter(_) => "meter",
            Self::Histogram(_) => "histogram",
            Self::Timer(_) => "timer",
        }
    }
}

/// One registered instrument: identity, labels, description, categories and live state.
#[derive(Clone)]
pub struct Instrument {
    id: InstrumentId,
    labels: LabelSet,
    description: String,
    categories: Vec<String>,
    kind: InstrumentKind,
}

impl Instrument {
    pub fn id(&self) -> InstrumentId {
        self.id
    }

    /// Value of the `name` label, empty when absent.
    pub fn name(&self) -> &str {
        self.labels.get("name").unwrap_or("")
    }

    pub fn unit(&self) -> Option<&str> {
        self.labels.get("unit")
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Free-form groupings such as `core` or `errors`, in assignment order.
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn kind(&self) -> &InstrumentKind {
        &self.kind
    }
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("id", &self.id)
            .field("kind", &self.kind.as_str())
            .field("labels", &self.labels)
            .field("categories", &self.categories)
            .finish()
    }
}

/// Read side the scheduler captures snapshots from.
pub trait InstrumentRegistry: Send + Sync {
    /// Instruments visible in `scope`, in registration order.
    fn find_instruments(&self, scope: &Scope) -> Result<Vec<Arc<Instrument>>, RegistryError>;
}

// ─── Registry ────────────────────────────────────────────────────

/// Thread-safe instrument table.
/// Workload code creates instruments, the scheduler reads them.
#[derive(Default)]
pub struct Registry {
    /// Labels stamped onto every instrument this registry creates.
    base_labels: LabelSet,
    instruments: RwLock<Vec<Arc<Instrument>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_labels(base_labels: LabelSet) -> Self {
        Self {
            base_labels,
            instruments: RwLock::new(Vec::new()),
        }
    }

    pub fn counter(&self, name: &str, labels: &LabelSet, description: &str) -> Arc<Counter> {
        let counter = Arc::new(Counter::new(InstrumentId::next()));
        self.register(
            counter.id(),
            name,
            labels,
            description,
            InstrumentKind::Counter(counter.clone()),
        );
        counter
    }

    pub fn gauge(&self, name: &str, labels: &LabelSet, description: &str) -> Arc<Gauge> {
        let gauge = Arc::new(Gauge::new(InstrumentId::next()));
        self.register(
            gauge.id(),
            name,
            labels,
            description,
            InstrumentKind::Gauge(gauge.clone()),
        );
        gauge
    }

    pub fn meter(&self, name: &str, labels: &LabelSet, description: &str) -> Arc<Meter> {
        let meter = Arc::new(Meter::new(InstrumentId::next()));
        self.register(
            meter.id(),
            name,
            labels,
            description,
            InstrumentKind::Meter(meter.clone()),
        );
        meter
    }

    pub fn histogram(
        &self,
        name: &str,
        labels: &LabelSet,
        description: &str,
    ) -> Result<Arc<Histogram>, RegistryError> {
        let histogram = Arc::new(Histogram::new(InstrumentId::next())?);
        self.register(
            histogram.id(),
            name,
            labels,
            description,
            InstrumentKind::Histogram(histogram.clone()),
        );
        Ok(histogram)
    }

    /// Timers record nanosecond durations; a `unit=nanoseconds` label is added
    /// unless the caller supplied one.
    pub fn timer(
        &self,
        name: &str,
        labels: &LabelSet,
        description: &str,
    ) -> Result<Arc<Timer>, RegistryError> {
        let timer = Arc::new(Timer::new(InstrumentId::next())?);
        let labels = if labels.contains_key("unit") {
            labels.clone()
        } else {
            labels.and("unit", "nanoseconds")
        };
        self.register(
            timer.id(),
            name,
            &labels,
            description,
            InstrumentKind::Timer(timer.clone()),
        );
        Ok(timer)
    }

    /// Replaces the categories of a registered instrument; returns whether it
    /// was present. Snapshots taken earlier keep the old list.
    pub fn categorize<I, S>(&self, id: InstrumentId, categories: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut instruments = self.instruments.write();
        let Some(slot) = instruments.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        let mut updated = Instrument::clone(slot);
        updated.categories = categories.into_iter().map(Into::into).collect();
        *slot = Arc::new(updated);
        true
    }

    /// Drops an instrument from the table; returns whether it was present.
    pub fn remove(&self, id: InstrumentId) -> bool {
        let mut instruments = self.instruments.write();
        let before = instruments.len();
        instruments.retain(|i| i.id != id);
        instruments.len() != before
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }

    fn register(
        &self,
        id: InstrumentId,
        name: &str,
        labels: &LabelSet,
        description: &str,
        kind: InstrumentKind,
    ) {
        let labels = self.base_labels.and_all(labels).and("name", name);
        self.instruments.write().push(Arc::new(Instrument {
            id,
            labels,
            description: description.to_owned(),
            categories: Vec::new(),
            kind,
        }));
    }
}

impl InstrumentRegistry for Registry {
    fn find_instruments(&self, scope: &Scope) -> Result<Vec<Arc<Instrument>>, RegistryError> {
        Ok(self
            .instruments
            .read()
            .iter()
            .filter(|i| scope.contains(&i.labels))
            .cloned()
            .collect())
    }
}
