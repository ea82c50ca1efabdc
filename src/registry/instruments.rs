use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram as HdrHistogram;
use parking_lot::Mutex;

use super::meter::{Meter, MeterReading};
use super::{InstrumentId, RegistryError};

/// HdrHistogram range: 1 → 60e9 (60 s in ns), 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 60_000_000_000;
const HIST_SIGFIG: u8 = 3;

fn new_hdr() -> Result<HdrHistogram<u64>, RegistryError> {
    HdrHistogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
        .map_err(|e| RegistryError::Histogram(format!("{e:?}")))
}

// ─── Counter ─────────────────────────────────────────────────────

/// Monotonic event count.
pub struct Counter {
    id: InstrumentId,
    value: AtomicU64,
}

impl Counter {
    pub(crate) fn new(id: InstrumentId) -> Self {
        Self {
            id,
            value: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> InstrumentId {
        self.id
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ─── Gauge ───────────────────────────────────────────────────────

/// Last-written floating point value.
pub struct Gauge {
    id: InstrumentId,
    bits: AtomicU64,
}

impl Gauge {
    pub(crate) fn new(id: InstrumentId) -> Self {
        Self {
            id,
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn id(&self) -> InstrumentId {
        self.id
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

// ─── Histogram ───────────────────────────────────────────────────

/// Distribution of recorded values (clamped to ≥ 1).
pub struct Histogram {
    id: InstrumentId,
    hist: Mutex<HdrHistogram<u64>>,
}

impl Histogram {
    pub(crate) fn new(id: InstrumentId) -> Result<Self, RegistryError> {
        Ok(Self {
            id,
            hist: Mutex::new(new_hdr()?),
        })
    }

    pub fn id(&self) -> InstrumentId {
        self.id
    }

    pub fn record(&self, value: u64) {
        self.hist.lock().saturating_record(value.max(HIST_LOW));
    }

    /// Copy of the distribution recorded so far.
    pub fn snapshot(&self) -> HdrHistogram<u64> {
        self.hist.lock().clone()
    }
}

// ─── Timer ───────────────────────────────────────────────────────

/// Nanosecond duration histogram paired with a throughput meter.
pub struct Timer {
    id: InstrumentId,
    hist: Mutex<HdrHistogram<u64>>,
    meter: Meter,
}

impl Timer {
    pub(crate) fn new(id: InstrumentId) -> Result<Self, RegistryError> {
        Ok(Self {
            id,
            hist: Mutex::new(new_hdr()?),
            meter: Meter::new(id),
        })
    }

    pub fn id(&self) -> InstrumentId {
        self.id
    }

    pub fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.hist.lock().saturating_record(nanos.max(HIST_LOW));
        self.meter.mark(1);
    }

    /// Runs `f`, recording how long it took.
    pub fn time<T>(&self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(start.elapsed());
        out
    }

    pub fn count(&self) -> u64 {
        self.meter.count()
    }

    pub fn snapshot(&self) -> HdrHistogram<u64> {
        self.hist.lock().clone()
    }

    pub fn rates(&self) -> MeterReading {
        self.meter.reading()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_round_trips_floats() {
        let gauge = Gauge::new(InstrumentId(10));
        assert_eq!(gauge.get(), 0.0);
        gauge.set(-2.5);
        assert_eq!(gauge.get(), -2.5);
    }

    #[test]
    fn histogram_clamps_zero_to_one() {
        let hist = Histogram::new(InstrumentId(11)).unwrap();
        hist.record(0);
        hist.record(10);
        let copy = hist.snapshot();
        assert_eq!(copy.len(), 2);
        assert_eq!(copy.min(), 1);
    }

    #[test]
    fn timer_counts_and_records_nanos() {
        let timer = Timer::new(InstrumentId(12)).unwrap();
        timer.record(Duration::from_micros(5));
        let value = timer.time(|| 7);
        assert_eq!(value, 7);
        assert_eq!(timer.count(), 2);
        assert!(timer.snapshot().max() >= 4_990);
    }
}
