use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::InstrumentId;

/// Rates decay on a fixed 5 s tick.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Exponentially weighted moving average over a window of `minutes`.
struct Ewma {
    alpha: f64,
    rate: f64,
    initialized: bool,
    uncounted: u64,
}

impl Ewma {
    fn over_minutes(minutes: f64) -> Self {
        Self {
            alpha: 1.0 - (-TICK_INTERVAL.as_secs_f64() / 60.0 / minutes).exp(),
            rate: 0.0,
            initialized: false,
            uncounted: 0,
        }
    }

    fn update(&mut self, n: u64) {
        self.uncounted += n;
    }

    fn tick(&mut self) {
        let instant_rate = self.uncounted as f64 / TICK_INTERVAL.as_secs_f64();
        self.uncounted = 0;
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }
}

/// Point-in-time view of a meter; rates are events per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub count: u64,
    pub mean_rate: f64,
    pub m1_rate: f64,
    pub m5_rate: f64,
    pub m15_rate: f64,
}

/// Event counter with a mean rate and 1/5/15 minute moving rates.
pub struct Meter {
    id: InstrumentId,
    state: Mutex<MeterState>,
}

struct MeterState {
    count: u64,
    started: Instant,
    last_tick: Instant,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl MeterState {
    fn tick_if_necessary(&mut self, now: Instant) {
        let age = now.saturating_duration_since(self.last_tick);
        if age < TICK_INTERVAL {
            return;
        }
        let ticks = (age.as_nanos() / TICK_INTERVAL.as_nanos()) as u32;
        self.last_tick += TICK_INTERVAL * ticks;
        for _ in 0..ticks {
            self.m1.tick();
            self.m5.tick();
            self.m15.tick();
        }
    }
}

impl Meter {
    pub(crate) fn new(id: InstrumentId) -> Self {
        Self::starting_at(id, Instant::now())
    }

    fn starting_at(id: InstrumentId, started: Instant) -> Self {
        Self {
            id,
            state: Mutex::new(MeterState {
                count: 0,
                started,
                last_tick: started,
                m1: Ewma::over_minutes(1.0),
                m5: Ewma::over_minutes(5.0),
                m15: Ewma::over_minutes(15.0),
            }),
        }
    }

    pub fn id(&self) -> InstrumentId {
        self.id
    }

    pub fn mark(&self, n: u64) {
        self.mark_at(n, Instant::now());
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn reading(&self) -> MeterReading {
        self.reading_at(Instant::now())
    }

    fn mark_at(&self, n: u64, now: Instant) {
        let mut state = self.state.lock();
        state.tick_if_necessary(now);
        state.count += n;
        state.m1.update(n);
        state.m5.update(n);
        state.m15.update(n);
    }

    fn reading_at(&self, now: Instant) -> MeterReading {
        let mut state = self.state.lock();
        state.tick_if_necessary(now);

        let elapsed = now.saturating_duration_since(state.started).as_secs_f64();
        let mean_rate = if state.count == 0 || elapsed <= 0.0 {
            0.0
        } else {
            state.count as f64 / elapsed
        };

        MeterReading {
            count: state.count,
            mean_rate,
            m1_rate: state.m1.rate,
            m5_rate: state.m5.rate,
            m15_rate: state.m15.rate,
        }
    }
}
