//! Periodic snapshot capture and fan-out.
//!
//! One tokio task per distinct `(scope, interval)` pair. Each tick captures a
//! snapshot on the blocking pool and hands it to every consumer of that timer,
//! one after another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::{ExportError, Result};
use crate::metrics::MetricsSnapshot;
use crate::registry::{InstrumentRegistry, Scope};

// ─── Consumer contract ───────────────────────────────────────────

/// Anything that wants a snapshot on every tick.
///
/// Delivery is synchronous: a slow consumer delays the consumers after it on
/// the same timer, never other timers.
pub trait SnapshotConsumer: Send + Sync {
    /// Short name used in logs and failure reports.
    fn name(&self) -> &str;

    fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()>;

    /// Flush and release resources. Called once, after unregistering.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A consumer error raised during delivery. The timer keeps running.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub consumer: String,
    pub captured_at_ms: i64,
    pub error: ExportError,
}

// ─── Scheduler ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TimerKey {
    scope: Scope,
    interval_ms: u64,
}

/// Consumer table of one timer, shared with its task.
#[derive(Default)]
struct Timer {
    consumers: RwLock<Vec<(u64, Arc<dyn SnapshotConsumer>)>>,
    /// Held for a whole delivery pass. Unregistering waits on it, so a
    /// consumer is never handed a snapshot once its registration is gone.
    delivering: Mutex<()>,
}

impl Timer {
    /// Blocks until no delivery pass is in flight.
    fn quiesce(&self) {
        drop(self.delivering.lock());
    }
}

struct TimerEntry {
    timer: Arc<Timer>,
    task: JoinHandle<()>,
}

struct Inner {
    registry: Arc<dyn InstrumentRegistry>,
    runtime: Handle,
    timers: Mutex<HashMap<TimerKey, TimerEntry>>,
    next_registration: AtomicU64,
    failures_tx: mpsc::UnboundedSender<DeliveryFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryFailure>>>,
}

/// Owns the timers and the consumer table.
/// Cheap to clone; clones share the same timers.
#[derive(Clone)]
pub struct SnapshotScheduler {
    inner: Arc<Inner>,
}

impl SnapshotScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(registry: Arc<dyn InstrumentRegistry>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ExportError::Runtime(format!("snapshot scheduler needs a tokio runtime: {e}")))?;
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                runtime,
                timers: Mutex::new(HashMap::new()),
                next_registration: AtomicU64::new(1),
                failures_tx,
                failures_rx: Mutex::new(Some(failures_rx)),
            }),
        })
    }

    /// Adds `consumer` to the timer for `(scope, interval_ms)`, starting the
    /// timer if it is the first consumer. Dropping the returned handle
    /// unregisters.
    pub fn register(
        &self,
        scope: Scope,
        interval_ms: u64,
        consumer: Arc<dyn SnapshotConsumer>,
    ) -> Result<Registration> {
        if interval_ms == 0 {
            return Err(ExportError::Config(format!(
                "snapshot interval for consumer '{}' must be > 0",
                consumer.name()
            )));
        }

        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        let key = TimerKey { scope, interval_ms };
        let name = consumer.name().to_owned();

        let mut timers = self.inner.timers.lock();
        match timers.get(&key) {
            Some(entry) => entry.timer.consumers.write().push((id, consumer)),
            None => {
                let timer = Arc::new(Timer::default());
                timer.consumers.write().push((id, consumer));
                let task = self.inner.runtime.spawn(run_timer(
                    Arc::downgrade(&self.inner),
                    key.clone(),
                    timer.clone(),
                ));
                info!(scope = %key.scope, interval_ms, "started snapshot timer");
                timers.insert(key.clone(), TimerEntry { timer, task });
            }
        }
        debug!(consumer = %name, scope = %key.scope, interval_ms, "registered snapshot consumer");

        Ok(Registration {
            id,
            key,
            scheduler: Arc::downgrade(&self.inner),
            active: true,
        })
    }

    /// Registers a consumer and ties its `close()` to the returned guard.
    pub fn attach<C>(&self, scope: Scope, interval_ms: u64, consumer: Arc<C>) -> Result<Attached<C>>
    where
        C: SnapshotConsumer + 'static,
    {
        let registration = self.register(scope, interval_ms, consumer.clone())?;
        Ok(Attached {
            consumer,
            registration: Some(registration),
        })
    }

    /// Removes the consumer and waits for a delivery pass that may still be
    /// handing it a snapshot. Must not be called from inside `on_snapshot`.
    pub fn unregister(&self, registration: Registration) {
        drop(registration);
    }

    /// Captures and delivers one snapshot right now, outside the timer.
    /// Returns `None` when nothing is registered there or the capture was skipped.
    pub fn tick_now(&self, scope: &Scope, interval_ms: u64) -> Option<Arc<MetricsSnapshot>> {
        let key = TimerKey {
            scope: scope.clone(),
            interval_ms,
        };
        let timer = self.inner.timers.lock().get(&key)?.timer.clone();
        self.inner.tick(&key, &timer)
    }

    /// Receiver for consumer failures; only the first caller gets it.
    pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<DeliveryFailure>> {
        self.inner.failures_rx.lock().take()
    }

    /// Number of live timers.
    pub fn timer_count(&self) -> usize {
        self.inner.timers.lock().len()
    }

    /// Number of consumers on the timer for `(scope, interval_ms)`.
    pub fn consumer_count(&self, scope: &Scope, interval_ms: u64) -> usize {
        let key = TimerKey {
            scope: scope.clone(),
            interval_ms,
        };
        self.inner
            .timers
            .lock()
            .get(&key)
            .map(|entry| entry.timer.consumers.read().len())
            .unwrap_or(0)
    }

    /// Stops every timer and waits for deliveries already in flight.
    /// Registrations become no-ops.
    pub fn shutdown(&self) {
        let stopped: Vec<_> = self.inner.timers.lock().drain().collect();
        for (key, entry) in stopped {
            entry.task.abort();
            entry.timer.quiesce();
            info!(scope = %key.scope, interval_ms = key.interval_ms, "stopped snapshot timer");
        }
    }
}

impl Inner {
    fn unregister(&self, id: u64, key: &TimerKey) {
        let timer = {
            let mut timers = self.timers.lock();
            let Some(entry) = timers.get(key) else {
                return;
            };
            let timer = entry.timer.clone();

            let now_empty = {
                let mut consumers = timer.consumers.write();
                consumers.retain(|(cid, _)| *cid != id);
                consumers.is_empty()
            };
            debug!(scope = %key.scope, interval_ms = key.interval_ms, "unregistered snapshot consumer");

            if now_empty {
                if let Some(entry) = timers.remove(key) {
                    entry.task.abort();
                    info!(scope = %key.scope, interval_ms = key.interval_ms, "stopped snapshot timer");
                }
            }
            timer
        };

        // Outside the table lock: a pass that copied the old list may still
        // be running on the blocking pool.
        timer.quiesce();
    }

    /// Capture, then deliver to each consumer in registration order.
    fn tick(&self, key: &TimerKey, timer: &Timer) -> Option<Arc<MetricsSnapshot>> {
        let instruments = match self.registry.find_instruments(&key.scope) {
            Ok(instruments) => instruments,
            Err(e) => {
                warn!(scope = %key.scope, error = %e, "instrument registry read failed; skipping tick");
                return None;
            }
        };
        if instruments.is_empty() {
            debug!(scope = %key.scope, "no instruments in scope; skipping tick");
            return None;
        }

        let captured_at_ms = chrono::Utc::now().timestamp_millis();
        let interval_ms = i64::try_from(key.interval_ms).unwrap_or(i64::MAX);
        let snapshot = match MetricsSnapshot::capture(&instruments, interval_ms, captured_at_ms) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                error!(scope = %key.scope, error = %e, "snapshot capture failed; skipping tick");
                return None;
            }
        };

        let _delivering = timer.delivering.lock();
        // Copy the list so registrations are not blocked by slow consumers.
        let targets: Vec<Arc<dyn SnapshotConsumer>> =
            timer.consumers.read().iter().map(|(_, c)| c.clone()).collect();

        for consumer in targets {
            if let Err(e) = consumer.on_snapshot(&snapshot) {
                error!(consumer = consumer.name(), error = %e, "snapshot delivery failed");
                let _ = self.failures_tx.send(DeliveryFailure {
                    consumer: consumer.name().to_owned(),
                    captured_at_ms,
                    error: e,
                });
            }
        }
        Some(snapshot)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.timers.get_mut().values() {
            entry.task.abort();
        }
    }
}

/// Timer loop. The first tick fires one interval after start; a late tick
/// delays the following ones rather than bursting.
async fn run_timer(scheduler: Weak<Inner>, key: TimerKey, timer: Arc<Timer>) {
    let period = Duration::from_millis(key.interval_ms);
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(interval);

    while ticks.next().await.is_some() {
        let Some(inner) = scheduler.upgrade() else {
            break;
        };
        let tick_key = key.clone();
        let tick_timer = timer.clone();
        let outcome =
            tokio::task::spawn_blocking(move || inner.tick(&tick_key, &tick_timer)).await;
        if let Err(e) = outcome {
            error!(scope = %key.scope, error = %e, "snapshot tick panicked");
        }
    }
}

// ─── Registration handles ────────────────────────────────────────

/// Keeps one consumer registered; unregisters on drop.
pub struct Registration {
    id: u64,
    key: TimerKey,
    scheduler: Weak<Inner>,
    active: bool,
}

impl Registration {
    pub fn scope(&self) -> &Scope {
        &self.key.scope
    }

    pub fn interval_ms(&self) -> u64 {
        self.key.interval_ms
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.scheduler.upgrade() {
            inner.unregister(self.id, &self.key);
        }
    }
}

/// A registered consumer whose `close()` runs when the guard goes away,
/// including during unwinding.
pub struct Attached<C: SnapshotConsumer> {
    consumer: Arc<C>,
    registration: Option<Registration>,
}

impl<C: SnapshotConsumer> Attached<C> {
    pub fn consumer(&self) -> &Arc<C> {
        &self.consumer
    }

    /// Unregisters, then closes the consumer, surfacing the close error.
    /// `close()` runs only after any delivery to this consumer has returned.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        match self.registration.take() {
            Some(registration) => {
                drop(registration);
                self.consumer.close()
            }
            None => Ok(()),
        }
    }
}

impl<C: SnapshotConsumer> Drop for Attached<C> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(consumer = self.consumer.name(), error = %e, "closing snapshot consumer failed");
        }
    }
}
