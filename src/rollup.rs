//! Coarser reporting intervals built from a faster timer.
//!
//! A [`Rollup`] sits on a base-interval timer and folds consecutive snapshots
//! with [`MetricsSnapshot::combine`] until they cover its own interval, then
//! hands the combined snapshot to the wrapped consumer.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use crate::scheduler::SnapshotConsumer;

#[derive(Default)]
struct Window {
    snapshots: Vec<MetricsSnapshot>,
    covered_ms: i64,
}

pub struct Rollup<C> {
    inner: Arc<C>,
    interval_ms: i64,
    window: Mutex<Window>,
}

impl<C: SnapshotConsumer> Rollup<C> {
    /// Forwards one combined snapshot per `interval_ms` of delivered snapshots.
    pub fn new(inner: Arc<C>, interval_ms: u64) -> Self {
        Self {
            inner,
            interval_ms: i64::try_from(interval_ms).unwrap_or(i64::MAX),
            window: Mutex::new(Window::default()),
        }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Snapshots held for the current window.
    pub fn pending(&self) -> usize {
        self.window.lock().snapshots.len()
    }
}

impl<C: SnapshotConsumer> SnapshotConsumer for Rollup<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        let mut window = self.window.lock();

        // Already as coarse as needed.
        if window.snapshots.is_empty() && snapshot.interval_ms() >= self.interval_ms {
            return self.inner.on_snapshot(snapshot);
        }

        window.snapshots.push(MetricsSnapshot::clone(snapshot));
        window.covered_ms += snapshot.interval_ms().max(1);
        if window.covered_ms < self.interval_ms {
            return Ok(());
        }

        let parts = std::mem::take(&mut window.snapshots);
        window.covered_ms -= self.interval_ms;
        drop(window);

        debug!(consumer = self.inner.name(), parts = parts.len(), "combining snapshots");
        let combined = MetricsSnapshot::combine(&parts)?;
        self.inner.on_snapshot(&Arc::new(combined))
    }

    /// Closes the wrapped consumer. A partly filled window is dropped.
    fn close(&self) -> Result<()> {
        let dropped = std::mem::take(&mut *self.window.lock());
        if !dropped.snapshots.is_empty() {
            debug!(
                consumer = self.inner.name(),
                parts = dropped.snapshots.len(),
                "dropping partial rollup window"
            );
        }
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelSet;
    use crate::metrics::{MetricFamily, MetricType, Sample};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Arc<MetricsSnapshot>>>,
    }

    impl SnapshotConsumer for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
            self.seen.lock().push(snapshot.clone());
            Ok(())
        }
    }

    fn tick(captured_at_ms: i64, requests: f64) -> Arc<MetricsSnapshot> {
        let family = MetricFamily::new(
            "requests_total",
            MetricType::Counter,
            vec![Sample::point("requests_total", LabelSet::from_pairs([("region", "us")]), requests)],
        )
        .unwrap()
        .with_categories(["core"]);
        Arc::new(MetricsSnapshot::new(captured_at_ms, 1_000, vec![family]))
    }

    #[test]
    fn combines_base_ticks_into_one_window() {
        let recorder = Arc::new(Recorder::default());
        let rollup = Rollup::new(recorder.clone(), 3_000);

        rollup.on_snapshot(&tick(1_000, 2.0)).unwrap();
        rollup.on_snapshot(&tick(2_000, 3.0)).unwrap();
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(rollup.pending(), 2);

        rollup.on_snapshot(&tick(3_000, 5.0)).unwrap();
        assert_eq!(rollup.pending(), 0);

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        let combined = &seen[0];
        assert_eq!(combined.interval_ms(), 3_000);
        assert_eq!(combined.captured_at_ms(), 3_000);
        let family = &combined.families()[0];
        assert_eq!(family.categories(), ["core"]);
        match &family.samples()[0] {
            Sample::Point(point) => assert_eq!(point.value, 10.0),
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[test]
    fn same_interval_passes_snapshots_through() {
        let recorder = Arc::new(Recorder::default());
        let rollup = Rollup::new(recorder.clone(), 1_000);
        let snapshot = tick(1_000, 1.0);

        rollup.on_snapshot(&snapshot).unwrap();
        assert!(Arc::ptr_eq(&recorder.seen.lock()[0], &snapshot));
    }

    #[test]
    fn close_drops_a_partial_window() {
        let recorder = Arc::new(Recorder::default());
        let rollup = Rollup::new(recorder.clone(), 5_000);
        rollup.on_snapshot(&tick(1_000, 1.0)).unwrap();
        rollup.close().unwrap();
        assert_eq!(rollup.pending(), 0);
        assert!(recorder.seen.lock().is_empty());
    }
}
