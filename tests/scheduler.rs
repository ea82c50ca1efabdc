use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snapshot_export::labels::LabelSet;
use snapshot_export::registry::{Registry, Scope};
use snapshot_export::{ExportError, MetricsSnapshot, Result, SnapshotConsumer, SnapshotScheduler};

/// Remembers every snapshot it is handed.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Arc<MetricsSnapshot>>>,
    closed: AtomicBool,
}

impl Recorder {
    fn deliveries(&self) -> usize {
        self.seen.lock().len()
    }
}

impl SnapshotConsumer for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        self.seen.lock().push(snapshot.clone());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

impl SnapshotConsumer for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn on_snapshot(&self, _snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        Err(ExportError::Runtime("sink unavailable".into()))
    }
}

fn registry_with_two_activities() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry
        .counter("reads", &LabelSet::from_pairs([("activity", "read")]), "")
        .inc();
    registry
        .counter("writes", &LabelSet::from_pairs([("activity", "write")]), "")
        .inc();
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumers_receive_periodic_snapshots() {
    let scheduler = SnapshotScheduler::new(registry_with_two_activities()).unwrap();
    let recorder = Arc::new(Recorder::default());
    let _registration = scheduler.register(Scope::root(), 20, recorder.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let seen = recorder.seen.lock().clone();
    assert!(seen.len() >= 2, "expected at least two ticks, got {}", seen.len());
    assert!(seen.iter().all(|s| s.interval_ms() == 20));
    assert!(seen.windows(2).all(|w| w[0].captured_at_ms() <= w[1].captured_at_ms()));
    assert_eq!(seen[0].families().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumers_with_the_same_scope_and_interval_share_a_timer() {
    let scheduler = SnapshotScheduler::new(registry_with_two_activities()).unwrap();
    let a = Arc::new(Recorder::default());
    let b = Arc::new(Recorder::default());

    let _ra = scheduler.register(Scope::root(), 25, a.clone()).unwrap();
    let _rb = scheduler.register(Scope::root(), 25, b.clone()).unwrap();
    let _rc = scheduler.register(Scope::root(), 1_000, Arc::new(Recorder::default())).unwrap();

    assert_eq!(scheduler.timer_count(), 2);
    assert_eq!(scheduler.consumer_count(&Scope::root(), 25), 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(a.deliveries() >= 1);

    // Both consumers of a tick see the very same snapshot.
    let first_a = a.seen.lock()[0].clone();
    let first_b = b.seen.lock()[0].clone();
    assert!(Arc::ptr_eq(&first_a, &first_b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_last_registration_stops_the_timer() {
    let scheduler = SnapshotScheduler::new(registry_with_two_activities()).unwrap();
    let recorder = Arc::new(Recorder::default());
    let registration = scheduler.register(Scope::root(), 20, recorder.clone()).unwrap();
    assert_eq!(registration.interval_ms(), 20);

    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.unregister(registration);
    assert_eq!(scheduler.timer_count(), 0);

    let settled = recorder.deliveries();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.deliveries(), settled);
}

/// Takes its time inside every delivery.
#[derive(Default)]
struct Slow {
    started: AtomicBool,
}

impl SnapshotConsumer for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn on_snapshot(&self, _snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        Ok(())
    }
}

/// Logs deliveries and closes in the order they happen.
#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<&'static str>>,
}

impl SnapshotConsumer for EventLog {
    fn name(&self) -> &str {
        "event-log"
    }

    fn on_snapshot(&self, _snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        self.events.lock().push("snapshot");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.events.lock().push("close");
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_waits_for_a_delivery_in_flight() {
    let scheduler = SnapshotScheduler::new(registry_with_two_activities()).unwrap();
    let slow = Arc::new(Slow::default());
    let log = Arc::new(EventLog::default());

    let _slow = scheduler.register(Scope::root(), 50, slow.clone()).unwrap();
    let attached = scheduler.attach(Scope::root(), 50, log.clone()).unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !slow.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // The pass that is inside `slow` still has `log` queued after it.
    tokio::task::spawn_blocking(move || attached.close())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.events.lock().last(), Some(&"close"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let events = log.events.lock().clone();
    assert_eq!(events.iter().filter(|e| **e == "close").count(), 1);
    assert_eq!(events.last(), Some(&"close"));
    assert_eq!(scheduler.consumer_count(&Scope::root(), 50), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_are_reported_and_other_consumers_still_deliver() {
    let scheduler = SnapshotScheduler::new(registry_with_two_activities()).unwrap();
    let mut failures = scheduler.take_failures().unwrap();
    assert!(scheduler.take_failures().is_none());

    let recorder = Arc::new(Recorder::default());
    let _failing = scheduler.register(Scope::root(), 20, Arc::new(Failing)).unwrap();
    let _recorder = scheduler.register(Scope::root(), 20, recorder.clone()).unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(2), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.consumer, "failing");
    assert!(matches!(failure.error, ExportError::Runtime(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorder.deliveries() >= 1);
}

#[tokio::test]
async fn tick_now_captures_only_the_scope() {
    let scheduler = SnapshotScheduler::new(registry_with_two_activities()).unwrap();
    let recorder = Arc::new(Recorder::default());
    let reads = Scope::matching(LabelSet::from_pairs([("activity", "read")]));
    let _registration = scheduler.register(reads.clone(), 60_000, recorder.clone()).unwrap();

    let snapshot = scheduler.tick_now(&reads, 60_000).unwrap();
    assert_eq!(snapshot.families().len(), 1);
    assert_eq!(snapshot.families()[0].family_name(), "reads_total");
    assert_eq!(recorder.deliveries(), 1);

    assert!(scheduler.tick_now(&Scope::root(), 60_000).is_none());
}

#[tokio::test]
async fn empty_scopes_are_skipped() {
    let scheduler = SnapshotScheduler::new(Arc::new(Registry::new())).unwrap();
    let recorder = Arc::new(Recorder::default());
    let _registration = scheduler.register(Scope::root(), 60_000, recorder.clone()).unwrap();

    assert!(scheduler.tick_now(&Scope::root(), 60_000).is_none());
    assert_eq!(recorder.deliveries(), 0);
}

#[tokio::test]
async fn zero_interval_is_rejected() {
    let scheduler = SnapshotScheduler::new(registry_with_two_activities()).unwrap();
    let err = scheduler
        .register(Scope::root(), 0, Arc::new(Recorder::default()))
        .err()
        .unwrap();
    assert!(err.is_config());
    assert_eq!(scheduler.timer_count(), 0);
}

#[tokio::test]
async fn attached_consumers_are_closed_with_their_guard() {
    let scheduler = SnapshotScheduler::new(registry_with_two_activities()).unwrap();
    let recorder = Arc::new(Recorder::default());

    let attached = scheduler.attach(Scope::root(), 60_000, recorder.clone()).unwrap();
    assert!(Arc::ptr_eq(attached.consumer(), &recorder));
    attached.close().unwrap();
    assert!(recorder.closed.load(Ordering::SeqCst));
    assert_eq!(scheduler.timer_count(), 0);

    let dropped = Arc::new(Recorder::default());
    drop(scheduler.attach(Scope::root(), 60_000, dropped.clone()).unwrap());
    assert!(dropped.closed.load(Ordering::SeqCst));
}

#[test]
fn scheduler_requires_a_runtime() {
    let err = SnapshotScheduler::new(Arc::new(Registry::new())).err().unwrap();
    assert!(matches!(err, ExportError::Runtime(_)));
}
