use std::fs;
use std::sync::Arc;

use snapshot_export::labels::LabelSet;
use snapshot_export::metrics::{
    MetricFamily, MetricType, MetricsSnapshot, Quantiles, RateStatistics, Sample,
    SummaryStatistics,
};
use snapshot_export::reporters::{CsvReporter, DurationUnit, InstanceFilter};
use snapshot_export::{ExportError, SnapshotConsumer};

fn depth_snapshot(captured_at_ms: i64) -> MetricsSnapshot {
    let sample = |region: &str, value: f64| {
        Sample::point(
            "depth",
            LabelSet::from_pairs([("name", "depth"), ("region", region)]),
            value,
        )
    };
    MetricsSnapshot::new(
        captured_at_ms,
        1_000,
        vec![MetricFamily::new(
            "depth",
            MetricType::Gauge,
            vec![sample("us", 2.5), sample("eu", 3.0)],
        )
        .unwrap()],
    )
}

#[test]
fn header_is_written_once_across_reporter_instances() {
    let dir = tempfile::tempdir().unwrap();

    let first = CsvReporter::new(dir.path(), InstanceFilter::new()).unwrap();
    first.report(&depth_snapshot(1_500)).unwrap();
    first.close().unwrap();
    assert_eq!(first.open_files(), 0);

    let second = CsvReporter::new(dir.path(), InstanceFilter::new()).unwrap();
    second.report(&depth_snapshot(2_500)).unwrap();
    second.close().unwrap();

    let us = fs::read_to_string(dir.path().join("_region_us.csv")).unwrap();
    assert_eq!(us, "t,value\n1,2.5\n2,2.5\n");
    let eu = fs::read_to_string(dir.path().join("_region_eu.csv")).unwrap();
    assert_eq!(eu, "t,value\n1,3.0\n2,3.0\n");
}

#[test]
fn meter_rows_carry_rates_and_unit() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = CsvReporter::new(dir.path(), InstanceFilter::new()).unwrap();

    let rates = RateStatistics {
        mean: 1.5,
        one_minute: 0.25,
        five_minute: 2.0,
        fifteen_minute: 3.0,
    };
    let snapshot = MetricsSnapshot::new(
        10_000,
        1_000,
        vec![MetricFamily::new(
            "ops",
            MetricType::Gauge,
            vec![Sample::meter("ops", LabelSet::from_pairs([("name", "ops")]), 3, rates)],
        )
        .unwrap()],
    );
    reporter.report(&snapshot).unwrap();

    let text = fs::read_to_string(dir.path().join("ops.csv")).unwrap();
    assert_eq!(
        text,
        "t,count,mean_rate,m1_rate,m5_rate,m15_rate,rate_unit\n\
         10,3,1.500000,0.250000,2.000000,3.000000,events/second\n"
    );
}

#[test]
fn timer_rows_convert_durations() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = CsvReporter::new(dir.path(), InstanceFilter::new())
        .unwrap()
        .with_duration_unit(DurationUnit::Milliseconds);

    let mut sample = Sample::summary(
        "op_latency",
        LabelSet::from_pairs([("name", "op.latency")]),
        SummaryStatistics {
            count: 2,
            min: 1_000_000.0,
            max: 2_000_000.0,
            mean: 1_500_000.0,
            stddev: 500_000.0,
        },
        Quantiles::from_pairs(
            [0.5, 0.75, 0.95, 0.98, 0.99, 0.999]
                .into_iter()
                .map(|q| (q, 2_000_000.0)),
        ),
        3_000_000.0,
    );
    if let Sample::Summary(summary) = &mut sample {
        summary.rates = Some(RateStatistics::default());
    }
    let snapshot = MetricsSnapshot::new(
        4_000,
        1_000,
        vec![MetricFamily::new("op_latency", MetricType::Summary, vec![sample]).unwrap()],
    );
    reporter.report(&snapshot).unwrap();

    let text = fs::read_to_string(dir.path().join("op_latency.csv")).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("t,count,max,mean,min,stddev,p50,p75,p95,p98,p99,p999,mean_rate,m1_rate,m5_rate,m15_rate,rate_unit,duration_unit")
    );
    let row = lines.next().unwrap();
    assert!(row.starts_with("4,2,2.000000,1.500000,1.000000,0.500000,2.000000,"));
    assert!(row.ends_with(",calls/second,milliseconds"));
    assert_eq!(lines.next(), None);
}

#[test]
fn filtered_samples_produce_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let filter = InstanceFilter::from_specs(&["region=eu"]).unwrap();
    let reporter = CsvReporter::new(dir.path(), filter).unwrap();
    reporter.report(&depth_snapshot(1_000)).unwrap();

    assert!(!dir.path().join("_region_us.csv").exists());
    assert!(dir.path().join("_region_eu.csv").exists());
    assert_eq!(reporter.open_files(), 1);
}

#[test]
fn missing_directory_is_created_and_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a").join("b");
    let reporter = CsvReporter::new(&nested, InstanceFilter::new()).unwrap();
    assert!(nested.is_dir());
    assert_eq!(reporter.directory(), nested.as_path());

    let file = dir.path().join("plain.txt");
    fs::write(&file, "x").unwrap();
    let err = CsvReporter::new(&file, InstanceFilter::new()).err().unwrap();
    assert!(matches!(err, ExportError::NotADirectory { .. }));
    assert!(err.is_config());
}

#[test]
fn consumer_delivery_appends_rows() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = CsvReporter::new(dir.path(), InstanceFilter::new()).unwrap();
    let snapshot = Arc::new(depth_snapshot(3_000));
    reporter.on_snapshot(&snapshot).unwrap();
    reporter.on_snapshot(&snapshot).unwrap();

    let us = fs::read_to_string(dir.path().join("_region_us.csv")).unwrap();
    assert_eq!(us.lines().count(), 3);
}
