use snapshot_export::labels::LabelSet;
use snapshot_export::metrics::{
    MetricFamily, MetricType, MetricsSnapshot, Quantiles, RateStatistics, Sample,
    SummaryStatistics,
};
use snapshot_export::registry::{InstrumentRegistry, Registry, Scope};
use snapshot_export::reporters::exposition::{format, format_snapshot, Clock};

fn snapshot_at(captured_at_ms: i64, families: Vec<MetricFamily>) -> MetricsSnapshot {
    MetricsSnapshot::new(captured_at_ms, 0, families)
}

fn latency_summary(labels: LabelSet) -> Sample {
    Sample::summary(
        "latency",
        labels,
        SummaryStatistics {
            count: 5,
            min: 1.0,
            max: 50.0,
            mean: 20.0,
            stddev: 0.0,
        },
        Quantiles::from_pairs([(0.99, 50.0), (0.5, 10.0)]),
        100.0,
    )
}

#[test]
fn gauge_point_renders_one_declaration_and_one_line() {
    let family = MetricFamily::new(
        "reqs_total",
        MetricType::Gauge,
        vec![Sample::point(
            "reqs_total",
            LabelSet::from_pairs([("region", "us")]),
            42.0,
        )],
    )
    .unwrap();

    let text = format_snapshot(&snapshot_at(1000, vec![family]));
    assert_eq!(text, "# TYPE reqs_total gauge\nreqs_total{region=\"us\"} 42 1000\n");
}

#[test]
fn summary_renders_quantiles_then_derived_series() {
    let family = MetricFamily::new(
        "latency",
        MetricType::Summary,
        vec![latency_summary(LabelSet::empty())],
    )
    .unwrap();

    let text = format_snapshot(&snapshot_at(1000, vec![family]));
    let expected = "\
# TYPE latency summary
latency{quantile=\"0.5\"} 10 1000
latency{quantile=\"0.99\"} 50 1000
# TYPE latency_count counter
latency_count 5 1000
# TYPE latency_sum counter
latency_sum 100 1000
# TYPE latency_min gauge
latency_min 1 1000
# TYPE latency_max gauge
latency_max 50 1000
";
    assert_eq!(text, expected);
}

#[test]
fn declarations_are_emitted_once_per_name() {
    let family = MetricFamily::new(
        "latency",
        MetricType::Summary,
        vec![
            latency_summary(LabelSet::from_pairs([("host", "a")])),
            latency_summary(LabelSet::from_pairs([("host", "b")])),
        ],
    )
    .unwrap()
    .with_help("request latency")
    .with_unit("milliseconds");

    let text = format_snapshot(&snapshot_at(7, vec![family]));
    assert_eq!(text.matches("# TYPE latency summary").count(), 1);
    assert_eq!(text.matches("# HELP latency request latency").count(), 1);
    assert_eq!(text.matches("# UNIT latency milliseconds").count(), 1);
    assert_eq!(text.matches("# TYPE latency_count counter").count(), 1);
    assert!(text.contains("latency_count{host=\"a\"} 5 7\n"));
    assert!(text.contains("latency_count{host=\"b\"} 5 7\n"));

    // The header precedes the first data line for that name.
    let header = text.find("# TYPE latency_max gauge").unwrap();
    let first = text.find("latency_max{").unwrap();
    assert!(header < first);
}

#[test]
fn meters_become_a_counter_and_rate_gauges() {
    let rates = RateStatistics {
        mean: 1.5,
        one_minute: 0.25,
        five_minute: 2.0,
        fifteen_minute: 3.0,
    };
    let family = MetricFamily::new(
        "ops",
        MetricType::Gauge,
        vec![Sample::meter("ops", LabelSet::empty(), 3, rates)],
    )
    .unwrap();

    let text = format_snapshot(&snapshot_at(1000, vec![family]));
    let expected = "\
# TYPE ops_total counter
ops_total 3 1000
# TYPE ops_mean_rate gauge
ops_mean_rate 1.5 1000
# TYPE ops_m1_rate gauge
ops_m1_rate 0.25 1000
# TYPE ops_m5_rate gauge
ops_m5_rate 2 1000
# TYPE ops_m15_rate gauge
ops_m15_rate 3 1000
";
    assert_eq!(text, expected);
}

#[test]
fn reserved_labels_are_not_rendered() {
    let family = MetricFamily::new(
        "depth",
        MetricType::Gauge,
        vec![Sample::point(
            "depth",
            LabelSet::from_pairs([("name", "depth"), ("unit", "items"), ("queue", "q\"1")]),
            2.5,
        )],
    )
    .unwrap();

    let text = format_snapshot(&snapshot_at(1, vec![family]));
    assert_eq!(text, "# TYPE depth gauge\ndepth{queue=\"q\\\"1\"} 2.5 1\n");
}

#[test]
fn output_is_deterministic_for_a_fixed_clock() {
    let families = vec![
        MetricFamily::new(
            "reqs_total",
            MetricType::Counter,
            vec![
                Sample::point("reqs_total", LabelSet::from_pairs([("region", "us")]), 3.0),
                Sample::point("reqs_total", LabelSet::from_pairs([("region", "eu")]), 4.0),
            ],
        )
        .unwrap(),
        MetricFamily::new(
            "latency",
            MetricType::Summary,
            vec![latency_summary(LabelSet::empty())],
        )
        .unwrap(),
    ];
    let snapshot = snapshot_at(1000, families);

    let a = format(Clock::Fixed(55), &snapshot);
    let b = format(Clock::Fixed(55), &snapshot);
    assert_eq!(a, b);
    assert!(a.starts_with("# TYPE reqs_total counter\nreqs_total{region=\"us\"} 3 55\n"));
    assert_eq!(a.matches("# TYPE reqs_total counter").count(), 1);
}

#[test]
fn empty_snapshot_renders_nothing() {
    assert_eq!(format_snapshot(&snapshot_at(1000, Vec::new())), "");
}

#[test]
fn categories_follow_the_type_declaration() {
    let registry = Registry::new();
    let errors = registry.counter("errors", &LabelSet::empty(), "failed operations");
    errors.inc_by(3);
    assert!(registry.categorize(errors.id(), ["errors", "core"]));

    let instruments = registry.find_instruments(&Scope::root()).unwrap();
    let snapshot = MetricsSnapshot::capture(&instruments, 0, 1000).unwrap();
    assert_eq!(snapshot.families()[0].categories(), ["errors", "core"]);

    let text = format_snapshot(&snapshot);
    assert_eq!(
        text,
        "# HELP errors_total failed operations\n\
         # TYPE errors_total counter\n\
         # CATEGORIES errors_total errors,core\n\
         errors_total 3 1000\n"
    );
}
