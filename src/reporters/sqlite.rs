//! Normalized relational store for snapshots.
//!
//! Families, sample names, label keys, label values and label sets are
//! deduplicated into their own tables; each delivered sample adds one
//! `sample_value` row plus its quantile, rate and histogram detail rows.
//! A whole snapshot is written in one transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use hdrhistogram::serialization::{Serializer as _, V2DeflateSerializer};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, error, info};

use super::filter::InstanceFilter;
use crate::error::{ExportError, Result};
use crate::labels::LabelSet;
use crate::metrics::{
    MeterSample, MetricFamily, MetricType, MetricsSnapshot, RateStatistics, Sample, SummarySample,
};
use crate::scheduler::SnapshotConsumer;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metric_family (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL,
        help TEXT,
        unit TEXT,
        type TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sample_name (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        metric_family_id INTEGER NOT NULL,
        sample TEXT NOT NULL,
        UNIQUE(metric_family_id, sample),
        FOREIGN KEY(metric_family_id) REFERENCES metric_family(id)
    );
    CREATE TABLE IF NOT EXISTS label_key (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL
    );
    CREATE TABLE IF NOT EXISTS label_value (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        value TEXT UNIQUE
    );
    CREATE TABLE IF NOT EXISTS label_set (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hash TEXT UNIQUE NOT NULL
    );
    CREATE TABLE IF NOT EXISTS label_set_membership (
        label_set_id INTEGER NOT NULL,
        label_key_id INTEGER NOT NULL,
        label_value_id INTEGER NOT NULL,
        UNIQUE(label_set_id, label_key_id),
        FOREIGN KEY(label_set_id) REFERENCES label_set(id),
        FOREIGN KEY(label_key_id) REFERENCES label_key(id),
        FOREIGN KEY(label_value_id) REFERENCES label_value(id)
    );
    CREATE TABLE IF NOT EXISTS sample_value (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sample_name_id INTEGER NOT NULL,
        label_set_id INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        value REAL,
        count INTEGER,
        sum REAL,
        min REAL,
        max REAL,
        mean REAL,
        stddev REAL,
        FOREIGN KEY(sample_name_id) REFERENCES sample_name(id),
        FOREIGN KEY(label_set_id) REFERENCES label_set(id)
    );
    CREATE TABLE IF NOT EXISTS sample_quantile (
        sample_value_id INTEGER NOT NULL,
        quantile REAL NOT NULL,
        quantile_value REAL,
        PRIMARY KEY(sample_value_id, quantile),
        FOREIGN KEY(sample_value_id) REFERENCES sample_value(id)
    );
    CREATE TABLE IF NOT EXISTS sample_rate (
        sample_value_id INTEGER NOT NULL,
        rate_type TEXT NOT NULL,
        rate_value REAL,
        PRIMARY KEY(sample_value_id, rate_type),
        FOREIGN KEY(sample_value_id) REFERENCES sample_value(id)
    );
    CREATE TABLE IF NOT EXISTS sample_histogram (
        sample_value_id INTEGER PRIMARY KEY,
        start_seconds REAL NOT NULL,
        interval_seconds REAL NOT NULL,
        max_value REAL,
        histogram_blob_base64 TEXT NOT NULL,
        FOREIGN KEY(sample_value_id) REFERENCES sample_value(id)
    );
";

// ─── Id caches ───────────────────────────────────────────────────

/// Natural key → row id. Entries are never evicted.
#[derive(Debug, Default)]
struct IdCache {
    families: HashMap<String, i64>,
    sample_names: HashMap<(i64, String), i64>,
    label_keys: HashMap<String, i64>,
    label_values: HashMap<String, i64>,
    label_sets: HashMap<String, i64>,
}

impl IdCache {
    fn absorb(&mut self, other: IdCache) {
        self.families.extend(other.families);
        self.sample_names.extend(other.sample_names);
        self.label_keys.extend(other.label_keys);
        self.label_values.extend(other.label_values);
        self.label_sets.extend(other.label_sets);
    }
}

/// Committed ids plus the ids resolved inside the open transaction.
/// `fresh` is merged into the committed cache only after a commit.
struct TickIds<'a> {
    committed: &'a IdCache,
    fresh: IdCache,
}

macro_rules! cached {
    ($ids:expr, $table:ident, $key:expr) => {
        $ids.fresh
            .$table
            .get($key)
            .or_else(|| $ids.committed.$table.get($key))
            .copied()
    };
}

struct StoreState {
    conn: Connection,
    committed: IdCache,
}

// ─── Reporter ────────────────────────────────────────────────────

pub struct SqliteReporter {
    state: Mutex<Option<StoreState>>,
    include_histograms: bool,
    filter: InstanceFilter,
}

impl SqliteReporter {
    /// Opens (or creates) the database file and applies the schema.
    pub fn open(path: impl AsRef<Path>, filter: InstanceFilter) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        info!(db = %path.display(), "opened metrics store");
        Self::with_connection(conn, filter)
    }

    pub fn in_memory(filter: InstanceFilter) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, filter)
    }

    fn with_connection(conn: Connection, filter: InstanceFilter) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            state: Mutex::new(Some(StoreState {
                conn,
                committed: IdCache::default(),
            })),
            include_histograms: false,
            filter,
        })
    }

    /// Also store each summary's full distribution, HdrHistogram V2 + DEFLATE
    /// encoded, as base64 text.
    pub fn include_histograms(mut self, enabled: bool) -> Self {
        self.include_histograms = enabled;
        self
    }

    /// Writes every accepted sample of the snapshot in a single transaction.
    pub fn write_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<usize> {
        let rows = self.in_transaction(|tx, ids| self.write_rows(tx, ids, snapshot))?;
        debug!(rows, captured_at_ms = snapshot.captured_at_ms(), "stored snapshot");
        Ok(rows)
    }

    /// Id of the stored label set for `labels`, inserting it if needed.
    /// `name` and `unit` are not part of a stored label set.
    pub fn resolve_label_set_id(&self, labels: &LabelSet) -> Result<i64> {
        self.in_transaction(|tx, ids| resolve_label_set(tx, ids, labels))
    }

    /// Read access to the underlying connection.
    pub fn query<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or_else(closed)?;
        Ok(f(&state.conn)?)
    }

    fn in_transaction<T>(
        &self,
        work: impl FnOnce(&Transaction<'_>, &mut TickIds<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.state.lock();
        let StoreState { conn, committed } = guard.as_mut().ok_or_else(closed)?;

        let tx = conn.transaction()?;
        let mut ids = TickIds {
            committed: &*committed,
            fresh: IdCache::default(),
        };
        match work(&tx, &mut ids) {
            Ok(value) => {
                tx.commit()?;
                let fresh = ids.fresh;
                committed.absorb(fresh);
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    error!(error = %rollback, "metrics store rollback failed");
                }
                Err(e)
            }
        }
    }

    fn write_rows(
        &self,
        tx: &Transaction<'_>,
        ids: &mut TickIds<'_>,
        snapshot: &MetricsSnapshot,
    ) -> Result<usize> {
        let mut rows = 0;
        for family in snapshot.families() {
            for sample in family.samples() {
                if !self.filter.matches_sample(sample) {
                    continue;
                }
                let family_id = resolve_family(tx, ids, family)?;
                let sample_name_id = resolve_sample_name(tx, ids, family_id, sample.name())?;
                let label_set_id = resolve_label_set(tx, ids, sample.labels())?;
                let value_id = insert_sample_value(
                    tx,
                    sample_name_id,
                    label_set_id,
                    snapshot.captured_at_ms(),
                    sample,
                )?;
                match sample {
                    Sample::Point(_) => {}
                    Sample::Meter(meter) => insert_meter_rates(tx, value_id, meter)?,
                    Sample::Summary(summary) => {
                        insert_summary_details(tx, value_id, summary)?;
                        if self.include_histograms {
                            insert_histogram(tx, value_id, snapshot, summary)?;
                        }
                    }
                }
                rows += 1;
            }
        }
        Ok(rows)
    }
}

impl SnapshotConsumer for SqliteReporter {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        self.write_snapshot(snapshot).map(|_| ())
    }

    fn close(&self) -> Result<()> {
        if let Some(state) = self.state.lock().take() {
            state.conn.close().map_err(|(_, e)| ExportError::Sql(e))?;
            debug!("closed metrics store");
        }
        Ok(())
    }
}

fn closed() -> ExportError {
    ExportError::Runtime("metrics store is closed".to_owned())
}

// ── resolve-or-insert ──

fn resolve_family(tx: &Transaction<'_>, ids: &mut TickIds<'_>, family: &MetricFamily) -> Result<i64> {
    if let Some(id) = cached!(ids, families, family.family_name()) {
        return Ok(id);
    }
    tx.prepare_cached(
        "INSERT OR IGNORE INTO metric_family(name, help, unit, type) VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![
        family.family_name(),
        family.help(),
        family.unit(),
        type_name(family.metric_type()),
    ])?;
    let id = select_id(tx, "SELECT id FROM metric_family WHERE name = ?1", family.family_name())?;
    ids.fresh.families.insert(family.family_name().to_owned(), id);
    Ok(id)
}

fn resolve_sample_name(
    tx: &Transaction<'_>,
    ids: &mut TickIds<'_>,
    family_id: i64,
    sample_name: &str,
) -> Result<i64> {
    let key = (family_id, sample_name.to_owned());
    if let Some(id) = cached!(ids, sample_names, &key) {
        return Ok(id);
    }
    tx.prepare_cached("INSERT OR IGNORE INTO sample_name(metric_family_id, sample) VALUES (?1, ?2)")?
        .execute(params![family_id, sample_name])?;
    let id = tx
        .prepare_cached("SELECT id FROM sample_name WHERE metric_family_id = ?1 AND sample = ?2")?
        .query_row(params![family_id, sample_name], |row| row.get(0))?;
    ids.fresh.sample_names.insert(key, id);
    Ok(id)
}

fn resolve_label_set(tx: &Transaction<'_>, ids: &mut TickIds<'_>, labels: &LabelSet) -> Result<i64> {
    let dimensions = labels.dimensions();
    let hash = dimensions.canonical();
    if let Some(id) = cached!(ids, label_sets, &hash) {
        return Ok(id);
    }

    tx.prepare_cached("INSERT OR IGNORE INTO label_set(hash) VALUES (?1)")?
        .execute(params![hash])?;
    let set_id = select_id(tx, "SELECT id FROM label_set WHERE hash = ?1", &hash)?;

    for (key, value) in dimensions.iter() {
        let key_id = resolve_label_key(tx, ids, key)?;
        let value_id = resolve_label_value(tx, ids, value)?;
        tx.prepare_cached(
            "INSERT OR IGNORE INTO label_set_membership(label_set_id, label_key_id, label_value_id)
             VALUES (?1, ?2, ?3)",
        )?
        .execute(params![set_id, key_id, value_id])?;
    }

    ids.fresh.label_sets.insert(hash, set_id);
    Ok(set_id)
}

fn resolve_label_key(tx: &Transaction<'_>, ids: &mut TickIds<'_>, key: &str) -> Result<i64> {
    if let Some(id) = cached!(ids, label_keys, key) {
        return Ok(id);
    }
    tx.prepare_cached("INSERT OR IGNORE INTO label_key(name) VALUES (?1)")?
        .execute(params![key])?;
    let id = select_id(tx, "SELECT id FROM label_key WHERE name = ?1", key)?;
    ids.fresh.label_keys.insert(key.to_owned(), id);
    Ok(id)
}

fn resolve_label_value(tx: &Transaction<'_>, ids: &mut TickIds<'_>, value: &str) -> Result<i64> {
    if let Some(id) = cached!(ids, label_values, value) {
        return Ok(id);
    }
    tx.prepare_cached("INSERT OR IGNORE INTO label_value(value) VALUES (?1)")?
        .execute(params![value])?;
    let id = select_id(tx, "SELECT id FROM label_value WHERE value = ?1", value)?;
    ids.fresh.label_values.insert(value.to_owned(), id);
    Ok(id)
}

fn select_id(tx: &Transaction<'_>, sql: &str, key: &str) -> Result<i64> {
    tx.prepare_cached(sql)?
        .query_row(params![key], |row| row.get(0))
        .optional()?
        .ok_or_else(|| ExportError::Sql(rusqlite::Error::QueryReturnedNoRows))
}

// ── sample rows ──

fn insert_sample_value(
    tx: &Transaction<'_>,
    sample_name_id: i64,
    label_set_id: i64,
    timestamp_ms: i64,
    sample: &Sample,
) -> Result<i64> {
    let (value, summary) = match sample {
        Sample::Point(point) => (point.value, None),
        Sample::Meter(meter) => (meter.count as f64, None),
        Sample::Summary(summary) => (summary.statistics.count as f64, Some(summary)),
    };
    let stats = summary.map(|s| s.statistics);
    tx.prepare_cached(
        "INSERT INTO sample_value(sample_name_id, label_set_id, timestamp_ms, value, count, sum, min, max, mean, stddev)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?
    .execute(params![
        sample_name_id,
        label_set_id,
        timestamp_ms,
        value,
        stats.map(|s| i64::try_from(s.count).unwrap_or(i64::MAX)),
        summary.map(|s| s.sum),
        stats.map(|s| s.min),
        stats.map(|s| s.max),
        stats.map(|s| s.mean),
        stats.map(|s| s.stddev),
    ])?;
    Ok(tx.last_insert_rowid())
}

fn insert_summary_details(tx: &Transaction<'_>, value_id: i64, summary: &SummarySample) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO sample_quantile(sample_value_id, quantile, quantile_value) VALUES (?1, ?2, ?3)",
    )?;
    for q in summary.quantiles.iter() {
        stmt.execute(params![value_id, q.quantile, q.value])?;
    }
    if let Some(rates) = &summary.rates {
        insert_rates(tx, value_id, rates)?;
    }
    Ok(())
}

fn insert_meter_rates(tx: &Transaction<'_>, value_id: i64, meter: &MeterSample) -> Result<()> {
    insert_rates(tx, value_id, &meter.rates())
}

fn insert_rates(tx: &Transaction<'_>, value_id: i64, rates: &RateStatistics) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO sample_rate(sample_value_id, rate_type, rate_value) VALUES (?1, ?2, ?3)",
    )?;
    for (rate_type, value) in [
        ("mean", rates.mean),
        ("m1", rates.one_minute),
        ("m5", rates.five_minute),
        ("m15", rates.fifteen_minute),
    ] {
        stmt.execute(params![value_id, rate_type, value])?;
    }
    Ok(())
}

fn insert_histogram(
    tx: &Transaction<'_>,
    value_id: i64,
    snapshot: &MetricsSnapshot,
    summary: &SummarySample,
) -> Result<()> {
    let Some(histogram) = &summary.histogram else {
        return Ok(());
    };
    let encoded = encode_histogram(histogram)?;
    let start_seconds = snapshot.window_start_ms() as f64 / 1000.0;
    let interval_seconds = (snapshot.interval_ms() as f64 / 1000.0).max(0.0);
    tx.prepare_cached(
        "INSERT OR REPLACE INTO sample_histogram(sample_value_id, start_seconds, interval_seconds, max_value, histogram_blob_base64)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![
        value_id,
        start_seconds,
        interval_seconds,
        histogram.max() as f64,
        encoded,
    ])?;
    Ok(())
}

/// HdrHistogram V2 + DEFLATE, base64 encoded.
pub fn encode_histogram(histogram: &hdrhistogram::Histogram<u64>) -> Result<String> {
    let mut bytes = Vec::new();
    V2DeflateSerializer::new()
        .serialize(histogram, &mut bytes)
        .map_err(|e| ExportError::HistogramEncoding(format!("{e:?}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Upper-case type name as stored in `metric_family.type`.
fn type_name(metric_type: MetricType) -> &'static str {
    match metric_type {
        MetricType::Gauge => "GAUGE",
        MetricType::Counter => "COUNTER",
        MetricType::Summary => "SUMMARY",
        MetricType::Histogram => "HISTOGRAM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn count(reporter: &SqliteReporter, table: &str) -> i64 {
        reporter
            .query(|c| c.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0)))
            .unwrap()
    }

    #[test]
    fn label_set_ids_are_stable() {
        let reporter = SqliteReporter::in_memory(InstanceFilter::new()).unwrap();
        let a = LabelSet::from_pairs([("region", "us"), ("host", "h1"), ("name", "x")]);
        let same = LabelSet::from_pairs([("host", "h1"), ("region", "us"), ("name", "y")]);
        let other = LabelSet::from_pairs([("region", "eu")]);

        let first = reporter.resolve_label_set_id(&a).unwrap();
        assert_eq!(reporter.resolve_label_set_id(&a).unwrap(), first);
        assert_eq!(reporter.resolve_label_set_id(&same).unwrap(), first);
        assert_ne!(reporter.resolve_label_set_id(&other).unwrap(), first);

        assert_eq!(count(&reporter, "label_set"), 2);
        assert_eq!(count(&reporter, "label_key"), 2);
        assert_eq!(count(&reporter, "label_set_membership"), 3);
    }

    #[test]
    fn empty_label_set_hash() {
        let reporter = SqliteReporter::in_memory(InstanceFilter::new()).unwrap();
        let id = reporter
            .resolve_label_set_id(&LabelSet::from_pairs([("name", "only")]))
            .unwrap();
        let hash: String = reporter
            .query(|c| c.query_row("SELECT hash FROM label_set WHERE id = ?1", [id], |r| r.get(0)))
            .unwrap();
        assert_eq!(hash, "{}");
    }

    #[test]
    fn histogram_encoding_round_trips() {
        let mut hist = hdrhistogram::Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3).unwrap();
        hist.record(100).unwrap();
        hist.record(2_000).unwrap();
        let encoded = encode_histogram(&hist).unwrap();

        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        let decoded: hdrhistogram::Histogram<u64> = hdrhistogram::serialization::Deserializer::new()
            .deserialize(&mut bytes.as_slice())
            .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.max(), hist.max());
    }

    #[test]
    fn closed_store_rejects_writes() {
        let reporter = SqliteReporter::in_memory(InstanceFilter::new()).unwrap();
        reporter.close().unwrap();
        let err = reporter.write_snapshot(&MetricsSnapshot::new(0, 0, Vec::new())).unwrap_err();
        assert!(matches!(err, ExportError::Runtime(_)));
    }
}
