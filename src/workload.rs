use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tracing::info;
use uuid::Uuid;

use crate::labels::LabelSet;
use crate::registry::{Counter, Gauge, Histogram, Meter, Registry, RegistryError, Timer};

// ─── Constants ───────────────────────────────────────────────────

/// Keys present right after seeding.
pub const NUM_KEYS: u32 = 10_000;
/// Value sizes in bytes, inclusive.
pub const MIN_VALUE_SIZE: usize = 64;
pub const MAX_VALUE_SIZE: usize = 4096;

/// Labels that tag every instrument of one run.
pub fn session_labels() -> LabelSet {
    LabelSet::from_pairs([("session", Uuid::new_v4().to_string())])
}

// ─── Demo instruments ────────────────────────────────────────────

/// Everything the load generator records into.
pub struct WorkloadInstruments {
    pub read_latency: Arc<Timer>,
    pub write_latency: Arc<Timer>,
    pub requests: Arc<Counter>,
    pub misses: Arc<Counter>,
    pub throughput: Arc<Meter>,
    pub value_size: Arc<Histogram>,
    pub keyspace: Arc<Gauge>,
    pub active_workers: Arc<Gauge>,
}

impl WorkloadInstruments {
    pub fn register(registry: &Registry, activity: &str) -> Result<Self, RegistryError> {
        let base = LabelSet::from_pairs([("activity", activity)]);
        let reads = base.and("op", "read");
        let writes = base.and("op", "write");

        let instruments = Self {
            read_latency: registry.timer("op.latency", &reads, "operation latency")?,
            write_latency: registry.timer("op.latency", &writes, "operation latency")?,
            requests: registry.counter("requests", &base, "operations attempted"),
            misses: registry.counter("misses", &base, "reads that found no key"),
            throughput: registry.meter("ops", &base, "operations completed"),
            value_size: registry.histogram(
                "value.size",
                &base.and("unit", "bytes"),
                "size of written values",
            )?,
            keyspace: registry.gauge("keyspace.size", &base, "keys currently stored"),
            active_workers: registry.gauge("workers.active", &base, "running load workers"),
        };

        for id in [
            instruments.read_latency.id(),
            instruments.write_latency.id(),
            instruments.requests.id(),
            instruments.throughput.id(),
        ] {
            registry.categorize(id, ["core"]);
        }
        registry.categorize(instruments.misses.id(), ["core", "errors"]);
        registry.categorize(instruments.value_size.id(), ["payload"]);
        registry.categorize(instruments.keyspace.id(), ["payload"]);
        registry.categorize(instruments.active_workers.id(), ["internals"]);
        Ok(instruments)
    }
}

/// Value of `size` filler bytes.
pub fn value_of_size(size: usize) -> String {
    "x".repeat(size)
}

// ─── In-memory store ─────────────────────────────────────────────

/// Key/value map the workload reads from and writes to.
#[derive(Default)]
pub struct Store {
    entries: RwLock<HashMap<String, String>>,
}

impl Store {
    /// Fills `NUM_KEYS` keys with values of seeded random sizes.
    pub fn seeded(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let entries: HashMap<String, String> = (1..=NUM_KEYS)
            .map(|i| {
                let size = rng.gen_range(MIN_VALUE_SIZE..=MAX_VALUE_SIZE);
                (key_name(i), value_of_size(size))
            })
            .collect();

        info!(keys = entries.len(), "seeded workload store");
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn put(&self, key: String, value: String) {
        self.entries.write().insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub fn key_name(id: u32) -> String {
    format!("key:{id:08}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InstrumentRegistry, Scope};

    #[test]
    fn seeded_store_is_deterministic() {
        let a = Store::seeded(7);
        let b = Store::seeded(7);
        assert_eq!(a.len(), NUM_KEYS as usize);
        assert_eq!(a.get(&key_name(42)), b.get(&key_name(42)));
        assert!(a.get(&key_name(NUM_KEYS + 1)).is_none());

        let size = a.get(&key_name(1)).unwrap().len();
        assert!((MIN_VALUE_SIZE..=MAX_VALUE_SIZE).contains(&size));
    }

    #[test]
    fn instruments_share_the_session_label() {
        let registry = Registry::with_labels(session_labels());
        WorkloadInstruments::register(&registry, "demo").unwrap();
        let all = registry.find_instruments(&Scope::root()).unwrap();
        assert_eq!(all.len(), 8);
        let session = all[0].labels().get("session").unwrap().to_owned();
        assert!(all.iter().all(|i| i.labels().get("session") == Some(session.as_str())));
        assert!(all.iter().any(|i| i.unit() == Some("bytes")));
        assert!(all.iter().all(|i| !i.categories().is_empty()));
        assert!(all
            .iter()
            .any(|i| i.name() == "misses" && i.categories().iter().any(|c| c == "errors")));
    }
}
