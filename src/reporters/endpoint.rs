use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use crate::scheduler::SnapshotConsumer;

/// Holds the most recent snapshot for the HTTP handlers to serve.
#[derive(Default)]
pub struct ScrapeEndpoint {
    latest: RwLock<Option<Arc<MetricsSnapshot>>>,
}

impl ScrapeEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the first tick has been delivered.
    pub fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
        self.latest.read().clone()
    }
}

impl SnapshotConsumer for ScrapeEndpoint {
    fn name(&self) -> &str {
        "scrape-endpoint"
    }

    fn on_snapshot(&self, snapshot: &Arc<MetricsSnapshot>) -> Result<()> {
        *self.latest.write() = Some(Arc::clone(snapshot));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.latest.write().take();
        Ok(())
    }
}
