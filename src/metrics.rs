use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing enrichment activity.
#[derive(Default)]
pub struct PipelineMetrics {
    batches: AtomicU64,
    documents_found: AtomicU64,
    documents_downloaded: AtomicU64,
    cache_hits: AtomicU64,
    summaries_emitted: AtomicU64,
    documents_failed: AtomicU64,
    documents_abandoned: AtomicU64,
    cache_write_failures: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch and the number of documents its search returned.
    pub fn record_batch(&self, found: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.documents_found.fetch_add(found, Ordering::Relaxed);
    }

    /// Record a document made available on disk.
    pub fn record_download(&self) {
        self.documents_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a summary served from the cache.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a result delivered to the caller.
    pub fn record_emitted(&self) {
        self.summaries_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a document skipped because of an error.
    pub fn record_failure(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a document abandoned because the batch was cancelled.
    pub fn record_abandoned(&self) {
        self.documents_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a result that could not be persisted to the cache.
    pub fn record_cache_write_failure(&self) {
        self.cache_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    ///
    /// `circuit_openings` is owned by the circuit breaker and left at zero here.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            documents_found: self.documents_found.load(Ordering::Relaxed),
            documents_downloaded: self.documents_downloaded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            summaries_emitted: self.summaries_emitted.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            documents_abandoned: self.documents_abandoned.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
            circuit_openings: 0,
        }
    }
}

/// Immutable view of enrichment counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Batches processed since startup.
    pub batches: u64,
    /// Documents returned by archive searches.
    pub documents_found: u64,
    /// Documents available on disk after the export step.
    pub documents_downloaded: u64,
    /// Summaries served from the cache.
    pub cache_hits: u64,
    /// Results delivered to callers.
    pub summaries_emitted: u64,
    /// Documents skipped because of an error.
    pub documents_failed: u64,
    /// Documents abandoned on cancellation.
    pub documents_abandoned: u64,
    /// Results that could not be persisted to the cache.
    pub cache_write_failures: u64,
    /// Times the recognition circuit opened.
    pub circuit_openings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_batches_and_outcomes() {
        let metrics = PipelineMetrics::new();
        metrics.record_batch(3);
        metrics.record_batch(2);
        metrics.record_emitted();
        metrics.record_failure();
        metrics.record_abandoned();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches, 2);
        assert_eq!(snapshot.documents_found, 5);
        assert_eq!(snapshot.summaries_emitted, 1);
        assert_eq!(snapshot.documents_failed, 1);
        assert_eq!(snapshot.documents_abandoned, 1);
    }

    #[test]
    fn snapshot_is_consistent() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
