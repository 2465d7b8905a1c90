use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [Engine](super::Engine)
#[derive(Default)]
pub struct Metrics {
    /// Number of requests received
    pub requests: Counter,
    /// Number of range reads issued
    pub batches: Counter,
    /// Number of bytes read from the store
    pub fetched_bytes: Counter,
    /// Number of requests resolved with a block
    pub hits: Counter,
    /// Number of requests resolved as not found
    pub misses: Counter,
    /// Number of requests resolved with an error
    pub failures: Counter,
    /// Number of blocks awaiting a range read
    pub waiters: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "requests",
            "Number of requests received",
            metrics.requests.clone(),
        );
        context.register(
            "batches",
            "Number of range reads issued",
            metrics.batches.clone(),
        );
        context.register(
            "fetched_bytes",
            "Number of bytes read from the store",
            metrics.fetched_bytes.clone(),
        );
        context.register(
            "hits",
            "Number of requests resolved with a block",
            metrics.hits.clone(),
        );
        context.register(
            "misses",
            "Number of requests resolved as not found",
            metrics.misses.clone(),
        );
        context.register(
            "failures",
            "Number of requests resolved with an error",
            metrics.failures.clone(),
        );
        context.register(
            "waiters",
            "Number of blocks awaiting a range read",
            metrics.waiters.clone(),
        );
        metrics
    }
}
