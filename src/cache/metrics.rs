//! Observability hooks for the coalescing cache.

use metrics::{counter, gauge};

pub const METRIC_PENDING_REQUESTS: &str = "roundcache_pending_requests";
pub const METRIC_PENDING_HIT_TOTAL: &str = "roundcache_pending_hit_total";
pub const METRIC_CACHED_HIT_TOTAL: &str = "roundcache_cached_hit_total";

/// Fire-and-forget sink for cache signals.
///
/// Implementations must not block and must not panic into the request path.
pub trait MetricsSink: Send + Sync {
    /// Current size of the in-flight table.
    fn observe_pending_count(&self, count: usize);

    /// A request was answered by joining an in-flight computation.
    fn increment_pending_hit(&self, operation: &str);

    /// A request was answered from the cache store.
    fn increment_cache_hit(&self, operation: &str);
}

/// Emits through the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn observe_pending_count(&self, count: usize) {
        gauge!(METRIC_PENDING_REQUESTS).set(count as f64);
    }

    fn increment_pending_hit(&self, operation: &str) {
        counter!(METRIC_PENDING_HIT_TOTAL, "operation" => operation.to_owned()).increment(1);
    }

    fn increment_cache_hit(&self, operation: &str) {
        counter!(METRIC_CACHED_HIT_TOTAL, "operation" => operation.to_owned()).increment(1);
    }
}

/// Discards every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn observe_pending_count(&self, _count: usize) {}

    fn increment_pending_hit(&self, _operation: &str) {}

    fn increment_cache_hit(&self, _operation: &str) {}
}
