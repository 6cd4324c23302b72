//! Roundcache coalescing cache.
//!
//! Two mechanisms sit in front of an expensive read-only computation:
//!
//! - **Coalescing**: concurrent identical requests share one in-flight
//!   computation and all receive its outcome, success or failure.
//! - **Round-aligned storage**: successful outcomes are stored until the next
//!   round boundary reported by a [`RoundClock`], so every entry written in a
//!   round expires together.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_entries = 10000
//! max_body_bytes = 1048576
//! ```

mod clock;
mod coalesce;
mod config;
mod keys;
mod metrics;
mod middleware;
mod store;

pub use clock::{ClockError, FixedRoundClock, RoundClock};
pub use coalesce::CoalescingCache;
pub use config::CacheConfig;
pub use keys::{CacheKey, CacheKeyPolicy, ReadOnlyPolicy, RequestDescriptor};
pub use metrics::{
    METRIC_CACHED_HIT_TOTAL, METRIC_PENDING_HIT_TOTAL, METRIC_PENDING_REQUESTS, MetricsSink,
    NoopSink, RecorderSink,
};
pub use middleware::{
    CacheState, CachedResponse, ResponseCache, UncachedResponse, response_cache_layer,
};
pub use store::{CacheStore, MemoryStore, StoreError};
