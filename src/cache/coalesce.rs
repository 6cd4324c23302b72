//! Request coalescing in front of the cache store.
//!
//! Identical cacheable requests that arrive while a computation is running
//! share that computation's outcome instead of starting their own. Successful
//! outcomes are written to the store until the next round boundary; failures
//! are handed to every waiter and never stored.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::clock::RoundClock;
use super::keys::{CacheKey, CacheKeyPolicy, ReadOnlyPolicy, RequestDescriptor};
use super::metrics::{MetricsSink, RecorderSink};
use super::store::CacheStore;

/// `None` until the leader publishes; written exactly once.
type Resolution<V, E> = Option<Result<V, E>>;

/// Coalescing, round-aligned cache around an arbitrary async computation.
///
/// `V` is the success value and `E` the failure value. Both are cloned once
/// per waiter, so they should be cheap to clone.
pub struct CoalescingCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    policy: Arc<dyn CacheKeyPolicy>,
    store: Arc<dyn CacheStore<V>>,
    clock: Arc<dyn RoundClock>,
    metrics: Arc<dyn MetricsSink>,
    // At most one entry per key; presence means a computation is running.
    pending: DashMap<CacheKey, watch::Receiver<Resolution<V, E>>>,
}

enum Claim<'a, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    Cached(V),
    Pending(watch::Receiver<Resolution<V, E>>),
    Leader(PendingSlot<'a, V, E>),
}

impl<V, E> CoalescingCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a cache that keys `GET` requests by URL and reports through the
    /// global `metrics` recorder.
    pub fn new(store: Arc<dyn CacheStore<V>>, clock: Arc<dyn RoundClock>) -> Self {
        Self {
            policy: Arc::new(ReadOnlyPolicy::default()),
            store,
            clock,
            metrics: Arc::new(RecorderSink),
            pending: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn CacheKeyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Number of computations currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_cacheable(&self, request: &RequestDescriptor) -> bool {
        self.policy.derive_key(request).is_some()
    }

    /// Answer `request`, running `invoke_handler` only when neither an
    /// in-flight computation nor a stored value can answer it.
    ///
    /// The outcome is always exactly what some invocation of a handler
    /// produced for this key; store and clock failures never surface here.
    pub async fn handle<F, Fut>(
        &self,
        request: &RequestDescriptor,
        invoke_handler: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.metrics.observe_pending_count(self.pending.len());

        let Some(key) = self.policy.derive_key(request) else {
            debug!(
                cache = "coalesce",
                outcome = "bypass",
                "request is not cacheable"
            );
            return invoke_handler().await;
        };
        let operation = request.operation();

        let slot = loop {
            match self.claim(&key).await {
                Claim::Cached(value) => {
                    debug!(
                        cache = "coalesce",
                        outcome = "hit",
                        key = %key,
                        "serving stored value"
                    );
                    self.metrics.increment_cache_hit(operation);
                    return Ok(value);
                }
                Claim::Pending(receiver) => match wait_for_resolution(receiver).await {
                    Some(outcome) => {
                        debug!(
                            cache = "coalesce",
                            outcome = "pending",
                            key = %key,
                            failed = outcome.is_err(),
                            "joined in-flight computation"
                        );
                        self.metrics.increment_pending_hit(operation);
                        return outcome;
                    }
                    None => {
                        debug!(
                            cache = "coalesce",
                            key = %key,
                            "in-flight computation abandoned, retrying lookup"
                        );
                    }
                },
                Claim::Leader(slot) => break slot,
            }
        };

        debug!(cache = "coalesce", outcome = "miss", key = %key, "computing value");
        let outcome = invoke_handler().await;
        slot.resolve(&outcome);

        if let Ok(value) = &outcome {
            self.persist(&key, value.clone()).await;
        }

        outcome
    }

    /// Join a running computation, serve a stored value, or become the leader.
    ///
    /// Registration goes through the map entry, so a computation registered
    /// while the store lookup was suspended is joined rather than duplicated.
    async fn claim(&self, key: &CacheKey) -> Claim<'_, V, E> {
        if let Some(receiver) = self.pending_receiver(key) {
            return Claim::Pending(receiver);
        }

        if let Some(value) = self.lookup(key).await {
            return Claim::Cached(value);
        }

        match self.pending.entry(key.clone()) {
            Entry::Occupied(occupied) => Claim::Pending(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = watch::channel(None);
                vacant.insert(receiver.clone());
                Claim::Leader(PendingSlot {
                    key: key.clone(),
                    sender,
                    receiver,
                    pending: &self.pending,
                    metrics: self.metrics.as_ref(),
                })
            }
        }
    }

    fn pending_receiver(&self, key: &CacheKey) -> Option<watch::Receiver<Resolution<V, E>>> {
        self.pending.get(key).map(|slot| slot.value().clone())
    }

    async fn lookup(&self, key: &CacheKey) -> Option<V> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    cache = "coalesce",
                    key = %key,
                    error = %error,
                    "store read failed, treating as miss"
                );
                None
            }
        }
    }

    async fn persist(&self, key: &CacheKey, value: V) {
        let ttl_seconds = match self.clock.seconds_until_next_round().await {
            Ok(ttl_seconds) => ttl_seconds,
            Err(error) => {
                warn!(
                    cache = "coalesce",
                    key = %key,
                    error = %error,
                    "round clock failed, value not stored"
                );
                return;
            }
        };

        if ttl_seconds == 0 {
            debug!(
                cache = "coalesce",
                key = %key,
                "round boundary reached, value not stored"
            );
            return;
        }

        if let Err(error) = self.store.set(key, value, ttl_seconds).await {
            warn!(
                cache = "coalesce",
                key = %key,
                error = %error,
                "store write failed"
            );
        }
    }
}

/// The leader's registration in the in-flight table.
///
/// Dropping the slot removes it from the table whether or not it was
/// resolved. Waiters of an unresolved slot observe a closed channel.
struct PendingSlot<'a, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    key: CacheKey,
    sender: watch::Sender<Resolution<V, E>>,
    receiver: watch::Receiver<Resolution<V, E>>,
    pending: &'a DashMap<CacheKey, watch::Receiver<Resolution<V, E>>>,
    metrics: &'a dyn MetricsSink,
}

impl<V, E> PendingSlot<'_, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn resolve(self, outcome: &Result<V, E>) {
        self.sender.send_replace(Some(outcome.clone()));
    }
}

impl<V, E> Drop for PendingSlot<'_, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.pending.remove_if(&self.key, |_, registered| {
            registered.same_channel(&self.receiver)
        });
        self.metrics.observe_pending_count(self.pending.len());
    }
}

/// Wait for the leader to publish. `None` means the leader went away first.
async fn wait_for_resolution<V, E>(
    mut receiver: watch::Receiver<Resolution<V, E>>,
) -> Resolution<V, E>
where
    V: Clone,
    E: Clone,
{
    loop {
        let current = receiver.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if receiver.changed().await.is_err() {
            return receiver.borrow().clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::Method;

    use super::*;
    use crate::cache::clock::ClockError;
    use crate::cache::metrics::NoopSink;
    use crate::cache::store::MemoryStore;

    struct SixSeconds;

    #[async_trait]
    impl RoundClock for SixSeconds {
        async fn seconds_until_next_round(&self) -> Result<u64, ClockError> {
            Ok(6)
        }
    }

    fn cache() -> Arc<CoalescingCache<u32, String>> {
        let store = Arc::new(MemoryStore::<u32>::new(
            std::num::NonZeroUsize::new(8).unwrap(),
        ));
        Arc::new(
            CoalescingCache::new(store, Arc::new(SixSeconds)).with_metrics(Arc::new(NoopSink)),
        )
    }

    fn get(url: &str) -> RequestDescriptor {
        RequestDescriptor::new(Method::GET, Some(url.to_string()))
    }

    #[tokio::test]
    async fn slot_is_removed_after_success_and_failure() {
        let cache = cache();

        let ok = cache.handle(&get("/ok"), || async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));
        assert_eq!(cache.pending_count(), 0);

        let failed = cache
            .handle(&get("/fail"), || async { Err("boom".to_string()) })
            .await;
        assert_eq!(failed, Err("boom".to_string()));
        assert_eq!(cache.pending_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_leader_hands_over_to_a_waiter() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .handle(&get("/slow"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = started_tx.send(());
                        std::future::pending::<Result<u32, String>>().await
                    })
                    .await
            })
        };

        started_rx.await.expect("leader should start computing");
        assert_eq!(cache.pending_count(), 1);

        let waiter = {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .handle(&get("/slow"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();
        let _ = leader.await;

        let outcome = waiter.await.expect("waiter task should finish");
        assert_eq!(outcome, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.pending_count(), 0);
    }
}
