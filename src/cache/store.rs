//! Cache storage.
//!
//! `CacheStore` is the contract the coalescing cache writes computed values
//! through; `MemoryStore` is the bundled in-process backend.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use super::keys::CacheKey;

const SOURCE: &str = "cache::store";
// Longer TTLs are clamped so the expiry instant cannot overflow.
const MAX_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("cache backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("cache backend rejected `{key}`: {message}")]
    Rejected { key: String, message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn rejected(key: &CacheKey, message: impl Into<String>) -> Self {
        Self::Rejected {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Key-value store with per-entry expiry.
///
/// Eviction and durability are the backend's business. The coalescing cache
/// treats a failed `get` as a miss and ignores a failed `set`.
#[async_trait]
pub trait CacheStore<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> Result<Option<V>, StoreError>;

    async fn set(&self, key: &CacheKey, value: V, ttl_seconds: u64) -> Result<(), StoreError>;
}

struct StoredEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Bounded in-memory store with LRU eviction and lazy expiry.
pub struct MemoryStore<V> {
    entries: Mutex<LruCache<CacheKey, StoredEntry<V>>>,
}

impl<V> MemoryStore<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of stored entries, including ones that expired but were not read since.
    pub fn len(&self) -> usize {
        self.lock("len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock("clear").clear();
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, LruCache<CacheKey, StoredEntry<V>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op,
                    target_module = SOURCE,
                    lock_kind = "mutex.lock",
                    result = "poisoned_recovered",
                    "Recovered from poisoned cache lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[async_trait]
impl<V> CacheStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> Result<Option<V>, StoreError> {
        let mut entries = self.lock("get");
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, value: V, ttl_seconds: u64) -> Result<(), StoreError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds.min(MAX_TTL_SECONDS));
        self.lock("set")
            .put(key.clone(), StoredEntry { value, expires_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn store(capacity: usize) -> MemoryStore<String> {
        MemoryStore::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[tokio::test]
    async fn set_then_get() {
        let store = store(4);
        let key = CacheKey::new("/users/1");

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.set(&key, "{\"id\":1}".to_string(), 6).await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap().as_deref(),
            Some("{\"id\":1}")
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = store(4);
        let key = CacheKey::new("/stats");
        store.set(&key, "round-1".to_string(), 3).await.unwrap();

        tokio::time::advance(Duration::from_millis(2_900)).await;
        assert!(store.get(&key).await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_refreshes_expiry() {
        let store = store(4);
        let key = CacheKey::new("/economics");
        store.set(&key, "old".to_string(), 1).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        store.set(&key, "new".to_string(), 5).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let store = store(2);
        let first = CacheKey::new("/a");
        let second = CacheKey::new("/b");
        let third = CacheKey::new("/c");

        store.set(&first, "a".to_string(), 60).await.unwrap();
        store.set(&second, "b".to_string(), 60).await.unwrap();
        // Touch the first entry so the second becomes least recently used.
        assert!(store.get(&first).await.unwrap().is_some());
        store.set(&third, "c".to_string(), 60).await.unwrap();

        assert!(store.get(&first).await.unwrap().is_some());
        assert!(store.get(&second).await.unwrap().is_none());
        assert!(store.get(&third).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let store = store(4);
        store.set(&CacheKey::new("/a"), "a".to_string(), 60).await.unwrap();
        store.set(&CacheKey::new("/b"), "b".to_string(), 60).await.unwrap();
        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn store_recovers_from_poisoned_lock() {
        let store = store(4);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.entries.lock().expect("lock should be acquired");
            panic!("poison store lock");
        }));

        let key = CacheKey::new("/after-panic");
        store.set(&key, "ok".to_string(), 60).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
    }
}
