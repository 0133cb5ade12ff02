//! # Response Cache
//!
//! Cache-or-compute over a [`CacheStore`], plus in-flight deduplication via
//! an [`InflightRegistry`]. Values are stored as JSON.
//!
//! Invalidation is explicit: whoever mutates an entity upstream deletes its
//! key (see [`ResponseCache::invalidate`]).

mod inflight;
mod store;

pub use inflight::{InflightRegistry, DEFAULT_SAFETY_TIMEOUT};
pub use store::{delete_prefix, CacheStore, MemoryStore};

use crate::error::{Aborted, CacheError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    inflight: InflightRegistry,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, inflight: InflightRegistry) -> Self {
        Self { store, inflight }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn inflight(&self) -> &InflightRegistry {
        &self.inflight
    }

    /// Return the value stored under `key`, or run `compute`, store its
    /// result for `ttl` and return it.
    ///
    /// A stored value that no longer deserializes is treated as a miss.
    /// Concurrent misses each compute; see [`deduplicated_cached`].
    ///
    /// [`deduplicated_cached`]: ResponseCache::deduplicated_cached
    pub async fn cached<T, E, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(raw) = self.store.get(key).await? {
            match serde_json::from_str(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => tracing::warn!(key, error = %e, "discarding undecodable cache entry"),
            }
        }
        let value = compute().await?;
        let raw = serde_json::to_string(&value).map_err(CacheError::from)?;
        self.store.set(key, raw, ttl).await?;
        Ok(value)
    }

    /// Coalesce concurrent calls for `key` into one `compute`.
    pub async fn deduplicated<T, E, F, Fut>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + From<Aborted> + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.inflight.run(key, compute).await
    }

    /// [`cached`](ResponseCache::cached) inside
    /// [`deduplicated`](ResponseCache::deduplicated): a miss under
    /// concurrent load computes once and every waiter shares the result.
    pub async fn deduplicated_cached<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: From<CacheError> + From<Aborted> + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let cache = self.clone();
        let owned_key = key.to_string();
        self.inflight
            .run(key, move || async move {
                cache.cached(&owned_key, ttl, compute).await
            })
            .await
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw, ttl).await
    }

    /// Decoded values for `keys`, in key order. Entries that fail to decode
    /// come back as `None`.
    pub async fn get_many<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<T>>, CacheError> {
        let raw = self.store.mget(keys).await?;
        Ok(raw
            .into_iter()
            .zip(keys)
            .map(|(slot, key)| {
                slot.and_then(|s| match serde_json::from_str(&s) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "discarding undecodable cache entry");
                        None
                    }
                })
            })
            .collect())
    }

    pub async fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        self.store.del(key).await
    }

    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        delete_prefix(self.store.as_ref(), prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectoryError;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        n: u32,
    }

    fn cache() -> (ResponseCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            ResponseCache::new(store.clone(), InflightRegistry::default()),
            store,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_hit_skips_compute_until_ttl() {
        let (cache, store) = cache();
        let calls = AtomicUsize::new(0);
        let ttl = Duration::from_secs(60);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DirectoryError>(Payload {
                name: "x".into(),
                n: 7,
            })
        };

        let first = cache.cached("p", ttl, compute).await.unwrap();
        let raw_first = store.get("p").await.unwrap();
        let second = cache.cached("p", ttl, compute).await.unwrap();
        let raw_second = store.get("p").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(raw_first, raw_second);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.cached("p", ttl, compute).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_compute_error_stores_nothing() {
        let (cache, store) = cache();
        let err = cache
            .cached("p", Duration::from_secs(60), || async {
                Err::<Payload, _>(DirectoryError::RateLimited)
            })
            .await
            .unwrap_err();
        assert_eq!(err, DirectoryError::RateLimited);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_recomputed() {
        let (cache, store) = cache();
        store
            .set("p", "{not json".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let value = cache
            .cached("p", Duration::from_secs(60), || async {
                Ok::<_, DirectoryError>(Payload {
                    name: "fresh".into(),
                    n: 1,
                })
            })
            .await
            .unwrap();
        assert_eq!(value.name, "fresh");
        assert!(store.get("p").await.unwrap().unwrap().contains("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deduplicated_cached_computes_once_under_load() {
        let (cache, _) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let run = || {
            let calls = calls.clone();
            cache.deduplicated_cached("p", Duration::from_secs(60), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, DirectoryError>(Payload {
                    name: "shared".into(),
                    n: 3,
                })
            })
        };

        let (a, b, c) = tokio::join!(run(), run(), run());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.clone().unwrap());
        assert_eq!(b.unwrap(), c.unwrap());

        run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_many_and_invalidate_prefix() {
        let (cache, _) = cache();
        let ttl = Duration::from_secs(60);
        cache.put("user:a", &1u32, ttl).await.unwrap();
        cache.put("user:c", &3u32, ttl).await.unwrap();

        let keys = vec!["user:a".to_string(), "user:b".into(), "user:c".into()];
        let got: Vec<Option<u32>> = cache.get_many(&keys).await.unwrap();
        assert_eq!(got, vec![Some(1), None, Some(3)]);

        assert_eq!(cache.invalidate_prefix("user:").await.unwrap(), 2);
        assert!(!cache.invalidate("user:a").await.unwrap());
    }
}
