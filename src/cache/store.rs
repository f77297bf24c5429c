//! Cache-aside operations, degraded mode and hit accounting.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::observability::metrics;
use crate::store::{StoreError, StoreHealth};

/// Result of [`CacheStore::get_or_set`].
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub degraded: bool,
}

/// Cache-aside store over a [`CacheBackend`].
///
/// No operation here returns an error. When the backend is unreachable the
/// store behaves as an empty cache until the backend recovers.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    enabled: bool,
    default_ttl: Duration,
    max_entry_bytes: usize,
    health: StoreHealth,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig, retry_after: Duration) -> Self {
        Self {
            backend,
            enabled: config.enabled,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            max_entry_bytes: config.max_entry_bytes,
            health: StoreHealth::new("cache", retry_after),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    async fn guarded<T, F, Fut>(&self, op: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if !self.enabled || !self.health.should_try() {
            return None;
        }
        match op().await {
            Ok(value) => {
                self.health.record_ok();
                Some(value)
            }
            Err(e) => {
                self.health.record_err(&e);
                None
            }
        }
    }

    fn count(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache("hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache("miss");
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let value = self.guarded(|| self.backend.get(key)).await.flatten();
        self.count(value.is_some());
        value
    }

    /// Returns false when nothing was stored (disabled, oversized or degraded).
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> bool {
        if value.len() > self.max_entry_bytes {
            tracing::debug!(key, size = value.len(), "Cache entry too large, not stored");
            return false;
        }
        self.guarded(|| self.backend.set(key, value, ttl, tags))
            .await
            .is_some()
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.guarded(|| self.backend.delete(key)).await.unwrap_or(false)
    }

    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        let removed = self
            .guarded(|| self.backend.invalidate_tag(tag))
            .await
            .unwrap_or(0);
        tracing::debug!(tag, removed, "Cache tag invalidated");
        removed
    }

    pub async fn tag_members(&self, tag: &str) -> Vec<String> {
        self.guarded(|| self.backend.tag_members(tag))
            .await
            .unwrap_or_default()
    }

    pub async fn flush(&self) -> usize {
        let removed = self.guarded(|| self.backend.flush()).await.unwrap_or(0);
        tracing::info!(removed, "Cache flushed");
        removed
    }

    /// Serve `key` from cache, or run `fetcher` once and store its value.
    ///
    /// Fetcher errors are returned as-is and nothing is cached. Concurrent
    /// misses on the same key each run their own fetcher.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tags: &[String],
        fetcher: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(bytes) = self.guarded(|| self.backend.get(key)).await.flatten() {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    self.count(true);
                    return Ok(Cached { value, hit: true });
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "Discarding undecodable cache entry");
                    self.delete(key).await;
                }
            }
        }
        self.count(false);

        let value = fetcher().await?;
        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                self.set(key, &bytes, ttl, tags).await;
            }
            Err(e) => tracing::warn!(key, error = %e, "Failed to encode cache entry"),
        }
        Ok(Cached { value, hit: false })
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            enabled: self.enabled,
            backend: self.backend.name(),
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            degraded: self.health.is_degraded(),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    fn store() -> CacheStore {
        CacheStore::new(
            Arc::new(MemoryBackend::new()),
            &CacheConfig::default(),
            Duration::from_secs(5),
        )
    }

    struct Unreachable;

    #[async_trait]
    impl CacheBackend for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn set(&self, _: &str, _: &[u8], _: Duration, _: &[String]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn invalidate_tag(&self, _: &str) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn tag_members(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn flush(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable)
        }
    }

    async fn fetch_counting(
        cache: &CacheStore,
        key: &str,
        ttl: Duration,
        calls: &AtomicUsize,
    ) -> Cached<String> {
        cache
            .get_or_set(key, ttl, &[], || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>("fresh".to_string())
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_set_fetches_once_until_expiry() {
        let cache = store();
        let calls = AtomicUsize::new(0);
        let ttl = Duration::from_secs(30);

        let first = fetch_counting(&cache, "k", ttl, &calls).await;
        let second = fetch_counting(&cache, "k", ttl, &calls).await;
        assert!(!first.hit);
        assert!(second.hit);
        assert_eq!(second.value, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(ttl).await;
        let third = fetch_counting(&cache, "k", ttl, &calls).await;
        assert!(!third.hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
        assert!((stats.hit_rate - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_fetcher_error_is_not_cached() {
        let cache = store();
        let result: Result<Cached<String>, &str> = cache
            .get_or_set("k", Duration::from_secs(30), &[], || async { Err("backend down") })
            .await;
        assert_eq!(result.unwrap_err(), "backend down");
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_tag_removes_all_members() {
        let cache = store();
        let tags = vec!["users".to_string()];
        let ttl = Duration::from_secs(60);
        assert!(cache.set("a", b"1", ttl, &tags).await);
        assert!(cache.set("b", b"2", ttl, &tags).await);

        assert_eq!(cache.invalidate_tag("users").await, 2);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_none());
        assert!(cache.tag_members("users").await.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_entry_not_stored() {
        let config = CacheConfig {
            max_entry_bytes: 4,
            ..CacheConfig::default()
        };
        let cache = CacheStore::new(Arc::new(MemoryBackend::new()), &config, Duration::from_secs(5));
        assert!(!cache.set("k", b"too large", Duration::from_secs(60), &[]).await);
        assert!(cache.set("k", b"ok", Duration::from_secs(60), &[]).await);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = CacheStore::new(Arc::new(MemoryBackend::new()), &config, Duration::from_secs(5));
        let calls = AtomicUsize::new(0);
        fetch_counting(&cache, "k", Duration::from_secs(60), &calls).await;
        fetch_counting(&cache, "k", Duration::from_secs(60), &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_to_misses() {
        let cache = CacheStore::new(Arc::new(Unreachable), &CacheConfig::default(), Duration::from_secs(5));
        let calls = AtomicUsize::new(0);

        let result = fetch_counting(&cache, "k", Duration::from_secs(60), &calls).await;
        assert_eq!(result.value, "fresh");
        assert!(!result.hit);
        assert!(cache.is_degraded());

        assert!(cache.get("k").await.is_none());
        assert!(!cache.set("k", b"v", Duration::from_secs(60), &[]).await);
        assert!(!cache.delete("k").await);
        assert_eq!(cache.invalidate_tag("t").await, 0);
        assert_eq!(cache.flush().await, 0);
        assert!(cache.stats().degraded);
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let cache = store();
        cache.get("missing").await;
        assert_eq!(cache.stats().misses, 1);
        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.backend, "memory");
    }
}
