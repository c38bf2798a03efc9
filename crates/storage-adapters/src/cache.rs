//! # Loading cache
//!
//! Size-bounded LRU of rendered responses keyed by [`CacheKey`]. Concurrent misses for
//! the same key share one load; failed loads are not stored. Entries are dropped in bulk
//! by scope through [`CacheFlusher`]. A load that was running when a flush happened
//! still answers its callers but is not stored.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use domains::{AppError, CacheFlusher, CacheKey, FlushRequest};
use lru::LruCache;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type LoadResult = Result<Bytes, Arc<AppError>>;
type FlushCallback = Arc<dyn Fn(FlushRequest) + Send + Sync>;

/// Zero disables the corresponding cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_keys: usize,
    pub max_value_size: usize,
    pub max_size: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self { max_keys: 1000, max_value_size: 64 * 1024, max_size: 50 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub keys: usize,
    pub size: usize,
}

struct Entry {
    key: CacheKey,
    data: Bytes,
}

struct Store {
    lru: LruCache<String, Entry>,
    size: usize,
    /// Bumped by every flush.
    generation: u64,
}

struct Inflight {
    key: CacheKey,
    cell: OnceCell<LoadResult>,
}

pub struct LoadingCache {
    limits: CacheLimits,
    store: Mutex<Store>,
    inflight: DashMap<String, Arc<Inflight>>,
    hits: AtomicU64,
    misses: AtomicU64,
    on_flush: Option<FlushCallback>,
}

impl LoadingCache {
    pub fn new(limits: CacheLimits) -> Self {
        let lru = match NonZeroUsize::new(limits.max_keys) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            limits,
            store: Mutex::new(Store { lru, size: 0, generation: 0 }),
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            on_flush: None,
        }
    }

    /// Called asynchronously once after every flush.
    pub fn with_flush_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(FlushRequest) + Send + Sync + 'static,
    {
        self.on_flush = Some(Arc::new(callback));
        self
    }

    /// Cached bytes for `key`, or the result of `load` shared with every concurrent caller.
    pub async fn get<F, Fut>(&self, key: &CacheKey, load: F) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, AppError>>,
    {
        let merged = key.merge();
        if let Some(data) = self.lookup(&merged) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data);
        }

        let flight = self
            .inflight
            .entry(merged.clone())
            .or_insert_with(|| Arc::new(Inflight { key: key.clone(), cell: OnceCell::new() }))
            .clone();
        let mut loaded = false;
        let result = flight
            .cell
            .get_or_init(|| async {
                loaded = true;
                self.misses.fetch_add(1, Ordering::Relaxed);
                let generation = self.generation();
                let result = load().await.map_err(Arc::new);
                if let Ok(data) = &result {
                    self.insert(&merged, key.clone(), data.clone(), generation);
                }
                result
            })
            .await
            .clone();
        if loaded {
            self.inflight.remove_if(&merged, |_, f| Arc::ptr_eq(f, &flight));
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn stats(&self) -> CacheStats {
        let (keys, size) = match self.store.lock() {
            Ok(store) => (store.lru.len(), store.size),
            Err(_) => (0, 0),
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            keys,
            size,
        }
    }

    fn generation(&self) -> u64 {
        self.store.lock().map(|s| s.generation).unwrap_or_default()
    }

    fn lookup(&self, merged: &str) -> Option<Bytes> {
        let mut store = self.store.lock().ok()?;
        store.lru.get(merged).map(|e| e.data.clone())
    }

    /// Stores `data` unless a flush happened since `generation` was read.
    fn insert(&self, merged: &str, key: CacheKey, data: Bytes, generation: u64) {
        if self.limits.max_value_size > 0 && data.len() > self.limits.max_value_size {
            debug!(key = merged, size = data.len(), "value too large for cache");
            return;
        }
        let Ok(mut store) = self.store.lock() else {
            warn!("cache store lock poisoned");
            return;
        };
        if store.generation != generation {
            debug!(key = merged, "cache flushed during load, value not stored");
            return;
        }
        let size = data.len();
        if let Some(prev) = store.lru.peek(merged) {
            let prev_size = prev.data.len();
            store.size -= prev_size;
        }
        if let Some((evicted_key, evicted)) = store.lru.push(merged.to_string(), Entry { key, data }) {
            if evicted_key != merged {
                store.size -= evicted.data.len();
            }
        }
        store.size += size;
        while self.limits.max_size > 0 && store.size > self.limits.max_size {
            match store.lru.pop_lru() {
                Some((_, e)) => store.size -= e.data.len(),
                None => break,
            }
        }
    }
}

impl CacheFlusher for LoadingCache {
    fn flush(&self, request: FlushRequest) {
        let removed = match self.store.lock() {
            Ok(mut store) => {
                store.generation += 1;
                let keys: Vec<String> = store
                    .lru
                    .iter()
                    .filter(|(_, e)| request.scopes.is_empty() || e.key.has_any_scope(&request.scopes))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in &keys {
                    if let Some(e) = store.lru.pop(k) {
                        store.size -= e.data.len();
                    }
                }
                keys.len()
            }
            Err(_) => {
                warn!("cache store lock poisoned");
                0
            }
        };
        // later callers must not join a load that started before the flush
        self.inflight
            .retain(|_, f| !(request.scopes.is_empty() || f.key.has_any_scope(&request.scopes)));
        debug!(site = %request.site_id, scopes = ?request.scopes, removed, "cache flushed");

        if let Some(callback) = self.on_flush.clone() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { callback(request) });
                }
                Err(_) => callback(request),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn key(id: &str, scopes: &[&str]) -> CacheKey {
        CacheKey::new("site").id(id).scopes(scopes.iter().copied())
    }

    #[tokio::test]
    async fn concurrent_misses_load_once() {
        let cache = Arc::new(LoadingCache::new(CacheLimits::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let k = key("k1", &["s1"]);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let k = k.clone();
                tokio::spawn(async move {
                    cache
                        .get(&k, || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Bytes::from_static(b"value"))
                        })
                        .await
                })
            })
            .collect();
        for t in futures::future::join_all(tasks).await {
            assert_eq!(t.unwrap().unwrap(), Bytes::from_static(b"value"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = LoadingCache::new(CacheLimits::default());
        let k = key("k1", &[]);
        let err = cache
            .get(&k, || async { Err(AppError::PostNotFound("u".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::PostNotFound);

        let ok = cache.get(&k, || async { Ok(Bytes::from_static(b"v")) }).await.unwrap();
        assert_eq!(ok, Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn scope_flush_only_touches_matching_keys() {
        let cache = LoadingCache::new(CacheLimits::default());
        let k1 = key("k1", &["s1", "s2"]);
        let k2 = key("k2", &["s3"]);
        cache.get(&k1, || async { Ok(Bytes::from_static(b"1")) }).await.unwrap();
        cache.get(&k2, || async { Ok(Bytes::from_static(b"2")) }).await.unwrap();

        cache.flush(FlushRequest::new("site", ["s1"]));

        let reloaded = cache.get(&k1, || async { Ok(Bytes::from_static(b"1b")) }).await.unwrap();
        assert_eq!(reloaded, Bytes::from_static(b"1b"));
        let kept = cache.get(&k2, || async { Ok(Bytes::from_static(b"2b")) }).await.unwrap();
        assert_eq!(kept, Bytes::from_static(b"2"));

        cache.flush(FlushRequest::new("site", Vec::<String>::new()));
        assert_eq!(cache.stats().keys, 0);
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn flush_during_load_is_not_lost() {
        let cache = Arc::new(LoadingCache::new(CacheLimits::default()));
        let k = key("k1", &["post"]);
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let (cache, k) = (cache.clone(), k.clone());
            tokio::spawn(async move {
                cache
                    .get(&k, || async move {
                        let _ = wait.await;
                        Ok(Bytes::from_static(b"stale"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.flush(FlushRequest::new("site", ["post"]));

        // a caller after the flush starts its own load
        let fresh = cache.get(&k, || async { Ok(Bytes::from_static(b"fresh")) }).await.unwrap();
        assert_eq!(fresh, Bytes::from_static(b"fresh"));

        release.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), Bytes::from_static(b"stale"));
        let cached = cache.get(&k, || async { Ok(Bytes::from_static(b"other")) }).await.unwrap();
        assert_eq!(cached, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn limits_are_enforced() {
        let cache = LoadingCache::new(CacheLimits { max_keys: 2, max_value_size: 4, max_size: 6 });
        cache.get(&key("big", &[]), || async { Ok(Bytes::from_static(b"12345")) }).await.unwrap();
        assert_eq!(cache.stats().keys, 0);

        for id in ["a", "b", "c"] {
            cache.get(&key(id, &[]), || async { Ok(Bytes::from_static(b"123")) }).await.unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.size, 6);

        cache.get(&key("d", &[]), || async { Ok(Bytes::from_static(b"1234")) }).await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.size, 4);
    }

    #[tokio::test]
    async fn flush_callback_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let cache = LoadingCache::new(CacheLimits::default()).with_flush_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cache.flush(FlushRequest::new("site", ["x"]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
