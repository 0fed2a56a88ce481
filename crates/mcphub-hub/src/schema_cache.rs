//! L3: schema cache (spec.md §4 L3).
//!
//! Caches a child's last-known tool/resource/prompt listing so repeat
//! `tools/list` fan-outs don't always have to round-trip every child.
//! Concurrent misses for the same key are coalesced onto a single load.
//!
//! Open question (spec.md §9, recorded in DESIGN.md): TTL is checked before
//! LRU on every access — an expired entry is a miss even if it's otherwise
//! the most-recently-used, and LRU eviction only ever considers non-expired
//! entries (expired ones are simply gone, not "evicted").

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct CacheState<K, V> {
    map: HashMap<K, Entry<V>>,
    order: VecDeque<K>,
}

/// L3 cache counters (spec.md §4 L3): hit/miss/eviction/coalesced counts plus
/// the derived hit rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub coalesced: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    coalesced: AtomicU64,
}

pub struct SchemaCache<K, V> {
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState<K, V>>,
    load_locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
    counters: Counters,
}

impl<K, V> SchemaCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            load_locks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }

    fn is_fresh(entry: &Entry<V>, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) < ttl
    }

    async fn try_get_fresh(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let fresh = state.map.get(key).is_some_and(|e| Self::is_fresh(e, self.ttl, now));
        if !fresh {
            return None;
        }
        touch(&mut state.order, key);
        state.map.get(key).map(|e| e.value.clone())
    }

    async fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.map.insert(key.clone(), Entry { value, inserted_at: now });
        touch(&mut state.order, &key);

        while state.map.len() > self.capacity {
            let Some(evict_key) = state.order.pop_front() else {
                break;
            };
            if evict_key != key {
                state.map.remove(&evict_key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                state.order.push_front(evict_key);
                break;
            }
        }
    }

    /// Return the cached value if fresh; otherwise run `loader` to repopulate
    /// it, coalescing concurrent misses on the same key onto one load.
    pub async fn get_or_load<F, Fut>(&self, key: K, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.try_get_fresh(&key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let lock = {
            let mut locks = self.load_locks.lock().await;
            locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        // Double-check: another task may have populated the cache while we
        // waited for the per-key load lock.
        if let Some(value) = self.try_get_fresh(&key).await {
            self.load_locks.lock().await.remove(&key);
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let result = loader().await;
        self.load_locks.lock().await.remove(&key);

        match result {
            Ok(value) => {
                self.insert(key, value.clone()).await;
                Ok(value)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn invalidate(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.map.remove(key);
        state.order.retain(|k| k != key);
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.map.clear();
        state.order.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.map.len()
    }
}

fn touch<K: Eq + Clone>(order: &mut VecDeque<K>, key: &K) {
    order.retain(|k| k != key);
    order.push_back(key.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn caches_until_ttl_expires() {
        let cache: SchemaCache<&str, u32> = SchemaCache::new(10, Duration::from_millis(20));
        let loads = Arc::new(AtomicUsize::new(0));

        let loads_clone = loads.clone();
        let v1 = cache
            .get_or_load("k", || async move {
                loads_clone.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let loads_clone = loads.clone();
        let v2 = cache
            .get_or_load("k", || async move {
                loads_clone.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(v2, 1, "second call within ttl should hit cache");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let loads_clone = loads.clone();
        let v3 = cache
            .get_or_load("k", || async move {
                loads_clone.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            })
            .await
            .unwrap();
        assert_eq!(v3, 3, "expired entry must be reloaded even though it was MRU");
    }

    #[tokio::test]
    async fn evicts_least_recently_used_over_capacity() {
        let cache: SchemaCache<&str, u32> = SchemaCache::new(2, Duration::from_secs(60));
        cache.get_or_load("a", || async { Ok(1) }).await.unwrap();
        cache.get_or_load("b", || async { Ok(2) }).await.unwrap();
        cache.get_or_load("a", || async { Ok(1) }).await.unwrap(); // touch a, b now LRU
        cache.get_or_load("c", || async { Ok(3) }).await.unwrap(); // evicts b

        assert_eq!(cache.len().await, 2);
        let reload = Arc::new(AtomicUsize::new(0));
        let reload_clone = reload.clone();
        cache
            .get_or_load("b", || async move {
                reload_clone.fetch_add(1, Ordering::SeqCst);
                Ok(20)
            })
            .await
            .unwrap();
        assert_eq!(reload.load(Ordering::SeqCst), 1, "b should have been evicted");
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[tokio::test]
    async fn metrics_track_hits_misses_and_coalesced_loads() {
        let cache: SchemaCache<&str, u32> = SchemaCache::new(10, Duration::from_secs(60));

        cache.get_or_load("a", || async { Ok(1) }).await.unwrap();
        let m = cache.metrics();
        assert_eq!(m.misses, 1);
        assert_eq!(m.hits, 0);

        cache.get_or_load("a", || async { Ok(1) }).await.unwrap();
        let m = cache.metrics();
        assert_eq!(m.hits, 1);
        assert!(m.hit_rate() > 0.0);
    }
}
