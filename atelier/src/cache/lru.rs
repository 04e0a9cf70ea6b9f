//! Bounded in-memory cache: LRU eviction plus per-entry TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::{Cache, CacheError};

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    /// Recency stamp; the smallest stamp is evicted when over capacity.
    last_used: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    tick: u64,
}

/// Capacity-bounded cache with TTL.
///
/// Reads refresh recency; writes over capacity evict the least recently used
/// entry (expired entries are dropped first). Capacity is expected to be
/// small, so eviction scans the map.
pub struct LruTtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
}

impl<K, V> LruTtlCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache holding at most `capacity` live entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Current number of entries, expired ones included until they are swept.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl<K, V> Cache<K, V> for LruTtlCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;
        match inner.map.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.map.remove(key);
                None
            }
            Some(entry) => {
                entry.last_used = tick;
                Some(entry.value.clone())
            }
            None => None,
        }
    }

    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(
            key,
            Entry {
                value,
                expires_at: ttl.map(|d| now + d),
                last_used: tick,
            },
        );
        if inner.map.len() > self.capacity {
            // Sweep expired entries, then evict by recency until within bound.
            inner.map.retain(|_, e| !e.is_expired(now));
            while inner.map.len() > self.capacity {
                let oldest = inner
                    .map
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        inner.map.remove(&k);
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<(), CacheError> {
        self.inner.lock().await.map.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.lock().await.map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_delete() {
        let cache = LruTtlCache::new(4);
        assert_eq!(cache.get(&"k".to_string()).await, None);
        cache.set("k".to_string(), 1u32, None).await.unwrap();
        assert_eq!(cache.get(&"k".to_string()).await, Some(1));
        cache.delete(&"k".to_string()).await.unwrap();
        assert_eq!(cache.get(&"k".to_string()).await, None);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let cache = LruTtlCache::new(4);
        cache
            .set("k".to_string(), 1u32, Some(Duration::from_millis(40)))
            .await
            .unwrap();
        assert_eq!(cache.get(&"k".to_string()).await, Some(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get(&"k".to_string()).await, None);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = LruTtlCache::new(2);
        cache.set("a".to_string(), 1u32, None).await.unwrap();
        cache.set("b".to_string(), 2u32, None).await.unwrap();
        // Touch "a" so "b" is the least recently used.
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        cache.set("c".to_string(), 3u32, None).await.unwrap();

        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert_eq!(cache.get(&"b".to_string()).await, None);
        assert_eq!(cache.get(&"c".to_string()).await, Some(3));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn expired_entries_are_swept_before_eviction() {
        let cache = LruTtlCache::new(2);
        cache
            .set("old".to_string(), 0u32, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.set("keep".to_string(), 1u32, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.set("new".to_string(), 2u32, None).await.unwrap();

        assert_eq!(cache.get(&"keep".to_string()).await, Some(1));
        assert_eq!(cache.get(&"new".to_string()).await, Some(2));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let cache = LruTtlCache::new(4);
        cache.set("a".to_string(), 1u32, None).await.unwrap();
        cache.set("b".to_string(), 2u32, None).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.is_empty().await);
    }
}
