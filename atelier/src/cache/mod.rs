//! Cache for classifier results and other expensive calls.
//!
//! Hits bypass the underlying call entirely; entries expire by TTL and the
//! store is bounded, so a long-running router cannot grow without limit.

mod error;
mod lru;

pub use error::CacheError;
pub use lru::LruTtlCache;

use async_trait::async_trait;
use std::time::Duration;

/// Key-value cache with optional per-entry TTL.
#[async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Clone + Send + Sync,
{
    /// Returns the value, or `None` if absent or expired.
    async fn get(&self, key: &K) -> Option<V>;

    /// Stores a value; `None` TTL means no expiry.
    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &K) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_trait_object_works() {
        let cache: Box<dyn Cache<String, String>> = Box::new(LruTtlCache::new(8));
        cache
            .set("key".to_string(), "value".to_string(), None)
            .await
            .unwrap();
        assert_eq!(
            cache.get(&"key".to_string()).await,
            Some("value".to_string())
        );
    }
}
