use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Read-through memoization for repository queries.
///
/// Values are stored as JSON so heterogeneous row types share one store.
/// Null results are never cached; a missing row must stay a miss so the
/// next read observes a later insert.
pub struct QueryCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    map: HashMap<String, Entry>,
    /// Recency order, least recently used first.
    order: Vec<String>,
    hits: u64,
    misses: u64,
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryCacheStats {
    pub items: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();

        let expired = match inner.map.get(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
            inner.misses += 1;
            return None;
        }

        inner.order.retain(|k| k != key);
        inner.order.push(key.to_string());
        inner.hits += 1;

        let value = inner.map.get(key).map(|e| e.value.clone())?;
        serde_json::from_value(value).ok()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(_) => return,
        };
        if value.is_null() {
            debug!(key, "Refusing to cache null value");
            return;
        }

        let mut inner = self.inner.lock();

        if !inner.map.contains_key(key) && inner.map.len() >= self.capacity {
            if let Some(oldest) = inner.order.first().cloned() {
                inner.map.remove(&oldest);
                inner.order.remove(0);
            }
        }

        inner.map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        inner.order.retain(|k| k != key);
        inner.order.push(key.to_string());
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.map.remove(key);
        inner.order.retain(|k| k != key);
    }

    /// Remove every key matching the pattern. A trailing `*` matches any
    /// suffix; anything else is an exact key.
    pub fn clear_pattern(&self, pattern: &str) {
        let mut inner = self.inner.lock();
        match pattern.strip_suffix('*') {
            Some(prefix) => {
                inner.map.retain(|k, _| !k.starts_with(prefix));
                inner.order.retain(|k| !k.starts_with(prefix));
            }
            None => {
                inner.map.remove(pattern);
                inner.order.retain(|k| k != pattern);
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> QueryCacheStats {
        let inner = self.inner.lock();
        QueryCacheStats {
            items: inner.map.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_miss() {
        let cache = QueryCache::new(10);
        assert_eq!(cache.get::<u32>("k"), None);
        cache.set("k", &7u32, Duration::from_secs(60));
        assert_eq!(cache.get::<u32>("k"), Some(7));
    }

    #[test]
    fn ttl_expiry() {
        let cache = QueryCache::new(10);
        cache.set("k", &1u32, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get::<u32>("k"), None);
    }

    #[test]
    fn null_is_never_cached() {
        let cache = QueryCache::new(10);
        cache.set("k", &Option::<u32>::None, Duration::from_secs(60));
        assert_eq!(cache.get::<Option<u32>>("k"), None);
        assert_eq!(cache.stats().items, 0);
    }

    #[test]
    fn lru_evicts_coldest() {
        let cache = QueryCache::new(2);
        cache.set("a", &1u32, Duration::from_secs(60));
        cache.set("b", &2u32, Duration::from_secs(60));
        // Touch "a" so "b" becomes coldest.
        cache.get::<u32>("a");
        cache.set("c", &3u32, Duration::from_secs(60));

        assert_eq!(cache.get::<u32>("a"), Some(1));
        assert_eq!(cache.get::<u32>("b"), None);
        assert_eq!(cache.get::<u32>("c"), Some(3));
    }

    #[test]
    fn clear_pattern_prefix() {
        let cache = QueryCache::new(10);
        cache.set("user:1", &1u32, Duration::from_secs(60));
        cache.set("user:2", &2u32, Duration::from_secs(60));
        cache.set("conv:1", &3u32, Duration::from_secs(60));

        cache.clear_pattern("user:*");
        assert_eq!(cache.get::<u32>("user:1"), None);
        assert_eq!(cache.get::<u32>("user:2"), None);
        assert_eq!(cache.get::<u32>("conv:1"), Some(3));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = QueryCache::new(10);
        cache.get::<u32>("missing");
        cache.set("k", &1u32, Duration::from_secs(60));
        cache.get::<u32>("k");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
