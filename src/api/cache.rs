//! TTL response cache
//!
//! Entries are keyed by `METHOD:path` and expire a fixed time after insertion.
//! Expired entries stay in place so `CacheOnly` can still serve them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::transport::ApiResponse;

/// A cached response
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub response: ApiResponse,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CachedResponse {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub invalidations: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsResponse {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub invalidations: u64,
    pub ttl_seconds: u64,
}

/// Response cache shared by all API calls
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
    ttl: Duration,
    max_entries: usize,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Unexpired entry for `key`
    pub fn get_fresh(&self, key: &str) -> Option<ApiResponse> {
        let hit = self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.response.clone());
        self.count(hit.is_some());
        hit
    }

    /// Entry for `key` regardless of age
    pub fn get_any(&self, key: &str) -> Option<ApiResponse> {
        let hit = self.entries.get(key).map(|entry| entry.response.clone());
        self.count(hit.is_some());
        hit
    }

    fn count(&self, hit: bool) {
        if hit {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn put(&self, key: String, response: ApiResponse) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        let now = Instant::now();
        self.entries.insert(
            key,
            CachedResponse {
                response,
                stored_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.stored_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn invalidate(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn remove_expired(&self) {
        self.entries.retain(|_, v| !v.is_expired());
    }

    pub fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        self.stats
            .invalidations
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsResponse {
        CacheStatsResponse {
            entries: self.entries.len(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            hit_rate: self.stats.hit_rate(),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_and_stale() {
        let cache = ResponseCache::new(Duration::from_millis(20), 10);
        cache.put("GET:/profile".into(), ApiResponse::ok(json!({"name": "a"})));
        assert!(cache.get_fresh("GET:/profile").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get_fresh("GET:/profile").is_none());
        assert!(cache.get_any("GET:/profile").is_some());

        cache.remove_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.put("a".into(), ApiResponse::ok(json!(1)));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("b".into(), ApiResponse::ok(json!(2)));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("c".into(), ApiResponse::ok(json!(3)));

        assert_eq!(cache.len(), 2);
        assert!(cache.get_any("a").is_none());
        assert!(cache.get_any("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_stats() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);
        assert!(cache.get_fresh("x").is_none());
        cache.put("x".into(), ApiResponse::ok(json!(null)));
        assert!(cache.get_fresh("x").is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
