//! In-memory cache tier.
//!
//! A single exclusive lock covers the recency-ordered store, size
//! accounting, the eviction policy, and the Vary table, per the
//! concurrency model: no partial updates are ever observable across these.

use crate::freshness;
use bytes::Bytes;
use http::HeaderMap;
use lru::LruCache;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Eviction policy applied once the cache exceeds its byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
}

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Bytes,
    pub headers: HeaderMap,
    pub status_code: u16,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// A stored entry plus the recency/frequency bookkeeping the eviction
/// policies need.
#[derive(Debug, Clone)]
struct CacheItem {
    entry: CacheEntry,
    hits: u64,
    last_access: Instant,
}

fn estimate_entry_size(key: &str, entry: &CacheEntry) -> u64 {
    let mut size = key.len() as u64 + entry.body.len() as u64;
    for (name, value) in entry.headers.iter() {
        size += name.as_str().len() as u64;
        size += value.len() as u64;
    }
    size
}

struct Inner {
    store: LruCache<String, CacheItem>,
    current_size: u64,
    max_bytes: u64,
    policy: EvictionPolicy,
    vary_by_base: HashMap<String, Vec<String>>,
}

impl Inner {
    fn select_victim(&self) -> Option<String> {
        match self.policy {
            EvictionPolicy::Lru => self.store.peek_lru().map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => self
                .store
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.hits
                        .cmp(&b.hits)
                        .then_with(|| a.last_access.cmp(&b.last_access))
                })
                .map(|(k, _)| k.clone()),
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(item) = self.store.pop(key) {
            self.current_size = self.current_size.saturating_sub(item.entry.size_bytes);
        }
    }

    fn evict_if_needed(&mut self) {
        while self.current_size > self.max_bytes {
            let Some(victim) = self.select_victim() else {
                break;
            };
            debug!(key = %victim, policy = ?self.policy, "evicting cache entry");
            self.remove(&victim);
        }
    }
}

/// The memory-tier cache. Bounded by `max_bytes`; entries beyond the bound
/// are evicted per the configured policy.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    ttl_floor: Duration,
}

impl MemoryCache {
    pub fn new(max_bytes: u64, cleanup_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store: LruCache::unbounded(),
                current_size: 0,
                max_bytes,
                policy: EvictionPolicy::Lru,
                vary_by_base: HashMap::new(),
            }),
            ttl_floor: cleanup_interval,
        }
    }

    pub fn set_eviction_policy(&self, policy: EvictionPolicy) {
        self.inner.lock().unwrap().policy = policy;
    }

    /// Returns a deep copy of the entry if present and fresh.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().unwrap();
        let expired = inner.store.peek(key).map(|item| item.entry.is_expired());
        match expired {
            Some(true) => {
                inner.remove(key);
                None
            }
            Some(false) => {
                let item = inner.store.get_mut(key).unwrap();
                item.hits += 1;
                item.last_access = Instant::now();
                Some(item.entry.clone())
            }
            None => None,
        }
    }

    /// Returns the entry regardless of expiry, for building conditional
    /// revalidation headers. Updates hit/recency bookkeeping exactly like
    /// `get`, minus the expiry check.
    pub fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.store.get_mut(key)?;
        item.hits += 1;
        item.last_access = Instant::now();
        Some(item.entry.clone())
    }

    pub fn set(&self, key: &str, entry: CacheEntry) {
        let mut inner = self.inner.lock().unwrap();
        let size = estimate_entry_size(key, &entry);
        let mut entry = entry;
        entry.size_bytes = size;

        let prior_hits = match inner.store.peek(key) {
            Some(old) => {
                inner.current_size = inner.current_size.saturating_sub(old.entry.size_bytes);
                Some(old.hits)
            }
            None => None,
        };
        inner.current_size += size;
        inner.store.put(
            key.to_string(),
            CacheItem {
                entry,
                hits: prior_hits.map(|h| h + 1).unwrap_or(1),
                last_access: Instant::now(),
            },
        );
        inner.evict_if_needed();
    }

    pub fn delete(&self, key: &str) {
        self.inner.lock().unwrap().remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.store.clear();
        inner.current_size = 0;
        inner.vary_by_base.clear();
    }

    /// Identical to `clear`; matches the original binary's `Close`.
    pub fn shutdown(&self) {
        self.clear();
    }

    /// Computes the full cache key for `base_key` given the registered Vary
    /// selectors (if any) and the incoming request's header values.
    pub fn lookup_key(&self, base_key: &str, request_headers: &HeaderMap) -> String {
        let inner = self.inner.lock().unwrap();
        match inner.vary_by_base.get(base_key) {
            Some(vary_headers) => freshness::full_key(base_key, vary_headers, request_headers),
            None => base_key.to_string(),
        }
    }

    /// Registers the Vary selectors for `base_key` from a response's `Vary`
    /// header(s). Returns `false` (and does not register) if `Vary: *` is
    /// present, meaning the response must not be cached.
    pub fn update_vary(&self, base_key: &str, response_headers: &HeaderMap) -> bool {
        match freshness::parse_vary_headers(response_headers) {
            None => false,
            Some(vary_headers) => {
                self.inner
                    .lock()
                    .unwrap()
                    .vary_by_base
                    .insert(base_key.to_string(), vary_headers);
                true
            }
        }
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let inner = self.inner.lock().unwrap();
        MemoryCacheStats {
            entries: inner.store.len(),
            current_size: inner.current_size,
            max_bytes: inner.max_bytes,
        }
    }

    /// Removes all expired entries. Intended to be driven by a periodic
    /// background task (see `start_cleanup`).
    pub fn cleanup_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .store
            .iter()
            .filter(|(_, item)| item.entry.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.remove(&key);
        }
    }

    /// Spawns a background task that sweeps expired entries on a fixed
    /// interval, matching the original's `StartCleanup` goroutine.
    pub fn start_cleanup(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.ttl_floor;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup_expired();
            }
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryCacheStats {
    pub entries: usize,
    pub current_size: u64,
    pub max_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn entry(body: &str, ttl: Duration) -> CacheEntry {
        CacheEntry {
            body: Bytes::from(body.to_string()),
            headers: HeaderMap::new(),
            status_code: 200,
            created_at: Instant::now(),
            expires_at: Instant::now() + ttl,
            etag: None,
            last_modified: None,
            size_bytes: 0,
        }
    }

    #[test]
    fn set_then_get_returns_entry() {
        let cache = MemoryCache::new(1_000_000, Duration::from_secs(60));
        cache.set("k", entry("hello", Duration::from_secs(60)));
        let got = cache.get("k").unwrap();
        assert_eq!(got.body, Bytes::from("hello"));
    }

    #[test]
    fn expired_entry_is_not_returned_by_get() {
        let cache = MemoryCache::new(1_000_000, Duration::from_secs(60));
        cache.set("k", entry("hello", Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn get_stale_ignores_expiry() {
        let cache = MemoryCache::new(1_000_000, Duration::from_secs(60));
        cache.set("k", entry("hello", Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_stale("k").is_some());
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn eviction_respects_byte_budget() {
        // Each entry below is 11 bytes (1-byte key + 10-byte body); a budget
        // of 15 holds exactly one, so the second `Set` must evict the first.
        let cache = MemoryCache::new(15, Duration::from_secs(60));
        cache.set("a", entry("aaaaaaaaaa", Duration::from_secs(60)));
        cache.set("b", entry("bbbbbbbbbb", Duration::from_secs(60)));
        let stats = cache.stats();
        assert!(stats.current_size <= stats.max_bytes);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn lfu_evicts_least_hit_entry() {
        // A budget of 25 holds two 11-byte entries but not three.
        let cache = MemoryCache::new(25, Duration::from_secs(60));
        cache.set_eviction_policy(EvictionPolicy::Lfu);
        cache.set("a", entry("aaaaaaaaaa", Duration::from_secs(60)));
        cache.set("b", entry("bbbbbbbbbb", Duration::from_secs(60)));
        // touch "a" so "b" becomes the min-hit victim on the next insert
        cache.get("a");
        cache.set("c", entry("cccccccccc", Duration::from_secs(60)));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn vary_star_is_not_registered() {
        let cache = MemoryCache::new(1_000_000, Duration::from_secs(60));
        let mut headers = HeaderMap::new();
        headers.insert(http::header::VARY, HeaderValue::from_static("*"));
        assert!(!cache.update_vary("GET:/x", &headers));
        assert_eq!(cache.lookup_key("GET:/x", &HeaderMap::new()), "GET:/x");
    }

    #[test]
    fn vary_aware_lookup_key_includes_selector() {
        let cache = MemoryCache::new(1_000_000, Duration::from_secs(60));
        let mut response_headers = HeaderMap::new();
        response_headers.insert(http::header::VARY, HeaderValue::from_static("Accept-Encoding"));
        assert!(cache.update_vary("GET:/x", &response_headers));

        let mut request_headers = HeaderMap::new();
        request_headers.insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        assert_eq!(
            cache.lookup_key("GET:/x", &request_headers),
            "GET:/x|accept-encoding=gzip"
        );
    }
}
