//! Disk cache tier.
//!
//! A best-effort second tier backed by sibling `.body`/`.meta` files named
//! after the SHA-1 hash of the cache key. Any I/O failure is swallowed: the
//! disk tier is an optimization, never a source of request failure.

use crate::cache::CacheEntry;
use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskMeta {
    key: String,
    headers: Vec<(String, String)>,
    status_code: u16,
    created_at_unix: u64,
    expires_at_unix: u64,
    etag: Option<String>,
    last_modified: Option<String>,
    size_bytes: u64,
    last_accessed_unix: u64,
}

struct Inner {
    index: HashMap<String, DiskMeta>,
    current_size: u64,
}

/// The disk-tier cache. `dir` is created (including parents) at
/// construction time; failure to create it is fatal at startup per the
/// error-handling design, so `new` returns a `Result`.
pub struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
    inner: Mutex<Inner>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn safe_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hex::encode(hasher.finalize())
}

impl DiskCache {
    pub fn new(dir: impl AsRef<Path>, max_bytes: u64) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_bytes,
            inner: Mutex::new(Inner {
                index: HashMap::new(),
                current_size: 0,
            }),
        })
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.body", safe_key(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.meta", safe_key(key)))
    }

    /// Lazily loads `key`'s metadata into the in-memory index on first
    /// touch, then serves the body from disk if present and fresh.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.index.contains_key(key) {
            match std::fs::read(self.meta_path(key)) {
                Ok(bytes) => match serde_json::from_slice::<DiskMeta>(&bytes) {
                    Ok(meta) => {
                        inner.current_size += meta.size_bytes;
                        inner.index.insert(key.to_string(), meta);
                    }
                    Err(err) => {
                        debug!(%key, error = %err, "disk cache meta parse failed, treating as absent");
                        return None;
                    }
                },
                Err(_) => return None,
            }
        }

        let meta = inner.index.get(key)?.clone();
        if now_unix() >= meta.expires_at_unix {
            self.remove_locked(&mut inner, key);
            return None;
        }

        let body = match std::fs::read(self.body_path(key)) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                warn!(%key, error = %err, "disk cache body missing for indexed entry");
                return None;
            }
        };

        let mut meta = meta;
        meta.last_accessed_unix = now_unix();
        let _ = self.write_meta_locked(key, &meta);
        inner.index.insert(key.to_string(), meta.clone());

        Some(meta_to_entry(meta, body))
    }

    /// Writes body then meta. Any write failure silently no-ops, leaving the
    /// index unchanged.
    pub fn set(&self, key: &str, entry: &CacheEntry) {
        let mut inner = self.inner.lock().unwrap();

        if std::fs::write(self.body_path(key), &entry.body).is_err() {
            return;
        }

        let meta = entry_to_meta(key, entry);
        if self.write_meta_locked(key, &meta).is_err() {
            return;
        }

        if let Some(old) = inner.index.get(key) {
            inner.current_size = inner.current_size.saturating_sub(old.size_bytes);
        }
        inner.current_size += meta.size_bytes;
        inner.index.insert(key.to_string(), meta);

        self.evict_if_needed_locked(&mut inner);
    }

    fn write_meta_locked(&self, key: &str, meta: &DiskMeta) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(meta)?;
        std::fs::write(self.meta_path(key), bytes)
    }

    fn remove_locked(&self, inner: &mut Inner, key: &str) {
        if let Some(meta) = inner.index.remove(key) {
            inner.current_size = inner.current_size.saturating_sub(meta.size_bytes);
        }
        let _ = std::fs::remove_file(self.body_path(key));
        let _ = std::fs::remove_file(self.meta_path(key));
    }

    fn evict_if_needed_locked(&self, inner: &mut Inner) {
        while inner.current_size > self.max_bytes {
            let victim = inner
                .index
                .iter()
                .min_by_key(|(_, meta)| meta.last_accessed_unix)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            self.remove_locked(inner, &victim);
        }
    }
}

fn entry_to_meta(key: &str, entry: &CacheEntry) -> DiskMeta {
    let now = now_unix();
    DiskMeta {
        key: key.to_string(),
        headers: entry
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        status_code: entry.status_code,
        created_at_unix: now,
        expires_at_unix: now + seconds_until(entry),
        etag: entry.etag.clone(),
        last_modified: entry.last_modified.clone(),
        size_bytes: key.len() as u64 + entry.body.len() as u64,
        last_accessed_unix: now,
    }
}

fn seconds_until(entry: &CacheEntry) -> u64 {
    entry
        .expires_at
        .checked_duration_since(std::time::Instant::now())
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn meta_to_entry(meta: DiskMeta, body: Bytes) -> CacheEntry {
    let mut headers = HeaderMap::new();
    for (name, value) in &meta.headers {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::header::HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    let now = std::time::Instant::now();
    let ttl = meta.expires_at_unix.saturating_sub(now_unix());

    CacheEntry {
        body,
        headers,
        status_code: meta.status_code,
        created_at: now,
        expires_at: now + Duration::from_secs(ttl),
        etag: meta.etag,
        last_modified: meta.last_modified,
        size_bytes: meta.size_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

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
    fn set_then_get_round_trips() {
        let dir = tempdir();
        let cache = DiskCache::new(&dir, 1_000_000).unwrap();
        cache.set("k", &entry("hello", Duration::from_secs(60)));
        let got = cache.get("k").unwrap();
        assert_eq!(got.body, Bytes::from("hello"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn expired_entry_is_removed_on_get() {
        let dir = tempdir();
        let cache = DiskCache::new(&dir, 1_000_000).unwrap();
        cache.set("k", &entry("hello", Duration::ZERO));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get("k").is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn eviction_removes_oldest_last_accessed() {
        // Each entry is 11 bytes (1-byte key + 10-byte body); a budget of 15
        // holds exactly one, so the second `Set` must evict the first.
        let dir = tempdir();
        let cache = DiskCache::new(&dir, 15).unwrap();
        cache.set("a", &entry("aaaaaaaaaa", Duration::from_secs(60)));
        cache.set("b", &entry("bbbbbbbbbb", Duration::from_secs(60)));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("edge-cache-disk-test-{}", safe_key(&format!("{:p}", &dir))));
        dir
    }
}
