//! Response Cache (C3): cacheability gating, LRU ordering with dual caps,
//! TTL-based freshness, and a single-mutex concurrency discipline whose
//! critical section never performs I/O.

use std::num::NonZeroUsize;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::trace;
use xxhash_rust::xxh64::xxh64;

use crate::error::ProxyError;
use crate::request::Headers;

/// (method, host, path) — the cache key, hashed to a `u64` for fast lookup
/// and compact storage in the LRU map.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: String,
    pub host: String,
    pub path: String,
}

impl CacheKey {
    pub fn new(method: &str, host: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            host: host.to_ascii_lowercase(),
            path: path.to_string(),
        }
    }

    fn hash_u64(&self) -> u64 {
        xxh64(
            format!("{}:{}{}", self.method, self.host, self.path).as_bytes(),
            0,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub response_bytes: Vec<u8>,
    pub status_code: u16,
    pub headers: Headers,
    pub insert_time: u64,
    pub content_length: usize,
    pub hits: u64,
}

impl CacheEntry {
    fn is_fresh(&self, now: u64, ttl: u64) -> bool {
        now.saturating_sub(self.insert_time) < ttl
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    map: LruCache<u64, CacheEntry>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
}

pub struct Cache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_size_bytes: usize,
    default_ttl: u64,
}

impl Cache {
    pub fn new(max_entries: usize, max_size_bytes: usize, default_ttl: u64) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max_entries.max(1) is non-zero");
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::new(cap),
                total_bytes: 0,
                hits: 0,
                misses: 0,
            }),
            max_entries,
            max_size_bytes,
            default_ttl,
        }
    }

    /// Request-side cacheability gate.
    pub fn is_cacheable_request(method: &str, headers: &Headers) -> bool {
        if !method.eq_ignore_ascii_case("GET") {
            return false;
        }
        if headers.contains("Authorization") {
            return false;
        }
        if let Some(cc) = headers.get("Cache-Control") {
            let cc = cc.to_lowercase();
            if cc.contains("no-store") || cc.contains("no-cache") {
                return false;
            }
        }
        true
    }

    /// Response-side cacheability gate.
    pub fn is_cacheable_response(status: u16, headers: &Headers) -> bool {
        if !matches!(status, 200 | 301 | 302 | 304) {
            return false;
        }
        if let Some(cc) = headers.get("Cache-Control") {
            let cc = cc.to_lowercase();
            if cc.contains("no-store") || cc.contains("private") {
                return false;
            }
        }
        true
    }

    /// Looks up `key` given the request's headers. Only returns fresh,
    /// cacheable-request hits; moves the entry to the MRU end on success.
    pub async fn get(&self, key: &CacheKey, request_headers: &Headers) -> Option<CacheEntry> {
        if !Self::is_cacheable_request(&key.method, request_headers) {
            return None;
        }

        let hash = key.hash_u64();
        let now = now_secs();
        let mut inner = self.inner.lock().await;

        let fresh = match inner.map.peek(&hash) {
            Some(entry) => entry.is_fresh(now, self.default_ttl),
            None => false,
        };

        if !fresh {
            if let Some(stale) = inner.map.pop(&hash) {
                inner.total_bytes -= stale.content_length;
            }
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let entry = inner.map.get_mut(&hash).expect("checked fresh above");
        entry.hits += 1;
        Some(entry.clone())
    }

    /// Parses and inserts a captured response ("status/header
    /// extraction" + "LRU with dual caps"). Returns `false` (silently) when
    /// the request or response is not cacheable, or the response is
    /// malformed — the response is still delivered to the client regardless.
    pub async fn put(
        &self,
        key: &CacheKey,
        request_headers: &Headers,
        response_bytes: &[u8],
    ) -> bool {
        if !Self::is_cacheable_request(&key.method, request_headers) {
            trace!("{}", ProxyError::CacheInsertRejected("request not cacheable"));
            return false;
        }

        let Some((status, headers)) = parse_status_and_headers(response_bytes) else {
            trace!(
                "{}",
                ProxyError::CacheInsertRejected("malformed response header block")
            );
            return false;
        };

        if !Self::is_cacheable_response(status, &headers) {
            trace!("{}", ProxyError::CacheInsertRejected("response not cacheable"));
            return false;
        }

        let entry = CacheEntry {
            response_bytes: response_bytes.to_vec(),
            status_code: status,
            headers,
            insert_time: now_secs(),
            content_length: response_bytes.len(),
            hits: 0,
        };

        if entry.content_length > self.max_size_bytes {
            trace!(
                "{}",
                ProxyError::CacheInsertRejected("response exceeds max_size_bytes")
            );
            return false;
        }

        let hash = key.hash_u64();
        let mut inner = self.inner.lock().await;

        if let Some(old) = inner.map.pop(&hash) {
            inner.total_bytes -= old.content_length;
        }

        while inner.map.len() >= self.max_entries {
            if let Some((_, evicted)) = inner.map.pop_lru() {
                inner.total_bytes -= evicted.content_length;
            } else {
                break;
            }
        }

        inner.total_bytes += entry.content_length;
        inner.map.put(hash, entry);

        while inner.total_bytes > self.max_size_bytes && !inner.map.is_empty() {
            if let Some((_, evicted)) = inner.map.pop_lru() {
                inner.total_bytes -= evicted.content_length;
            } else {
                break;
            }
        }

        true
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            entries: inner.map.len(),
            total_bytes: inner.total_bytes,
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.map.clear();
        inner.total_bytes = 0;
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Splits a captured response at `\r\n\r\n`, extracts the status code from
/// the status line, and parses the header block. Returns `None` if the
/// header region is malformed (no terminator, or no status token).
fn parse_status_and_headers(response_bytes: &[u8]) -> Option<(u16, Headers)> {
    let pos = response_bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")?;
    let header_bytes = &response_bytes[..pos];
    let text = String::from_utf8_lossy(header_bytes);
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if let Some(idx) = line.find(':') {
            let name = line[..idx].trim().to_string();
            let value = line[idx + 1..].trim().to_string();
            headers.push((name, value));
        }
    }

    Some((status, Headers(headers)))
}
