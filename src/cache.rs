//! Response cache keyed by request method and path
//!
//! Expiry is checked lazily on read. A periodic [`ResponseCache::sweep_expired`]
//! keeps memory bounded for keys that are never read again.

use dashmap::DashMap;
use hyper::body::Bytes;
use hyper::Method;
use std::time::{Duration, Instant};

/// Cache key: request method and path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub path: String,
}

impl CacheKey {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    body: Bytes,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.stored_at + self.ttl
    }
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry; an expired entry is removed and reported as a miss
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Bytes> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(entry.body.clone());
            }
        }
        self.entries.remove_if(key, |_, e| !e.is_live(now));
        None
    }

    pub fn put(&self, key: CacheKey, body: Bytes, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                body,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, e| {
            let keep = e.is_live(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
