//! In-memory response store with TTL expiry and LRU eviction.
//!
//! Keys are full upstream request identities (path plus query). Only
//! successful upstream bodies are ever written here. Entries expire at
//! `stored_at + ttl`; once expired they are never served again and are
//! purged lazily on read or on the next write.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use tracing::{debug, warn};

/// A single cached upstream body.
#[derive(Debug, Clone)]
struct CacheEntry {
    /// Upstream response body, passed through verbatim.
    body: Bytes,
    /// Instant after which the entry is stale.
    expires_at: Instant,
    /// Last read or write, drives LRU eviction.
    accessed_at: Instant,
    /// Number of cache hits for this entry.
    hit_count: u32,
}

/// Thread-safe response store shared by all requests for one resource class.
#[derive(Debug)]
pub struct CacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl CacheStore {
    /// Create a store holding at most `max_entries` keys.
    ///
    /// `max_entries` is clamped to a minimum of 1.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a fresh body. Returns `None` if the key is absent or expired.
    pub fn get(&self, key: &str, now: Instant) -> Option<Bytes> {
        let mut entries = self.lock();
        let expired = entries.get(key).map(|e| now >= e.expires_at)?;
        if expired {
            debug!(key = key, "Cache entry expired");
            entries.remove(key);
            return None;
        }
        let entry = entries.get_mut(key)?;
        entry.accessed_at = now;
        entry.hit_count = entry.hit_count.saturating_add(1);
        Some(entry.body.clone())
    }

    /// Store a body, replacing any existing entry for `key`.
    ///
    /// Evicts expired entries first, then LRU entries if at capacity. A `ttl`
    /// that overflows the clock is not stored.
    pub fn set(&self, key: String, body: Bytes, ttl: Duration, now: Instant) {
        let Some(expires_at) = now.checked_add(ttl) else {
            warn!(key = %key, ttl_secs = ttl.as_secs(), "Cache TTL overflows the clock; not caching");
            return;
        };
        let mut entries = self.lock();
        entries.retain(|_, e| now < e.expires_at);
        while !entries.contains_key(&key) && entries.len() >= self.max_entries {
            evict_lru(&mut entries);
        }
        debug!(key = %key, bytes = body.len(), ttl_secs = ttl.as_secs(), "Caching upstream body");
        entries.insert(
            key,
            CacheEntry {
                body,
                expires_at,
                accessed_at: now,
                hit_count: 0,
            },
        );
    }

    /// Return aggregate statistics about the store.
    pub fn stats(&self) -> CacheStats {
        let entries = self.lock();
        CacheStats {
            total_entries: entries.len(),
            total_hits: entries.values().map(|e| u64::from(e.hit_count)).sum(),
            total_bytes: entries.values().map(|e| e.body.len()).sum(),
        }
    }

    /// Return the number of entries currently held, fresh or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Return `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn evict_lru(entries: &mut HashMap<String, CacheEntry>) {
    if let Some(lru_key) = entries
        .iter()
        .min_by_key(|(_, e)| e.accessed_at)
        .map(|(k, _)| k.clone())
    {
        debug!(key = %lru_key, "Evicting LRU cache entry");
        entries.remove(&lru_key);
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently in the store.
    pub total_entries: usize,
    /// Cumulative number of hits across live entries.
    pub total_hits: u64,
    /// Sum of cached body sizes.
    pub total_bytes: usize,
}
