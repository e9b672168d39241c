//! TTL'd LRU caches for search results and suggestions.
//!
//! Two instances exist in the app:
//!
//! - **Result cache** — full ranked search responses keyed by a hash of
//!   `(normalized_query, scope, limit, fast)`. 100 entries, 5 minute TTL.
//!   Snippets are filled after lookup, so they are not part of the key or
//!   the cached value.
//! - **Suggestion cache** — per-archive autocomplete hits keyed by
//!   `(archive_id, prefix)`. 500 entries, 15 minute TTL.
//!
//! Both are invalidated wholesale whenever the archive set changes.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    accesses: u32,
}

/// LRU cache whose entries also expire after a fixed TTL.
pub struct TtlLru<K: std::hash::Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: std::hash::Hash + Eq, V: Clone> TtlLru<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        TtlLru {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1"),
            )),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                entry.accesses += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            inner.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        inner.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                accesses: 0,
            },
        );
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

pub const RESULT_CACHE_CAP: usize = 100;
pub const RESULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const SUGGEST_CACHE_CAP: usize = 500;
pub const SUGGEST_CACHE_TTL: Duration = Duration::from_secs(900);

/// Stable key for a search request. The query is lowercased and
/// whitespace-normalized; scope is the sorted archive list or collection
/// name; snippets are deliberately excluded.
pub fn search_key(query: &str, scope: &str, limit: usize, fast: bool) -> u64 {
    let normalized = query.trim().to_lowercase();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0xff]);
    hasher.update(scope.as_bytes());
    hasher.update([0xff]);
    hasher.update(limit.to_le_bytes());
    hasher.update([fast as u8]);
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"))
}
