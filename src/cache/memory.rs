//! In-memory tier with strict LRU eviction under a byte ceiling

use crate::cache::{
    entry::CacheEntry,
    types::{CacheKey, TierStats},
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Bounded in-memory tier
///
/// - Thread-safe async access via RwLock
/// - Total serialized size never exceeds `max_bytes`
/// - Access order is touched on every successful `get`
/// - Expired entries are purged lazily on read or by [`MemoryTier::purge_expired`]
#[derive(Clone)]
pub struct MemoryTier {
    max_bytes: usize,
    state: Arc<RwLock<MemoryState>>,
}

struct StoredEntry {
    entry: CacheEntry,
    size_bytes: usize,
    /// Position in `lru_order`
    last_access: u64,
}

/// Internal storage
#[derive(Default)]
struct MemoryState {
    /// Main storage: key -> entry
    entries: HashMap<CacheKey, StoredEntry>,

    /// LRU tracking by access stamp: first is least recently used
    lru_order: BTreeMap<u64, CacheKey>,

    next_access: u64,

    stats: TierStats,

    current_size_bytes: usize,
}

impl MemoryState {
    fn next_stamp(&mut self) -> u64 {
        let stamp = self.next_access;
        self.next_access += 1;
        stamp
    }

    fn touch(&mut self, key: &str) {
        let stamp = self.next_stamp();
        if let Some(stored) = self.entries.get_mut(key) {
            let previous = std::mem::replace(&mut stored.last_access, stamp);
            self.lru_order.remove(&previous);
            self.lru_order.insert(stamp, key.to_string());
        }
    }

    fn pop_least_recent(&mut self) -> Option<CacheKey> {
        self.lru_order.pop_first().map(|(_, key)| key)
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let stored = self.entries.remove(key)?;
        self.lru_order.remove(&stored.last_access);
        self.current_size_bytes = self.current_size_bytes.saturating_sub(stored.size_bytes);
        self.sync_stats();
        Some(stored.entry)
    }

    fn sync_stats(&mut self) {
        self.stats.entries = self.entries.len();
        self.stats.size_bytes = self.current_size_bytes;
    }
}

impl MemoryTier {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            state: Arc::new(RwLock::new(MemoryState::default())),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Get a fresh entry, marking it most recently used
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.write().await;

        let expired = match state.entries.get(key) {
            Some(stored) => stored.entry.is_expired(),
            None => {
                state.stats.misses += 1;
                return None;
            }
        };

        if expired {
            debug!("Memory entry expired: {}", key);
            state.remove_entry(key);
            state.stats.misses += 1;
            state.stats.evictions_ttl += 1;
            return None;
        }

        state.touch(key);
        state.stats.hits += 1;
        state.entries.get(key).map(|stored| stored.entry.clone())
    }

    /// Insert an entry, evicting least recently used entries until it fits
    ///
    /// Returns `false` when the entry alone is larger than the ceiling and was
    /// not stored.
    pub async fn insert(&self, key: CacheKey, entry: CacheEntry) -> bool {
        let size_bytes = key.len() + entry.size_bytes();

        let mut state = self.state.write().await;

        if size_bytes > self.max_bytes {
            warn!(
                "Memory entry {} ({} bytes) exceeds tier ceiling of {} bytes; not cached",
                key, size_bytes, self.max_bytes
            );
            state.stats.failed_writes += 1;
            // an older value under the same key must not outlive the rejected write
            state.remove_entry(&key);
            return false;
        }

        // replacing frees the old size before eviction decisions
        state.remove_entry(&key);

        while state.current_size_bytes + size_bytes > self.max_bytes {
            let Some(victim) = state.pop_least_recent() else {
                break;
            };
            debug!("Evicting memory entry due to size limit: {}", victim);
            state.remove_entry(&victim);
            state.stats.evictions_size += 1;
        }

        let last_access = state.next_stamp();
        state.lru_order.insert(last_access, key.clone());
        state
            .entries
            .insert(key, StoredEntry { entry, size_bytes, last_access });
        state.current_size_bytes += size_bytes;
        state.sync_stats();
        true
    }

    pub async fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.write().await;
        state.remove_entry(key)
    }

    /// Remove every entry whose key starts with `prefix`
    pub async fn remove_by_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.write().await;
        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            state.remove_entry(key);
        }
        keys.len()
    }

    /// Eagerly drop all expired entries
    pub async fn purge_expired(&self) -> usize {
        let mut state = self.state.write().await;
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, stored)| stored.entry.is_expired())
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            state.remove_entry(key);
        }
        state.stats.evictions_ttl += expired.len() as u64;

        if !expired.is_empty() {
            debug!("Purged {} expired memory entries", expired.len());
        }
        expired.len()
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.lru_order.clear();
        state.current_size_bytes = 0;
        state.sync_stats();
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let state = self.state.read().await;
        state.entries.contains_key(key)
    }

    pub async fn stats(&self) -> TierStats {
        let state = self.state.read().await;
        state.stats.clone()
    }

    pub async fn size_bytes(&self) -> usize {
        let state = self.state.read().await;
        state.current_size_bytes
    }

    pub async fn len(&self) -> usize {
        let state = self.state.read().await;
        state.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        let state = self.state.read().await;
        state.entries.is_empty()
    }
}
