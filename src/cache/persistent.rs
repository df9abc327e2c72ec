//! Persistent tier: a byte-bounded cache over any key-value [`PersistentStore`]
//!
//! Writes that would push the tier over its ceiling first delete the oldest
//! share of entries (by `stored_at`), repeating until the new entry fits. A
//! store failure that survives one more eviction pass is reported as
//! [`FetchError::CacheWrite`]; callers treat it as best-effort and swallow it.

use crate::cache::{
    entry::CacheEntry,
    types::{CacheKey, TierStats},
};
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Minimal key-value storage boundary for the persistent tier
///
/// Any store offering these four operations (embedded KV store, file-backed
/// store, browser storage bridge) can back the tier.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    stored_at: DateTime<Utc>,
    size_bytes: usize,
}

/// In-process view of what the store holds, loaded on first use
#[derive(Default)]
struct PersistentIndex {
    entries: HashMap<CacheKey, IndexEntry>,
    total_bytes: usize,
}

impl PersistentIndex {
    fn insert(&mut self, key: CacheKey, entry: IndexEntry) {
        if let Some(old) = self.entries.insert(key, entry) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
        self.total_bytes += entry.size_bytes;
    }

    fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        let old = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        Some(old)
    }
}

struct TierState {
    index: Option<PersistentIndex>,
    stats: TierStats,
}

/// Byte-bounded persistent tier
#[derive(Clone)]
pub struct PersistentTier {
    store: Arc<dyn PersistentStore>,
    max_bytes: usize,
    eviction_fraction: f64,
    state: Arc<Mutex<TierState>>,
}

impl PersistentTier {
    pub fn new(store: Arc<dyn PersistentStore>, max_bytes: usize, eviction_fraction: f64) -> Self {
        Self {
            store,
            max_bytes,
            eviction_fraction,
            state: Arc::new(Mutex::new(TierState {
                index: None,
                stats: TierStats::default(),
            })),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Get a fresh entry; expired or unreadable entries are deleted on encounter
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock().await;
        self.ensure_index(&mut state).await;

        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                Self::index_mut(&mut state).remove(key);
                state.stats.misses += 1;
                self.sync_stats(&mut state);
                return None;
            }
            Err(e) => {
                warn!("Persistent read failed for {}: {}", key, e);
                state.stats.misses += 1;
                return None;
            }
        };

        let entry = match CacheEntry::from_bytes(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping unreadable persistent entry {}: {}", key, e);
                self.delete(&mut state, key).await;
                state.stats.misses += 1;
                return None;
            }
        };

        if entry.is_expired() {
            debug!("Persistent entry expired: {}", key);
            self.delete(&mut state, key).await;
            state.stats.misses += 1;
            state.stats.evictions_ttl += 1;
            return None;
        }

        let index = Self::index_mut(&mut state);
        if !index.entries.contains_key(key) {
            index.insert(
                key.to_string(),
                IndexEntry {
                    stored_at: entry.stored_at,
                    size_bytes: key.len() + bytes.len(),
                },
            );
            self.sync_stats(&mut state);
        }

        state.stats.hits += 1;
        Some(entry)
    }

    /// Write an entry, evicting the oldest entries first when over the ceiling
    pub async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let bytes = entry.to_bytes()?;
        let size_bytes = key.len() + bytes.len();

        let mut state = self.state.lock().await;
        self.ensure_index(&mut state).await;

        if size_bytes > self.max_bytes {
            // the previous value must not outlive a rejected overwrite
            self.delete(&mut state, key).await;
            state.stats.failed_writes += 1;
            return Err(FetchError::CacheWrite(format!(
                "entry {} ({} bytes) exceeds persistent ceiling of {} bytes",
                key, size_bytes, self.max_bytes
            )));
        }

        self.make_room(&mut state, key, size_bytes).await;

        let write = match self.store.set(key, bytes.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("Persistent write failed for {} ({}); evicting and retrying", key, first);
                self.evict_pass(&mut state, key).await;
                self.store.set(key, bytes).await
            }
        };

        match write {
            Ok(()) => {
                Self::index_mut(&mut state).insert(
                    key.to_string(),
                    IndexEntry {
                        stored_at: entry.stored_at,
                        size_bytes,
                    },
                );
                self.sync_stats(&mut state);
                Ok(())
            }
            Err(e) => {
                state.stats.failed_writes += 1;
                Err(FetchError::CacheWrite(format!("{}: {}", key, e)))
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        let mut state = self.state.lock().await;
        self.ensure_index(&mut state).await;
        self.delete(&mut state, key).await;
    }

    /// Remove every entry whose key starts with `prefix`
    pub async fn remove_by_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock().await;
        self.ensure_index(&mut state).await;

        let keys: Vec<CacheKey> = Self::index_mut(&mut state)
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            self.delete(&mut state, key).await;
        }
        keys.len()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        self.ensure_index(&mut state).await;

        let keys: Vec<CacheKey> = Self::index_mut(&mut state).entries.keys().cloned().collect();
        for key in &keys {
            self.delete(&mut state, key).await;
        }
        info!("Cleared {} persistent entries", keys.len());
    }

    pub async fn size_bytes(&self) -> usize {
        let mut state = self.state.lock().await;
        self.ensure_index(&mut state).await;
        Self::index_mut(&mut state).total_bytes
    }

    pub async fn len(&self) -> usize {
        let mut state = self.state.lock().await;
        self.ensure_index(&mut state).await;
        Self::index_mut(&mut state).entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> TierStats {
        let state = self.state.lock().await;
        state.stats.clone()
    }

    /// Evict oldest-first passes until `size_bytes` more fits under the ceiling
    async fn make_room(&self, state: &mut TierState, key: &str, size_bytes: usize) {
        loop {
            let index = Self::index_mut(state);
            let replaced = index.entries.get(key).map(|e| e.size_bytes).unwrap_or(0);
            let projected = index.total_bytes - replaced + size_bytes;
            if projected <= self.max_bytes {
                return;
            }
            if self.evict_pass(state, key).await == 0 {
                return;
            }
        }
    }

    /// Delete the oldest `eviction_fraction` of entries (at least one), never `keep`
    async fn evict_pass(&self, state: &mut TierState, keep: &str) -> usize {
        let index = Self::index_mut(state);
        let mut candidates: Vec<(CacheKey, DateTime<Utc>)> = index
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != keep)
            .map(|(k, e)| (k.clone(), e.stored_at))
            .collect();

        if candidates.is_empty() {
            return 0;
        }

        candidates.sort_by(|a, b| a.1.cmp(&b.1));
        let count = ((candidates.len() as f64 * self.eviction_fraction).ceil() as usize)
            .clamp(1, candidates.len());

        for (key, _) in candidates.iter().take(count) {
            self.delete(state, key).await;
            state.stats.evictions_size += 1;
        }

        debug!(
            "Evicted {} oldest persistent entries ({} bytes remain)",
            count,
            Self::index_mut(state).total_bytes
        );
        count
    }

    async fn delete(&self, state: &mut TierState, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            warn!("Persistent remove failed for {}: {}", key, e);
        }
        Self::index_mut(state).remove(key);
        self.sync_stats(state);
    }

    /// Build the index from the store the first time the tier is touched
    async fn ensure_index(&self, state: &mut TierState) {
        if state.index.is_some() {
            return;
        }

        let mut index = PersistentIndex::default();
        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Could not list persistent store keys: {}", e);
                Vec::new()
            }
        };

        let mut dropped = 0;
        let mut unreadable = 0;
        for key in keys {
            let entry = match self.store.get(&key).await {
                Ok(Some(bytes)) => CacheEntry::from_bytes(&bytes).ok().map(|e| (e, bytes.len())),
                Ok(None) => None,
                Err(e) => {
                    // left in place; a later successful read indexes it
                    warn!("Skipping persistent entry {} while loading index: {}", key, e);
                    unreadable += 1;
                    continue;
                }
            };

            match entry {
                Some((entry, len)) if !entry.is_expired() => {
                    index.insert(
                        key.clone(),
                        IndexEntry {
                            stored_at: entry.stored_at,
                            size_bytes: key.len() + len,
                        },
                    );
                }
                _ => {
                    if let Err(e) = self.store.remove(&key).await {
                        warn!("Persistent remove failed for {}: {}", key, e);
                    }
                    dropped += 1;
                }
            }
        }

        info!(
            "Loaded persistent cache index: {} entries, {} bytes ({} stale dropped, {} skipped)",
            index.entries.len(),
            index.total_bytes,
            dropped,
            unreadable
        );
        state.index = Some(index);
        self.sync_stats(state);
    }

    fn index_mut(state: &mut TierState) -> &mut PersistentIndex {
        state.index.get_or_insert_with(PersistentIndex::default)
    }

    fn sync_stats(&self, state: &mut TierState) {
        let (entries, total) = {
            let index = Self::index_mut(state);
            (index.entries.len(), index.total_bytes)
        };
        state.stats.entries = entries;
        state.stats.size_bytes = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::stores::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn tier(max_bytes: usize) -> (PersistentTier, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (PersistentTier::new(store.clone(), max_bytes, 0.2), store)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (tier, _) = tier(1024 * 1024);
        let entry = CacheEntry::new(json!({"items": [1]}), Duration::from_secs(60));

        tier.set("k", &entry).await.unwrap();
        let got = tier.get("k").await.unwrap();
        assert_eq!(got.value, json!({"items": [1]}));
        assert_eq!(tier.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_purged_on_read() {
        let (tier, store) = tier(1024 * 1024);
        let entry = CacheEntry::new(json!(1), Duration::from_millis(50));
        tier.set("k", &entry).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(tier.get("k").await.is_none());
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(tier.stats().await.evictions_ttl, 1);
        assert_eq!(tier.size_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_oldest_evicted_first() {
        let probe = CacheEntry::new(json!("x".repeat(100)), Duration::from_secs(60));
        let per_entry = "key-0".len() + probe.size_bytes() + 16;
        let (tier, _) = tier(per_entry * 5);

        for i in 0..5 {
            let entry = CacheEntry::new(json!("x".repeat(100)), Duration::from_secs(60));
            tier.set(&format!("key-{}", i), &entry).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let entry = CacheEntry::new(json!("x".repeat(100)), Duration::from_secs(60));
        tier.set("key-5", &entry).await.unwrap();

        assert!(tier.get("key-0").await.is_none());
        assert!(tier.get("key-5").await.is_some());
        assert!(tier.size_bytes().await <= tier.max_bytes());
    }

    #[tokio::test]
    async fn test_oversized_entry_is_cache_write_error() {
        let (tier, _) = tier(100);
        let entry = CacheEntry::new(json!("x".repeat(500)), Duration::from_secs(60));

        let result = tier.set("big", &entry).await;
        assert!(matches!(result, Err(FetchError::CacheWrite(_))));
        assert!(tier.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_failure_reported_after_retry() {
        let store = Arc::new(MemoryStore::with_quota(10));
        let tier = PersistentTier::new(store, 1024 * 1024, 0.2);
        let entry = CacheEntry::new(json!("value"), Duration::from_secs(60));

        let result = tier.set("k", &entry).await;
        assert!(matches!(result, Err(FetchError::CacheWrite(_))));
        assert_eq!(tier.stats().await.failed_writes, 1);
        assert!(tier.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_index_loaded_from_existing_store() {
        let store = Arc::new(MemoryStore::new());
        let fresh = CacheEntry::new(json!("fresh"), Duration::from_secs(60));
        let stale = CacheEntry::stored_at(
            json!("stale"),
            Utc::now() - chrono::Duration::seconds(120),
            Duration::from_secs(60),
        );
        store.set("fresh", fresh.to_bytes().unwrap()).await.unwrap();
        store.set("stale", stale.to_bytes().unwrap()).await.unwrap();
        store.set("garbage", b"not json".to_vec()).await.unwrap();

        let tier = PersistentTier::new(store.clone(), 1024 * 1024, 0.2);
        assert_eq!(tier.len().await, 1);
        assert_eq!(store.keys().await.unwrap(), vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_by_prefix() {
        let (tier, _) = tier(1024 * 1024);
        let entry = CacheEntry::new(json!(1), Duration::from_secs(60));
        tier.set("/api/posts/1", &entry).await.unwrap();
        tier.set("/api/posts/2", &entry).await.unwrap();
        tier.set("/api/feed", &entry).await.unwrap();

        assert_eq!(tier.remove_by_prefix("/api/posts").await, 2);
        assert_eq!(tier.len().await, 1);

        tier.clear().await;
        assert!(tier.is_empty().await);
    }

    /// Store whose reads fail while `failing` is set
    struct FlakyReads {
        inner: MemoryStore,
        failing: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl PersistentStore for FlakyReads {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(FetchError::Other("transient read failure".into()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
            self.inner.set(key, bytes).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn test_read_failure_during_index_load_keeps_entry() {
        let store = Arc::new(FlakyReads {
            inner: MemoryStore::new(),
            failing: std::sync::atomic::AtomicBool::new(true),
        });
        let entry = CacheEntry::new(json!("kept"), Duration::from_secs(60));
        store.inner.set("k", entry.to_bytes().unwrap()).await.unwrap();

        let tier = PersistentTier::new(store.clone(), 1024 * 1024, 0.2);
        assert_eq!(tier.len().await, 0);
        assert_eq!(store.keys().await.unwrap(), vec!["k".to_string()]);

        store.failing.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(tier.get("k").await.unwrap().value, json!("kept"));
        assert_eq!(tier.len().await, 1);
        assert!(tier.size_bytes().await > 0);
    }
}
