//! Two-tier cache with a stale-while-revalidate read path

use crate::cache::{
    config::CacheConfig,
    entry::CacheEntry,
    memory::MemoryTier,
    persistent::{PersistentStore, PersistentTier},
    stores::MemoryStore,
    types::{CacheStats, CacheTier},
};
use crate::error::Result;
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-call cache options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheOptions {
    /// Memory-tier TTL override
    pub memory_ttl: Option<Duration>,

    /// Persistent-tier TTL override
    pub disk_ttl: Option<Duration>,

    /// Neither read nor write the memory tier
    pub skip_memory: bool,

    /// Neither read nor write the persistent tier
    pub skip_disk: bool,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl = Some(ttl);
        self
    }

    pub fn disk_ttl(mut self, ttl: Duration) -> Self {
        self.disk_ttl = Some(ttl);
        self
    }

    /// Same TTL for both tiers
    pub fn ttl(self, ttl: Duration) -> Self {
        self.memory_ttl(ttl).disk_ttl(ttl)
    }

    pub fn skip_memory(mut self, skip: bool) -> Self {
        self.skip_memory = skip;
        self
    }

    pub fn skip_disk(mut self, skip: bool) -> Self {
        self.skip_disk = skip;
        self
    }
}

/// Result of an SWR fetch that may have been answered from the cache itself
///
/// A `Fallback` value is returned to the caller but never written back, so a
/// fallback cannot extend the lifetime of the entry it was read from.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    /// Produced by the origin
    Fresh(T),
    /// Served from an existing cache entry
    Fallback(T),
}

impl<T> Fetched<T> {
    pub fn into_inner(self) -> T {
        match self {
            Fetched::Fresh(value) | Fetched::Fallback(value) => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Fetched::Fallback(_))
    }

    /// Apply `f` to a fresh value; a fallback yields `Ok(None)`
    fn map_fresh<U, E>(
        self,
        f: impl FnOnce(T) -> std::result::Result<U, E>,
    ) -> std::result::Result<Option<U>, E> {
        match self {
            Fetched::Fresh(value) => f(value).map(Some),
            Fetched::Fallback(_) => Ok(None),
        }
    }
}

#[derive(Debug, Default)]
struct RevalidationCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Memory tier in front of a persistent tier
///
/// Cheap to clone; clones share both tiers.
#[derive(Clone)]
pub struct TieredCache {
    config: Arc<CacheConfig>,
    memory: MemoryTier,
    persistent: PersistentTier,
    telemetry: Arc<dyn TelemetrySink>,
    revalidation: Arc<RevalidationCounters>,
}

impl TieredCache {
    /// Create a cache whose persistent tier is backed by `store`
    pub fn new(config: CacheConfig, store: Arc<dyn PersistentStore>) -> Self {
        info!(
            "Initializing tiered cache (memory: {} bytes / {:?}, persistent: {} bytes / {:?})",
            config.memory_max_bytes, config.memory_ttl, config.disk_max_bytes, config.disk_ttl
        );

        let memory = MemoryTier::new(config.memory_max_bytes);
        let persistent = PersistentTier::new(store, config.disk_max_bytes, config.disk_eviction_fraction);

        Self {
            config: Arc::new(config),
            memory,
            persistent,
            telemetry: Arc::new(NoopTelemetry),
            revalidation: Arc::new(RevalidationCounters::default()),
        }
    }

    /// Create a cache whose persistent tier lives in process memory
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn persistent(&self) -> &PersistentTier {
        &self.persistent
    }

    /// Stale-while-revalidate read
    ///
    /// A fresh hit in either tier is returned immediately while `fetch_fn`
    /// refreshes the entry in the background. On a true miss `fetch_fn` is
    /// awaited, its value stored, and its error (if any) returned.
    pub async fn swr<T, F, Fut>(&self, key: &str, fetch_fn: F, opts: &CacheOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.swr_fetched(key, move || async move { fetch_fn().await.map(Fetched::Fresh) }, opts)
            .await
    }

    /// [`swr`](Self::swr) for a fetch that can itself fall back to the cache
    ///
    /// [`Fetched::Fallback`] values are returned but not stored, on a miss and
    /// on background revalidation alike.
    pub async fn swr_fetched<T, F, Fut>(&self, key: &str, fetch_fn: F, opts: &CacheOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fetched<T>>> + Send + 'static,
    {
        if let Some((entry, tier)) = self.lookup(key, opts).await {
            match entry.decode_value::<T>() {
                Ok(value) => {
                    debug!("SWR hit ({}): {}", tier, key);
                    self.spawn_revalidation(key, fetch_fn, opts);
                    return Ok(value);
                }
                Err(e) => {
                    warn!("Cached value for {} has unexpected shape ({}); refetching", key, e);
                }
            }
        }

        debug!("SWR miss: {}", key);
        let value = match fetch_fn().await? {
            Fetched::Fresh(value) => value,
            Fetched::Fallback(value) => {
                debug!("SWR miss answered by fallback, not stored: {}", key);
                return Ok(value);
            }
        };
        let json = serde_json::to_value(&value)?;
        self.store_value(key, json, opts).await;
        Ok(value)
    }

    /// Read a fresh value from the first tier that has it
    pub async fn get<T: DeserializeOwned>(&self, key: &str, opts: &CacheOptions) -> Option<T> {
        let (entry, _) = self.lookup(key, opts).await?;
        match entry.decode_value() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cached value for {} has unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Store a value in both tiers (respecting skip flags)
    ///
    /// Only serialization of `value` can fail; tier write failures are logged
    /// and swallowed.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, opts: &CacheOptions) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.store_value(key, value, opts).await;
        Ok(())
    }

    pub async fn remove(&self, key: &str) {
        self.memory.remove(key).await;
        self.persistent.remove(key).await;
        debug!("Removed cache entry: {}", key);
    }

    /// Remove every entry in both tiers whose key starts with `prefix`
    pub async fn remove_by_prefix(&self, prefix: &str) -> usize {
        let memory = self.memory.remove_by_prefix(prefix).await;
        let persistent = self.persistent.remove_by_prefix(prefix).await;
        info!(
            "Invalidated prefix {} ({} memory, {} persistent entries)",
            prefix, memory, persistent
        );
        memory + persistent
    }

    pub async fn clear(&self) {
        self.memory.clear().await;
        self.persistent.clear().await;
    }

    /// Eagerly drop expired memory entries; persistent entries expire lazily
    pub async fn purge_expired(&self) -> usize {
        self.memory.purge_expired().await
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            memory: self.memory.stats().await,
            persistent: self.persistent.stats().await,
            revalidations: self.revalidation.completed.load(Ordering::Relaxed),
            revalidation_failures: self.revalidation.failed.load(Ordering::Relaxed),
        }
    }

    pub async fn memory_size_bytes(&self) -> usize {
        self.memory.size_bytes().await
    }

    pub async fn persistent_size_bytes(&self) -> usize {
        self.persistent.size_bytes().await
    }

    async fn lookup(&self, key: &str, opts: &CacheOptions) -> Option<(CacheEntry, CacheTier)> {
        if !opts.skip_memory {
            let hit = self.memory.get(key).await;
            self.telemetry.record_cache_lookup(CacheTier::Memory, hit.is_some());
            if let Some(entry) = hit {
                return Some((entry, CacheTier::Memory));
            }
        }

        if !opts.skip_disk {
            let hit = self.persistent.get(key).await;
            self.telemetry
                .record_cache_lookup(CacheTier::Persistent, hit.is_some());
            if let Some(entry) = hit {
                if !opts.skip_memory {
                    self.promote(key, &entry, opts).await;
                }
                return Some((entry, CacheTier::Persistent));
            }
        }

        None
    }

    /// Copy a persistent entry into memory; it never outlives its source
    async fn promote(&self, key: &str, entry: &CacheEntry, opts: &CacheOptions) {
        let memory_ttl = opts.memory_ttl.unwrap_or(self.config.memory_ttl);
        let ttl = entry
            .time_until_expiration()
            .map(|left| left.min(memory_ttl))
            .unwrap_or(Duration::from_secs(0));

        debug!("Promoting persistent entry to memory: {}", key);
        self.memory
            .insert(key.to_string(), CacheEntry::new(entry.value.clone(), ttl))
            .await;
    }

    async fn store_value(&self, key: &str, value: serde_json::Value, opts: &CacheOptions) {
        if !opts.skip_memory {
            let ttl = opts.memory_ttl.unwrap_or(self.config.memory_ttl);
            self.memory
                .insert(key.to_string(), CacheEntry::new(value.clone(), ttl))
                .await;
        }

        if !opts.skip_disk {
            let ttl = opts.disk_ttl.unwrap_or(self.config.disk_ttl);
            if let Err(e) = self.persistent.set(key, &CacheEntry::new(value, ttl)).await {
                warn!("Persistent cache write dropped: {}", e);
            }
        }
    }

    fn spawn_revalidation<T, F, Fut>(&self, key: &str, fetch_fn: F, opts: &CacheOptions)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fetched<T>>> + Send + 'static,
    {
        if !self.config.background_revalidation {
            return;
        }

        let cache = self.clone();
        let key = key.to_string();
        let opts = opts.clone();

        tokio::spawn(async move {
            let refreshed = fetch_fn()
                .await
                .and_then(|fetched| Ok(fetched.map_fresh(serde_json::to_value)?));
            match refreshed {
                Ok(None) => {
                    cache.revalidation.failed.fetch_add(1, Ordering::Relaxed);
                    debug!("Revalidation of {} answered by fallback; entry left to expire", key);
                }
                Ok(Some(json)) => {
                    cache.store_value(&key, json, &opts).await;
                    cache.revalidation.completed.fetch_add(1, Ordering::Relaxed);
                    debug!("Revalidated cache entry: {}", key);
                }
                Err(e) => {
                    cache.revalidation.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Background revalidation failed for {}: {}", key, e);
                }
            }
        });
    }
}
