//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache key type - produced by [`crate::cache::CacheKeyBuilder`]
pub type CacheKey = String;

/// Storage tier identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheTier {
    /// Bounded in-process LRU tier
    Memory,

    /// Bounded persistent tier behind a [`crate::cache::PersistentStore`]
    Persistent,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Memory => write!(f, "memory"),
            CacheTier::Persistent => write!(f, "persistent"),
        }
    }
}

/// Per-tier statistics for cache performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TierStats {
    /// Total number of fresh hits
    pub hits: u64,

    /// Total number of misses (missing or expired)
    pub misses: u64,

    /// Number of entries currently stored
    pub entries: usize,

    /// Total serialized size of stored entries in bytes
    pub size_bytes: usize,

    /// Number of evictions due to the byte ceiling
    pub evictions_size: u64,

    /// Number of expired entries purged
    pub evictions_ttl: u64,

    /// Number of writes that failed and were dropped
    pub failed_writes: u64,
}

impl TierStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_ttl
    }
}

/// Statistics for both tiers
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    pub memory: TierStats,
    pub persistent: TierStats,

    /// Background revalidations that completed and refreshed an entry
    pub revalidations: u64,

    /// Background revalidations that failed and were discarded
    pub revalidation_failures: u64,
}

impl CacheStats {
    /// Combined hit rate: a request is a hit if either tier served it
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory.hits + self.persistent.hits;
        // every persistent lookup follows a memory miss unless skip_memory was set
        let total = hits + self.persistent.misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ memory: {} hits / {} misses ({} bytes), persistent: {} hits / {} misses ({} bytes), revalidations: {} }}",
            self.memory.hits,
            self.memory.misses,
            self.memory.size_bytes,
            self.persistent.hits,
            self.persistent.misses,
            self.persistent.size_bytes,
            self.revalidations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_stats_hit_rate() {
        let stats = TierStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 80.0);
        assert_eq!(TierStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_combined_hit_rate() {
        let stats = CacheStats {
            memory: TierStats {
                hits: 6,
                misses: 4,
                ..Default::default()
            },
            persistent: TierStats {
                hits: 2,
                misses: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 80.0);
    }

    #[test]
    fn test_cache_stats_display() {
        let mut stats = CacheStats::default();
        stats.memory.hits = 100;
        stats.persistent.misses = 50;

        let display = format!("{}", stats);
        assert!(display.contains("memory: 100 hits"));
        assert!(display.contains("50 misses"));
    }

    #[test]
    fn test_cache_tier_display() {
        assert_eq!(CacheTier::Memory.to_string(), "memory");
        assert_eq!(CacheTier::Persistent.to_string(), "persistent");
    }
}
