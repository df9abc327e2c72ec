//! Configuration for the tiered cache

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default memory-tier TTL: 5 minutes
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(300);

/// Default memory-tier byte ceiling: 5 MiB
pub const DEFAULT_MEMORY_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Default persistent-tier TTL: 1 hour
pub const DEFAULT_DISK_TTL: Duration = Duration::from_secs(3600);

/// Default persistent-tier byte ceiling: 15 MiB
pub const DEFAULT_DISK_MAX_BYTES: usize = 15 * 1024 * 1024;

/// Share of persistent entries dropped per eviction pass
pub const DEFAULT_DISK_EVICTION_FRACTION: f64 = 0.2;

/// Configuration for the two cache tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default time-to-live for memory-tier entries
    pub memory_ttl: Duration,

    /// Maximum total serialized size of the memory tier
    pub memory_max_bytes: usize,

    /// Default time-to-live for persistent-tier entries
    pub disk_ttl: Duration,

    /// Maximum total serialized size of the persistent tier
    pub disk_max_bytes: usize,

    /// Fraction (0.0 - 1.0] of the oldest persistent entries removed per eviction pass
    pub disk_eviction_fraction: f64,

    /// Refresh entries in the background when `swr` serves a cached value
    pub background_revalidation: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl: DEFAULT_MEMORY_TTL,
            memory_max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            disk_ttl: DEFAULT_DISK_TTL,
            disk_max_bytes: DEFAULT_DISK_MAX_BYTES,
            disk_eviction_fraction: DEFAULT_DISK_EVICTION_FRACTION,
            background_revalidation: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_max_bytes == 0 {
            return Err("memory_max_bytes must be greater than 0".to_string());
        }

        if self.disk_max_bytes == 0 {
            return Err("disk_max_bytes must be greater than 0".to_string());
        }

        if !(self.disk_eviction_fraction > 0.0 && self.disk_eviction_fraction <= 1.0) {
            return Err("disk_eviction_fraction must be in (0.0, 1.0]".to_string());
        }

        Ok(())
    }

    /// Configuration for memory-constrained clients
    pub fn small() -> Self {
        Self {
            memory_ttl: Duration::from_secs(120),
            memory_max_bytes: 1024 * 1024,
            disk_max_bytes: 5 * 1024 * 1024,
            ..Default::default()
        }
    }

    /// Configuration for data that rarely changes
    pub fn long_lived() -> Self {
        Self {
            memory_ttl: Duration::from_secs(30 * 60),
            disk_ttl: Duration::from_secs(24 * 3600),
            ..Default::default()
        }
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    memory_ttl: Option<Duration>,
    memory_max_bytes: Option<usize>,
    disk_ttl: Option<Duration>,
    disk_max_bytes: Option<usize>,
    disk_eviction_fraction: Option<f64>,
    background_revalidation: Option<bool>,
}

impl CacheConfigBuilder {
    pub fn memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl = Some(ttl);
        self
    }

    pub fn memory_max_bytes(mut self, max: usize) -> Self {
        self.memory_max_bytes = Some(max);
        self
    }

    pub fn disk_ttl(mut self, ttl: Duration) -> Self {
        self.disk_ttl = Some(ttl);
        self
    }

    pub fn disk_max_bytes(mut self, max: usize) -> Self {
        self.disk_max_bytes = Some(max);
        self
    }

    pub fn disk_eviction_fraction(mut self, fraction: f64) -> Self {
        self.disk_eviction_fraction = Some(fraction);
        self
    }

    /// Enable or disable refresh-on-hit in `swr`
    pub fn background_revalidation(mut self, enable: bool) -> Self {
        self.background_revalidation = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            memory_ttl: self.memory_ttl.unwrap_or(defaults.memory_ttl),
            memory_max_bytes: self.memory_max_bytes.unwrap_or(defaults.memory_max_bytes),
            disk_ttl: self.disk_ttl.unwrap_or(defaults.disk_ttl),
            disk_max_bytes: self.disk_max_bytes.unwrap_or(defaults.disk_max_bytes),
            disk_eviction_fraction: self
                .disk_eviction_fraction
                .unwrap_or(defaults.disk_eviction_fraction),
            background_revalidation: self
                .background_revalidation
                .unwrap_or(defaults.background_revalidation),
        }
    }
}
