//! Cache entry format shared by both tiers

use crate::error::{FetchError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A cached value with the time it was stored and its time-to-live
///
/// This is also the on-disk format of the persistent tier: entries are
/// serialized as JSON `{"value": ..., "stored_at": ..., "ttl_ms": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached value
    pub value: Value,

    /// When the entry was stored
    pub stored_at: DateTime<Utc>,

    /// Time-to-live in milliseconds
    pub ttl_ms: u64,
}

impl CacheEntry {
    /// Create an entry stored now
    pub fn new(value: Value, ttl: Duration) -> Self {
        Self::stored_at(value, Utc::now(), ttl)
    }

    /// Create an entry with an explicit storage time
    pub fn stored_at(value: Value, stored_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            stored_at,
            ttl_ms: ttl.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    /// Serialize any value into an entry
    pub fn from_serializable<T: Serialize>(value: &T, ttl: Duration) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        Ok(Self::new(value, ttl))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Age of the entry relative to `now` (zero if `stored_at` is in the future)
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.stored_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    /// TTL is an exclusive upper bound: expired once `age > ttl`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) > self.ttl()
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self) -> Option<Duration> {
        self.ttl().checked_sub(self.age())
    }

    /// Deserialize the cached value
    pub fn decode_value<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone()).map_err(FetchError::from)
    }

    /// Serialize the whole entry for the persistent tier
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(FetchError::from)
    }

    /// Parse an entry previously written by [`CacheEntry::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(FetchError::from)
    }

    /// Serialized size in bytes, the unit both tiers budget in
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(0)
    }
}
