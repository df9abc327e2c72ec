//! # Tiered Response Cache
//!
//! Two bounded tiers sit in front of the network:
//!
//! - **Memory tier**: strict LRU under a byte ceiling, per-entry TTL
//! - **Persistent tier**: any [`PersistentStore`] under a byte ceiling, oldest-first
//!   eviction in passes, per-entry TTL
//! - **Stale-while-revalidate**: [`TieredCache::swr`] answers from whichever tier
//!   holds a fresh entry and refreshes it in the background
//! - **Deterministic keys**: [`CacheKeyBuilder`] derives one key per logical request,
//!   scoped to the principal for endpoints that return per-user data
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_fetch::cache::{CacheConfig, CacheOptions, TieredCache};
//! use std::time::Duration;
//!
//! # async fn example() -> ouroboros_fetch::Result<()> {
//! let config = CacheConfig::builder()
//!     .memory_ttl(Duration::from_secs(60))
//!     .memory_max_bytes(2 * 1024 * 1024)
//!     .build();
//!
//! let cache = TieredCache::in_memory(config);
//! cache.set("/api/feed|method:GET", &vec![1, 2, 3], &CacheOptions::default()).await?;
//!
//! if let Some(items) = cache.get::<Vec<u32>>("/api/feed|method:GET", &CacheOptions::default()).await {
//!     println!("Cache hit: {:?}", items);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod key;
pub mod memory;
pub mod persistent;
pub mod stores;
pub mod tiered;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::CacheEntry;
pub use key::{CacheKeyBuilder, EndpointClassifier, KeyRequest};
pub use memory::MemoryTier;
pub use persistent::{PersistentStore, PersistentTier};
pub use stores::{FileStore, MemoryStore};
pub use tiered::{CacheOptions, Fetched, TieredCache};
pub use types::{CacheKey, CacheStats, CacheTier, TierStats};
