//! # Ouroboros Fetch (ouroboros-fetch)
//!
//! Client-side request resilience and caching pipeline. Every outbound API
//! call goes through one [`ResilientFetcher`], which protects the backend from
//! overload and the caller from backend failures.
//!
//! ## Features
//!
//! - Per-endpoint circuit breaker (CLOSED / OPEN / HALF_OPEN)
//! - Two-tier cache (memory LRU + persistent store) with stale-while-revalidate reads
//! - In-flight request deduplication with per-request timeouts
//! - Priority-ordered batch dispatch
//! - Principal-scoped cache keys for per-user endpoints
//! - Pluggable transport, persistent store and telemetry sink
//!
//! ## Reading through the pipeline
//!
//! ```no_run
//! use ouroboros_fetch::{FetchConfig, RequestOptions, ResilientFetcher, Transport};
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn Transport>) -> anyhow::Result<()> {
//! let fetcher = ResilientFetcher::builder()
//!     .config(FetchConfig::from_env()?)
//!     .transport(transport)
//!     .auth_token("token")
//!     .build()?;
//!
//! // served from cache when fresh, refreshed in the background
//! let feed: serde_json::Value = fetcher.request("/api/feed", RequestOptions::get()).await?;
//! println!("Feed: {}", feed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Mutations
//!
//! Mutations bypass the cache and deduplication; invalidate related reads afterwards.
//!
//! ```no_run
//! use ouroboros_fetch::{RequestOptions, ResilientFetcher};
//!
//! # async fn example(fetcher: ResilientFetcher) -> anyhow::Result<()> {
//! let options = RequestOptions::post().json(&serde_json::json!({"text": "hello"}))?;
//! let _: serde_json::Value = fetcher.request("/api/posts", options).await?;
//! fetcher.invalidate_prefix("/api/feed").await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error handling
//!
//! ```no_run
//! use ouroboros_fetch::{ErrorKind, RequestOptions, ResilientFetcher};
//!
//! # async fn example(fetcher: ResilientFetcher) {
//! match fetcher.request_value("/api/feed", RequestOptions::get()).await {
//!     Ok(feed) => println!("{}", feed),
//!     Err(e) if e.kind() == ErrorKind::ServiceUnavailable => {
//!         println!("Backend unavailable, retry in {:?}", e.retry_after());
//!     }
//!     Err(e) => println!("Request failed: {}", e),
//! }
//! # }
//! ```

pub mod cache;
pub mod circuit;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod scheduler;
pub mod telemetry;
pub mod transport;

pub use cache::{
    CacheConfig, CacheKeyBuilder, CacheOptions, CacheStats, EndpointClassifier, Fetched,
    FileStore, KeyRequest, MemoryStore, PersistentStore, TieredCache,
};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitRecord, CircuitState};
pub use config::FetchConfig;
pub use error::{ErrorKind, FetchError, Result};
pub use orchestrator::{RequestOptions, ResilientFetcher, ResilientFetcherBuilder};
pub use scheduler::{BatchRequest, Priority, RequestScheduler, SchedulerConfig, SchedulerStats};
pub use telemetry::{InMemoryTelemetry, NoopTelemetry, RequestOutcome, TelemetrySink, TracingTelemetry};
pub use transport::{Headers, HttpMethod, Transport, TransportRequest, TransportResponse};

#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
