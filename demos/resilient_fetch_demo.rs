//! Resilient Fetch Demo
//!
//! Walks through the pipeline against an in-process flaky backend:
//! deduplicated reads, cache hits, a tripped circuit served from cache,
//! and recovery.
//!
//! Usage:
//!   cargo run --example resilient_fetch_demo
//!
//! Environment variables (see `FetchConfig::from_env`):
//!   OUROBOROS_FETCH_FAILURE_THRESHOLD - failures before a circuit opens
//!   OUROBOROS_FETCH_RESET_TIMEOUT_MS  - how long an open circuit rejects calls
//!   RUST_LOG                          - log filter (default: info)

use async_trait::async_trait;
use ouroboros_fetch::{
    CacheOptions, EndpointClassifier, FetchConfig, FetchError, InMemoryTelemetry, RequestOptions,
    ResilientFetcher, Result, Transport, TransportRequest, TransportResponse,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Backend stand-in that can be switched off
#[derive(Default)]
struct FlakyBackend {
    down: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for FlakyBackend {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(40)).await;

        if self.down.load(Ordering::SeqCst) {
            return Err(FetchError::Network("connection refused".to_string()));
        }

        let body = serde_json::json!({
            "path": request.url,
            "served_by_call": n,
            "items": ["hello", "world"],
        });
        Ok(TransportResponse::new(200, body.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("=== Resilient Fetch Demo ===");

    let mut config = FetchConfig::from_env()?;
    config.base_url = "https://backend.local".to_string();
    config.circuit.failure_threshold = 3;
    config.circuit.reset_timeout = Duration::from_millis(500);

    let backend = Arc::new(FlakyBackend::default());
    let telemetry = Arc::new(InMemoryTelemetry::new());
    let fetcher = ResilientFetcher::builder()
        .config(config)
        .transport(backend.clone())
        .telemetry(telemetry.clone())
        .classifier(EndpointClassifier::new().public("/api/trending"))
        .principal("user-42")
        .build()?;

    info!("\n--- Concurrent identical reads ---");
    let (a, b, c) = tokio::join!(
        fetcher.request_value("/api/feed", RequestOptions::get()),
        fetcher.request_value("/api/feed", RequestOptions::get()),
        fetcher.request_value("/api/feed", RequestOptions::get()),
    );
    info!("Three callers, {} backend call(s)", backend.calls.load(Ordering::SeqCst));
    info!("All equal: {}", a? == b? && c.is_ok());

    info!("\n--- Cached read ---");
    let cached = fetcher.request_value("/api/feed", RequestOptions::get()).await?;
    info!("Served from cache: {}", cached["served_by_call"]);

    info!("\n--- Backend goes down ---");
    backend.down.store(true, Ordering::SeqCst);
    let refresh = || RequestOptions::get().cache(CacheOptions::new().skip_memory(true).skip_disk(true));
    for attempt in 1..=3 {
        match fetcher.request_value("/api/feed", refresh()).await {
            Ok(_) => info!("Attempt {}: ok", attempt),
            Err(e) => info!("Attempt {}: {}", attempt, e),
        }
    }
    info!("Circuit state: {}", fetcher.circuit_state("/api/feed").await);

    match fetcher.request_value("/api/feed", refresh()).await {
        Ok(value) => info!("Open circuit answered from cache: {}", value["served_by_call"]),
        Err(e) => info!("Open circuit with cold cache: {}", e),
    }

    match fetcher.request_value("/api/trending", RequestOptions::get()).await {
        Ok(_) => info!("Trending unexpectedly succeeded"),
        Err(e) => info!("Trending (cold cache, separate circuit): {} [{:?}]", e, e.kind()),
    }

    info!("\n--- Recovery ---");
    backend.down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(600)).await;
    for _ in 0..2 {
        fetcher.request_value("/api/feed", RequestOptions::get().no_cache(true)).await?;
    }
    info!("Circuit state: {}", fetcher.circuit_state("/api/feed").await);

    info!("\n--- Stats ---");
    info!("{}", fetcher.cache().stats().await);
    let snapshot = telemetry.snapshot();
    info!(
        "Requests: {} ({} ok, {} failed, {} short-circuited), avg {:.1}ms",
        snapshot.requests,
        snapshot.successes,
        snapshot.failures,
        snapshot.short_circuited,
        snapshot.average_duration_ms()
    );
    for transition in &snapshot.transitions {
        info!("  {}: {} -> {}", transition.endpoint, transition.from, transition.to);
    }

    info!("\n=== Demo Complete ===");
    Ok(())
}
