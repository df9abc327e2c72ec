//! In-flight request deduplication with per-request timeouts
//!
//! The first caller for a key starts the network call as its own task; every
//! caller arriving while it is pending awaits the same shared result. The
//! in-flight entry is removed when the call settles, whether it succeeded,
//! failed or timed out.

use crate::error::{FetchError, Result};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default deadline for a deduplicated call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatch priority; only orders requests submitted together in a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Deadline after which waiting callers receive `RequestTimeout`
    pub request_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Calls actually started
    pub started: u64,
    /// Callers that joined an in-flight call instead of starting one
    pub deduplicated: u64,
    pub timed_out: u64,
    pub in_flight: usize,
}

/// Public view of a pending call
#[derive(Debug, Clone)]
pub struct InFlightInfo {
    pub key: String,
    pub priority: Priority,
    pub started_at: Instant,
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

struct InFlightRequest<T: Clone> {
    key: String,
    result: SharedResult<T>,
    started_at: Instant,
    priority: Priority,
    /// Distinguishes this call from a later one under the same key
    generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    deduplicated: AtomicU64,
    timed_out: AtomicU64,
}

/// One entry of a [`RequestScheduler::run_batch`] call
pub struct BatchRequest<T> {
    pub key: String,
    pub priority: Priority,
    call: Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>,
}

impl<T> BatchRequest<T> {
    pub fn new<F, Fut>(key: impl Into<String>, priority: Priority, call: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            key: key.into(),
            priority,
            call: Box::new(move || call().boxed()),
        }
    }
}

/// Deduplicating request scheduler
#[derive(Clone)]
pub struct RequestScheduler<T: Clone> {
    config: Arc<SchedulerConfig>,
    in_flight: Arc<Mutex<HashMap<String, InFlightRequest<T>>>>,
    next_generation: Arc<AtomicU64>,
    counters: Arc<Counters>,
}

impl<T> RequestScheduler<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config: Arc::new(config),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run `call` unless a call for `key` is already pending, in which case
    /// its result is shared
    pub async fn deduplicate<F, Fut>(&self, key: &str, priority: Priority, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.dispatch(key, priority, call).await.await
    }

    /// Dispatch in priority order (stable within a priority), then wait for
    /// all; results come back in submission order
    pub async fn run_batch(&self, requests: Vec<BatchRequest<T>>) -> Vec<Result<T>> {
        let mut ordered: Vec<(usize, BatchRequest<T>)> = requests.into_iter().enumerate().collect();
        ordered.sort_by_key(|(_, request)| Reverse(request.priority));

        let mut pending = Vec::with_capacity(ordered.len());
        for (index, request) in ordered {
            let BatchRequest { key, priority, call } = request;
            let result = self.dispatch(&key, priority, call).await;
            pending.push((index, result));
        }

        let (indices, futures): (Vec<usize>, Vec<SharedResult<T>>) = pending.into_iter().unzip();
        let mut results: Vec<(usize, Result<T>)> =
            indices.into_iter().zip(join_all(futures).await).collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().await.contains_key(key)
    }

    pub async fn in_flight_keys(&self) -> Vec<String> {
        let in_flight = self.in_flight.lock().await;
        let mut keys: Vec<String> = in_flight.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn in_flight(&self) -> Vec<InFlightInfo> {
        let in_flight = self.in_flight.lock().await;
        let mut pending: Vec<InFlightInfo> = in_flight
            .values()
            .map(|request| InFlightInfo {
                key: request.key.clone(),
                priority: request.priority,
                started_at: request.started_at,
            })
            .collect();
        pending.sort_by_key(|info| info.started_at);
        pending
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            started: self.counters.started.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            in_flight: self.in_flight_count().await,
        }
    }

    /// Join or start the call for `key`; lookup and insert share one critical section
    async fn dispatch<F, Fut>(&self, key: &str, priority: Priority, call: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock().await;

        if let Some(existing) = in_flight.get(key) {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!("Joining in-flight request: {}", key);
            return existing.result.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.request_timeout;
        let task = tokio::spawn(call());

        let map = self.in_flight.clone();
        let counters = self.counters.clone();
        let owned_key = key.to_string();
        let driver = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(FetchError::Other(format!("request task failed: {}", e))),
                Err(_) => {
                    // the call keeps running detached; its result is dropped
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!("Request timed out after {:?}: {}", timeout, owned_key);
                    Err(FetchError::RequestTimeout {
                        key: owned_key.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            };

            let mut in_flight = map.lock().await;
            if in_flight.get(&owned_key).map(|r| r.generation) == Some(generation) {
                in_flight.remove(&owned_key);
            }
            result
        });

        let result: SharedResult<T> = async move {
            match driver.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Other(format!("request driver failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        self.counters.started.fetch_add(1, Ordering::Relaxed);
        debug!("Dispatched request: {} ({:?})", key, priority);
        in_flight.insert(
            key.to_string(),
            InFlightRequest {
                key: key.to_string(),
                result: result.clone(),
                started_at: Instant::now(),
                priority,
                generation,
            },
        );
        result
    }
}

impl<T> Default for RequestScheduler<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
