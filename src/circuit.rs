//! Per-endpoint circuit breaker
//!
//! Each endpoint key owns an independent record that moves along
//! CLOSED → OPEN → HALF_OPEN → CLOSED. An open circuit rejects calls without
//! invoking them until its retry deadline passes; the first attempt after
//! that probes the endpoint in HALF_OPEN. Only one probe runs at a time;
//! callers arriving meanwhile are rejected as if the circuit were open. A
//! failing probe reopens the circuit for twice the reset timeout.

use crate::error::{FetchError, Result};
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Circuit state for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the retry deadline
    Open,
    /// Probing whether the endpoint recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,

    /// Consecutive successes that close a half-open circuit
    pub success_threshold: u32,

    /// How long an opened circuit rejects calls
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.reset_timeout.is_zero() {
            return Err("reset_timeout must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Opens quickly and retries soon; suits interactive reads
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<u32>,
    success_threshold: Option<u32>,
    reset_timeout: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> CircuitBreakerConfig {
        let default = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(default.failure_threshold),
            success_threshold: self.success_threshold.unwrap_or(default.success_threshold),
            reset_timeout: self.reset_timeout.unwrap_or(default.reset_timeout),
        }
    }
}

/// Snapshot of one endpoint's breaker state
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitRecord {
    pub endpoint_key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<Instant>,
    pub next_retry_at: Option<Instant>,
    /// Set while a HALF_OPEN probe is running
    pub probe_started_at: Option<Instant>,
}

impl CircuitRecord {
    fn new(endpoint_key: &str) -> Self {
        Self {
            endpoint_key: endpoint_key.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            next_retry_at: None,
            probe_started_at: None,
        }
    }

    /// Time left before an open circuit admits a probe
    pub fn retry_after(&self) -> Option<Duration> {
        match self.state {
            CircuitState::Open => self
                .next_retry_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    fn open(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.state = CircuitState::Open;
        self.consecutive_successes = 0;
        self.opened_at = Some(now);
        self.next_retry_at = Some(now + timeout);
        self.probe_started_at = None;
    }

    /// A probe that outlived `abandon_after` no longer blocks the next one
    fn probe_in_flight(&self, abandon_after: Duration) -> bool {
        self.probe_started_at
            .map(|started| started.elapsed() < abandon_after)
            .unwrap_or(false)
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.opened_at = None;
        self.next_retry_at = None;
        self.probe_started_at = None;
    }
}

/// Per-endpoint circuit breaker
///
/// Cheap to clone; clones share records.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    records: Arc<Mutex<HashMap<String, CircuitRecord>>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            records: Arc::new(Mutex::new(HashMap::new())),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `call` through the endpoint's circuit
    ///
    /// An open circuit returns [`FetchError::CircuitOpen`] without invoking
    /// `call`. Otherwise the call's outcome drives the state machine and is
    /// returned as-is.
    pub async fn execute<T, F, Fut>(&self, endpoint: &str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let probe = self.admit(endpoint).await?;

        let result = call().await;
        match &result {
            Ok(_) => self.on_success(endpoint, probe).await,
            Err(e) => self.on_failure(endpoint, e).await,
        }
        result
    }

    /// Like [`execute`](Self::execute), but any error (including an open
    /// circuit) is handed to `fallback`, whose result is returned instead
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        endpoint: &str,
        call: F,
        fallback: FB,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(FetchError) -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        match self.execute(endpoint, call).await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Invoking fallback for {}: {}", endpoint, e);
                fallback(e).await
            }
        }
    }

    /// Forget an endpoint's record; it starts CLOSED on next use
    pub async fn reset(&self, endpoint: &str) {
        let previous = {
            let mut records = self.records.lock().await;
            records.remove(endpoint)
        };

        if let Some(record) = previous {
            info!("Circuit reset for {}", endpoint);
            if record.state != CircuitState::Closed {
                self.telemetry
                    .record_circuit_transition(endpoint, record.state, CircuitState::Closed);
            }
        }
    }

    pub async fn reset_all(&self) {
        let previous: Vec<CircuitRecord> = {
            let mut records = self.records.lock().await;
            records.drain().map(|(_, record)| record).collect()
        };

        info!("Reset {} circuits", previous.len());
        for record in previous {
            if record.state != CircuitState::Closed {
                self.telemetry.record_circuit_transition(
                    &record.endpoint_key,
                    record.state,
                    CircuitState::Closed,
                );
            }
        }
    }

    /// Current state; endpoints never seen are CLOSED
    pub async fn state(&self, endpoint: &str) -> CircuitState {
        let records = self.records.lock().await;
        records
            .get(endpoint)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub async fn record(&self, endpoint: &str) -> Option<CircuitRecord> {
        let records = self.records.lock().await;
        records.get(endpoint).cloned()
    }

    pub async fn records(&self) -> Vec<CircuitRecord> {
        let records = self.records.lock().await;
        let mut all: Vec<CircuitRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.endpoint_key.cmp(&b.endpoint_key));
        all
    }

    /// Reject while open; move to HALF_OPEN once the retry deadline passed
    ///
    /// Returns whether the admitted call is the HALF_OPEN probe.
    async fn admit(&self, endpoint: &str) -> Result<bool> {
        let abandon_after = self.config.reset_timeout;
        let transition = {
            let mut records = self.records.lock().await;
            let record = records
                .entry(endpoint.to_string())
                .or_insert_with(|| CircuitRecord::new(endpoint));

            let now = Instant::now();
            match record.state {
                CircuitState::Closed => return Ok(false),
                CircuitState::HalfOpen => {
                    if let Some(started) = record.probe_started_at {
                        if record.probe_in_flight(abandon_after) {
                            return Err(FetchError::CircuitOpen {
                                endpoint: endpoint.to_string(),
                                retry_after: abandon_after.saturating_sub(started.elapsed()),
                            });
                        }
                        warn!("Abandoned probe for {}, admitting another", endpoint);
                    }
                    record.probe_started_at = Some(now);
                    return Ok(true);
                }
                CircuitState::Open => match record.next_retry_at {
                    Some(at) if now < at => {
                        return Err(FetchError::CircuitOpen {
                            endpoint: endpoint.to_string(),
                            retry_after: at - now,
                        });
                    }
                    _ => {
                        record.state = CircuitState::HalfOpen;
                        record.consecutive_successes = 0;
                        record.probe_started_at = Some(now);
                        (CircuitState::Open, CircuitState::HalfOpen)
                    }
                },
            }
        };

        debug!("Circuit half-open for {}, probing", endpoint);
        self.telemetry
            .record_circuit_transition(endpoint, transition.0, transition.1);
        Ok(true)
    }

    async fn on_success(&self, endpoint: &str, probe: bool) {
        let transition = {
            let mut records = self.records.lock().await;
            let record = records
                .entry(endpoint.to_string())
                .or_insert_with(|| CircuitRecord::new(endpoint));

            match record.state {
                CircuitState::Closed => {
                    record.consecutive_failures = 0;
                    None
                }
                // a call admitted before the circuit opened proves nothing
                CircuitState::HalfOpen if !probe => None,
                CircuitState::HalfOpen => {
                    record.probe_started_at = None;
                    record.consecutive_successes += 1;
                    if record.consecutive_successes >= self.config.success_threshold {
                        record.close();
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                // a concurrent probe already reopened the circuit
                CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            info!("Circuit closed for {}", endpoint);
            self.telemetry.record_circuit_transition(endpoint, from, to);
        }
    }

    async fn on_failure(&self, endpoint: &str, error: &FetchError) {
        let transition = {
            let mut records = self.records.lock().await;
            let record = records
                .entry(endpoint.to_string())
                .or_insert_with(|| CircuitRecord::new(endpoint));

            record.consecutive_failures += 1;
            match record.state {
                CircuitState::Closed => {
                    record.consecutive_successes = 0;
                    if record.consecutive_failures >= self.config.failure_threshold {
                        record.open(self.config.reset_timeout);
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    record.open(self.config.reset_timeout * 2);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::Open => None,
            }
        };

        match transition {
            Some((from, to)) => {
                warn!("Circuit opened for {} after error: {}", endpoint, error);
                self.telemetry.record_circuit_transition(endpoint, from, to);
            }
            None => debug!("Call to {} failed: {}", endpoint, error),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemoryTelemetry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(failures: u32, successes: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(failures)
                .success_threshold(successes)
                .reset_timeout(Duration::from_millis(reset_ms))
                .build(),
        )
    }

    async fn fail(breaker: &CircuitBreaker, endpoint: &str) -> Result<u32> {
        breaker
            .execute(endpoint, || async { Err(FetchError::Network("refused".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, endpoint: &str) -> Result<u32> {
        breaker.execute(endpoint, || async { Ok(1u32) }).await
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());

        let bad = CircuitBreakerConfig::builder().failure_threshold(0).build();
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breaker = breaker(3, 2, 60_000);

        for _ in 0..3 {
            assert!(matches!(fail(&breaker, "/api/feed").await, Err(FetchError::Network(_))));
        }
        assert_eq!(breaker.state("/api/feed").await, CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result: Result<u32> = breaker
            .execute("/api/feed", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        match result {
            Err(FetchError::CircuitOpen { endpoint, retry_after }) => {
                assert_eq!(endpoint, "/api/feed");
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(59));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, 2, 60_000);

        fail(&breaker, "/x").await.unwrap_err();
        fail(&breaker, "/x").await.unwrap_err();
        succeed(&breaker, "/x").await.unwrap();
        fail(&breaker, "/x").await.unwrap_err();
        fail(&breaker, "/x").await.unwrap_err();

        assert_eq!(breaker.state("/x").await, CircuitState::Closed);
        assert_eq!(breaker.record("/x").await.unwrap().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_after_successes() {
        let breaker = breaker(1, 2, 50);

        fail(&breaker, "/x").await.unwrap_err();
        assert_eq!(breaker.state("/x").await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(70)).await;

        succeed(&breaker, "/x").await.unwrap();
        assert_eq!(breaker.state("/x").await, CircuitState::HalfOpen);

        succeed(&breaker, "/x").await.unwrap();
        let record = breaker.record("/x").await.unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.consecutive_successes, 0);
        assert!(record.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_half_open_failure_doubles_timeout() {
        let breaker = breaker(1, 2, 50);

        fail(&breaker, "/x").await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(70)).await;

        // the probe fails
        fail(&breaker, "/x").await.unwrap_err();
        let record = breaker.record("/x").await.unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert!(record.retry_after().unwrap() > Duration::from_millis(50));

        // still open after the original reset timeout
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(succeed(&breaker, "/x").await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_endpoints_are_independent() {
        let breaker = breaker(1, 1, 60_000);

        fail(&breaker, "/a").await.unwrap_err();
        assert_eq!(breaker.state("/a").await, CircuitState::Open);
        assert_eq!(breaker.state("/b").await, CircuitState::Closed);
        assert_eq!(succeed(&breaker, "/b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fallback_receives_open_and_call_errors() {
        let breaker = breaker(1, 1, 60_000);

        let first: Result<u32> = breaker
            .execute_with_fallback(
                "/x",
                || async { Err(FetchError::Http { status: 503, body: String::new() }) },
                |e| async move {
                    assert!(matches!(e, FetchError::Http { status: 503, .. }));
                    Ok(7)
                },
            )
            .await;
        assert_eq!(first.unwrap(), 7);

        let second: Result<u32> = breaker
            .execute_with_fallback(
                "/x",
                || async { Ok(1) },
                |e| async move {
                    assert!(e.is_circuit_open());
                    Err(e)
                },
            )
            .await;
        assert!(second.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_reset_and_transition_telemetry() {
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let breaker = breaker(1, 1, 60_000).with_telemetry(telemetry.clone());

        fail(&breaker, "/a").await.unwrap_err();
        fail(&breaker, "/b").await.unwrap_err();
        assert_eq!(breaker.records().await.len(), 2);

        breaker.reset("/a").await;
        assert_eq!(breaker.state("/a").await, CircuitState::Closed);
        assert_eq!(breaker.state("/b").await, CircuitState::Open);

        breaker.reset_all().await;
        assert!(breaker.records().await.is_empty());

        let transitions = telemetry.snapshot().transitions;
        assert_eq!(transitions.len(), 4);
        assert_eq!(transitions[0].from, CircuitState::Closed);
        assert_eq!(transitions[0].to, CircuitState::Open);
        assert_eq!(transitions[3].to, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_probe_stops_blocking_after_reset_timeout() {
        let breaker = breaker(1, 1, 50);
        fail(&breaker, "/x").await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(70)).await;

        let hung = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute("/x", || async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, FetchError>(1u32)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(succeed(&breaker, "/x").await.unwrap_err().is_circuit_open());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(succeed(&breaker, "/x").await.unwrap(), 1);
        assert_eq!(breaker.state("/x").await, CircuitState::Closed);
        hung.abort();
    }
}
