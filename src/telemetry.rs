//! Telemetry emission
//!
//! The pipeline reports request durations, cache tier hits/misses and
//! circuit transitions to a [`TelemetrySink`]. Emission is fire-and-forget:
//! sinks must not block and nothing they do affects request outcomes.

use crate::cache::CacheTier;
use crate::circuit::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// How a request through the pipeline ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Success,
    Failure,
    /// Rejected by an open circuit without touching the network
    ShortCircuited,
}

/// Receiver of pipeline counters
pub trait TelemetrySink: Send + Sync {
    fn record_request(&self, _endpoint: &str, _duration: Duration, _outcome: RequestOutcome) {}

    fn record_cache_lookup(&self, _tier: CacheTier, _hit: bool) {}

    fn record_circuit_transition(&self, _endpoint: &str, _from: CircuitState, _to: CircuitState) {}
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}

/// Emits every event as a `tracing` debug record
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record_request(&self, endpoint: &str, duration: Duration, outcome: RequestOutcome) {
        debug!(
            target: "ouroboros_fetch::telemetry",
            endpoint,
            duration_ms = duration.as_millis() as u64,
            ?outcome,
            "request finished"
        );
    }

    fn record_cache_lookup(&self, tier: CacheTier, hit: bool) {
        debug!(target: "ouroboros_fetch::telemetry", %tier, hit, "cache lookup");
    }

    fn record_circuit_transition(&self, endpoint: &str, from: CircuitState, to: CircuitState) {
        debug!(
            target: "ouroboros_fetch::telemetry",
            endpoint,
            %from,
            %to,
            "circuit transition"
        );
    }
}

/// A recorded circuit state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub endpoint: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of [`InMemoryTelemetry`] counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub short_circuited: u64,
    pub total_duration_ms: u64,
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub persistent_hits: u64,
    pub persistent_misses: u64,
    pub transitions: Vec<TransitionEvent>,
}

impl TelemetrySnapshot {
    pub fn average_duration_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.requests as f64
        }
    }
}

/// Counts events in process, for dashboards and tests
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    short_circuited: AtomicU64,
    total_duration_ms: AtomicU64,
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    persistent_hits: AtomicU64,
    persistent_misses: AtomicU64,
    transitions: Mutex<Vec<TransitionEvent>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let transitions = self
            .transitions
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

        TelemetrySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            persistent_hits: self.persistent_hits.load(Ordering::Relaxed),
            persistent_misses: self.persistent_misses.load(Ordering::Relaxed),
            transitions,
        }
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn record_request(&self, _endpoint: &str, duration: Duration, outcome: RequestOutcome) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        let counter = match outcome {
            RequestOutcome::Success => &self.successes,
            RequestOutcome::Failure => &self.failures,
            RequestOutcome::ShortCircuited => &self.short_circuited,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_cache_lookup(&self, tier: CacheTier, hit: bool) {
        let counter = match (tier, hit) {
            (CacheTier::Memory, true) => &self.memory_hits,
            (CacheTier::Memory, false) => &self.memory_misses,
            (CacheTier::Persistent, true) => &self.persistent_hits,
            (CacheTier::Persistent, false) => &self.persistent_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_circuit_transition(&self, endpoint: &str, from: CircuitState, to: CircuitState) {
        let event = TransitionEvent {
            endpoint: endpoint.to_string(),
            from,
            to,
            at: Utc::now(),
        };
        match self.transitions.lock() {
            Ok(mut transitions) => transitions.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counts() {
        let telemetry = InMemoryTelemetry::new();
        telemetry.record_request("/api/feed", Duration::from_millis(10), RequestOutcome::Success);
        telemetry.record_request("/api/feed", Duration::from_millis(30), RequestOutcome::Failure);
        telemetry.record_request("/api/feed", Duration::from_millis(0), RequestOutcome::ShortCircuited);
        telemetry.record_cache_lookup(CacheTier::Memory, true);
        telemetry.record_cache_lookup(CacheTier::Persistent, false);
        telemetry.record_circuit_transition("/api/feed", CircuitState::Closed, CircuitState::Open);

        let snap = telemetry.snapshot();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.short_circuited, 1);
        assert_eq!(snap.total_duration_ms, 40);
        assert_eq!(snap.memory_hits, 1);
        assert_eq!(snap.persistent_misses, 1);
        assert_eq!(snap.transitions.len(), 1);
        assert_eq!(snap.transitions[0].to, CircuitState::Open);
        assert!((snap.average_duration_ms() - 40.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_noop_and_tracing_sinks_accept_events() {
        let sinks: Vec<Box<dyn TelemetrySink>> = vec![Box::new(NoopTelemetry), Box::new(TracingTelemetry)];
        for sink in sinks {
            sink.record_request("/x", Duration::from_millis(1), RequestOutcome::Success);
            sink.record_cache_lookup(CacheTier::Memory, false);
            sink.record_circuit_transition("/x", CircuitState::Open, CircuitState::HalfOpen);
        }
    }
}
