//! Integration tests for the circuit breaker
//!
//! Covers the full CLOSED → OPEN → HALF_OPEN → CLOSED cycle, fallback
//! behavior while open, and concurrent use of one breaker.

use ouroboros_fetch::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, FetchError, InMemoryTelemetry, Result,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn breaker(reset_ms: u64) -> CircuitBreaker {
    CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .reset_timeout(Duration::from_millis(reset_ms))
            .build(),
    )
}

#[tokio::test]
async fn test_open_circuit_served_by_fallback() {
    let breaker = breaker(60_000);
    let calls = AtomicUsize::new(0);
    let cached = json!({"items": [1, 2, 3]});

    for _ in 0..5 {
        let result: Result<Value> = breaker
            .execute("/api/feed", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Network("connection refused".into()))
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state("/api/feed").await, CircuitState::Open);

    let value = breaker
        .execute_with_fallback(
            "/api/feed",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            },
            |e| {
                let cached = cached.clone();
                async move {
                    assert!(e.is_circuit_open());
                    Ok(cached)
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(value, json!({"items": [1, 2, 3]}));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_full_recovery_cycle() {
    let telemetry = Arc::new(InMemoryTelemetry::new());
    let breaker = breaker(80).with_telemetry(telemetry.clone());

    for _ in 0..5 {
        let _: Result<()> = breaker
            .execute("/api/feed", || async { Err(FetchError::Http { status: 503, body: String::new() }) })
            .await;
    }
    assert_eq!(breaker.state("/api/feed").await, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(100)).await;

    for _ in 0..2 {
        breaker
            .execute("/api/feed", || async { Ok::<_, FetchError>(()) })
            .await
            .unwrap();
    }
    assert_eq!(breaker.state("/api/feed").await, CircuitState::Closed);

    let states: Vec<(CircuitState, CircuitState)> = telemetry
        .snapshot()
        .transitions
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        states,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn test_failed_probe_blocks_further_calls() {
    let breaker = breaker(50);

    for _ in 0..5 {
        let _: Result<()> = breaker
            .execute("/x", || async { Err(FetchError::Network("down".into())) })
            .await;
    }
    tokio::time::sleep(Duration::from_millis(70)).await;

    let probes = AtomicUsize::new(0);
    let probe: Result<()> = breaker
        .execute("/x", || async {
            probes.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Network("still down".into()))
        })
        .await;
    assert!(matches!(probe, Err(FetchError::Network(_))));

    let blocked: Result<()> = breaker
        .execute("/x", || async {
            probes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(blocked.unwrap_err().is_circuit_open());
    assert_eq!(probes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_failures_open_once() {
    let telemetry = Arc::new(InMemoryTelemetry::new());
    let breaker = breaker(60_000).with_telemetry(telemetry.clone());

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                let _: Result<()> = breaker
                    .execute("/api/feed", || async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Err(FetchError::Network("refused".into()))
                    })
                    .await;
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(breaker.state("/api/feed").await, CircuitState::Open);
    assert_eq!(telemetry.snapshot().transitions.len(), 1);
}

#[tokio::test]
async fn test_half_open_admits_one_concurrent_probe() {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::from_millis(50))
            .build(),
    );

    let _: Result<()> = breaker
        .execute("/x", || async { Err(FetchError::Network("down".into())) })
        .await;
    tokio::time::sleep(Duration::from_millis(70)).await;

    let invoked = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let breaker = breaker.clone();
            let invoked = invoked.clone();
            tokio::spawn(async move {
                let result: Result<()> = breaker
                    .execute("/x", || async move {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(FetchError::Network("still down".into()))
                    })
                    .await;
                result
            })
        })
        .collect();

    let mut rejected = 0;
    for task in tasks {
        if task.await.unwrap().unwrap_err().is_circuit_open() {
            rejected += 1;
        }
    }

    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(rejected, 4);
    assert_eq!(breaker.state("/x").await, CircuitState::Open);
}

#[tokio::test]
async fn test_half_open_probes_run_one_after_another() {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .success_threshold(2)
            .reset_timeout(Duration::from_millis(50))
            .build(),
    );

    let _: Result<()> = breaker
        .execute("/x", || async { Err(FetchError::Network("down".into())) })
        .await;
    tokio::time::sleep(Duration::from_millis(70)).await;

    let slow = {
        let breaker = breaker.clone();
        tokio::spawn(async move {
            breaker
                .execute("/x", || async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, FetchError>(())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let overlapping: Result<()> = breaker.execute("/x", || async { Ok(()) }).await;
    assert!(overlapping.unwrap_err().is_circuit_open());

    slow.await.unwrap().unwrap();
    assert_eq!(breaker.state("/x").await, CircuitState::HalfOpen);

    breaker
        .execute("/x", || async { Ok::<_, FetchError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state("/x").await, CircuitState::Closed);
}
