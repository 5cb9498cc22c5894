/// Concurrent callers hammering the same breaker key
///
/// Failures recorded from many threads must sum exactly and trip the breaker
/// at the threshold; get-or-create must never produce duplicate records.

mod common;

use api_guardian::{
    BreakerRegistry, BreakerStore, CircuitBreakerConfig, CircuitState, MemoryBreakerStore,
    OperationError, SqliteBreakerStore, SystemClock, TtlStateCache,
};
use common::{fast_config, key, Harness};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;

fn registry_over(store: Arc<dyn BreakerStore>, failure_threshold: u32) -> Arc<BreakerRegistry> {
    let clock = Arc::new(SystemClock);
    Arc::new(BreakerRegistry::new(
        CircuitBreakerConfig {
            failure_threshold,
            ..Default::default()
        },
        store,
        Arc::new(TtlStateCache::new(clock.clone())),
        clock,
    ))
}

fn hammer_failures(registry: &Arc<BreakerRegistry>, per_thread: usize) {
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let k = key("flaky", Some("call"));
                barrier.wait();
                for _ in 0..per_thread {
                    registry.record_failure(&k).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_no_lost_failures_in_memory() {
    let registry = registry_over(Arc::new(MemoryBreakerStore::new()), 10_000);

    hammer_failures(&registry, 500);

    let breaker = registry.find(&key("flaky", Some("call"))).unwrap().unwrap();
    assert_eq!(breaker.failure_count, (THREADS * 500) as u32);
    assert_eq!(breaker.state, CircuitState::Closed);
}

#[test]
fn test_trips_at_exact_threshold_in_memory() {
    let registry = registry_over(Arc::new(MemoryBreakerStore::new()), 40);

    hammer_failures(&registry, 5);

    let breaker = registry.find(&key("flaky", Some("call"))).unwrap().unwrap();
    assert_eq!(breaker.failure_count, 40);
    assert_eq!(breaker.state, CircuitState::Open);
    assert!(breaker.next_attempt_at.is_some());
}

#[test]
fn test_no_lost_failures_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteBreakerStore::open(Some(&dir.path().join("breakers.db"))).unwrap();
    let registry = registry_over(Arc::new(store), 10_000);

    hammer_failures(&registry, 50);

    let breaker = registry.find(&key("flaky", Some("call"))).unwrap().unwrap();
    assert_eq!(breaker.failure_count, (THREADS * 50) as u32);
}

#[test]
fn test_concurrent_get_or_create_is_idempotent() {
    let registry = registry_over(Arc::new(MemoryBreakerStore::new()), 5);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.get_or_create(&key("fresh", None)).unwrap().id
            })
        })
        .collect();

    let ids: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(registry.stats().unwrap().total, 1);
}

#[test]
fn test_concurrent_execute_converges_to_open() {
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 5;
    config.recovery.max_retries = 1;
    let h = Arc::new(Harness::new(config));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let h = Arc::clone(&h);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..4 {
                    let outcome = h
                        .orchestrator
                        .execute("flaky", None, || {
                            Err::<(), _>(OperationError::new("Bad gateway response"))
                        })
                        .unwrap();
                    assert!(outcome.is_fallback());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let breaker = h
        .orchestrator
        .breakers()
        .find(&key("flaky", None))
        .unwrap()
        .unwrap();
    assert_eq!(breaker.state, CircuitState::Open);
    // Calls admitted before the trip became visible still count
    assert!(breaker.failure_count >= 5);
    assert!(!h.orchestrator.breakers().can_attempt(&key("flaky", None)).unwrap());
}
