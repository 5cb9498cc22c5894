/// Persistence collaborator for breaker records
///
/// A store must guarantee two things:
/// - exactly one record per [`BreakerKey`] (`get_or_create` is idempotent
///   under concurrency)
/// - `modify` is an atomic read-modify-write, so concurrent failures are
///   never lost and trip the breaker at exactly the threshold
use super::state::{BreakerKey, CircuitBreaker};
use crate::{GuardianError, GuardianResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Storage backend for circuit breaker records
pub trait BreakerStore: Send + Sync {
    fn find(&self, key: &BreakerKey) -> GuardianResult<Option<CircuitBreaker>>;

    fn find_by_id(&self, id: Uuid) -> GuardianResult<Option<CircuitBreaker>>;

    /// Return the record for `key`, inserting `template` if there is none
    fn get_or_create(
        &self,
        key: &BreakerKey,
        template: CircuitBreaker,
    ) -> GuardianResult<CircuitBreaker>;

    /// Insert or overwrite the record for the breaker's key
    fn upsert(&self, breaker: &CircuitBreaker) -> GuardianResult<CircuitBreaker>;

    /// Apply `f` to the stored record atomically and return the result
    fn modify(
        &self,
        key: &BreakerKey,
        f: &mut dyn FnMut(&mut CircuitBreaker),
    ) -> GuardianResult<CircuitBreaker>;

    fn list(&self) -> GuardianResult<Vec<CircuitBreaker>>;

    /// Atomically bump the failure counter, returning the new count
    ///
    /// Does not evaluate the trip threshold; that is `CircuitBreaker::record_failure`.
    fn increment_failure(&self, key: &BreakerKey, now: DateTime<Utc>) -> GuardianResult<u32> {
        let breaker = self.modify(key, &mut |breaker: &mut CircuitBreaker| {
            breaker.failure_count = breaker.failure_count.saturating_add(1);
            breaker.last_failure_at = Some(now);
            breaker.updated_at = now;
        })?;
        Ok(breaker.failure_count)
    }
}

/// Process-local store with one lock per breaker
#[derive(Default)]
pub struct MemoryBreakerStore {
    breakers: DashMap<BreakerKey, Arc<Mutex<CircuitBreaker>>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &BreakerKey) -> Option<Arc<Mutex<CircuitBreaker>>> {
        // Clone the Arc so the shard guard is released before locking
        self.breakers.get(key).map(|entry| Arc::clone(entry.value()))
    }
}

impl BreakerStore for MemoryBreakerStore {
    fn find(&self, key: &BreakerKey) -> GuardianResult<Option<CircuitBreaker>> {
        Ok(self.slot(key).map(|slot| slot.lock().clone()))
    }

    fn find_by_id(&self, id: Uuid) -> GuardianResult<Option<CircuitBreaker>> {
        let slots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        Ok(slots
            .into_iter()
            .map(|slot| slot.lock().clone())
            .find(|breaker| breaker.id == id))
    }

    fn get_or_create(
        &self,
        key: &BreakerKey,
        template: CircuitBreaker,
    ) -> GuardianResult<CircuitBreaker> {
        let slot = Arc::clone(
            self.breakers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(template)))
                .value(),
        );
        let breaker = slot.lock().clone();
        Ok(breaker)
    }

    fn upsert(&self, breaker: &CircuitBreaker) -> GuardianResult<CircuitBreaker> {
        let slot = Arc::clone(
            self.breakers
                .entry(breaker.key())
                .or_insert_with(|| Arc::new(Mutex::new(breaker.clone())))
                .value(),
        );

        // An existing record keeps its identity
        let mut stored = slot.lock();
        let id = stored.id;
        let created_at = stored.created_at;
        *stored = breaker.clone();
        stored.id = id;
        stored.created_at = created_at;
        Ok(stored.clone())
    }

    fn modify(
        &self,
        key: &BreakerKey,
        f: &mut dyn FnMut(&mut CircuitBreaker),
    ) -> GuardianResult<CircuitBreaker> {
        let slot = self
            .slot(key)
            .ok_or_else(|| GuardianError::BreakerNotFound(key.to_string()))?;

        let mut breaker = slot.lock();
        f(&mut *breaker);
        Ok(breaker.clone())
    }

    fn list(&self) -> GuardianResult<Vec<CircuitBreaker>> {
        let slots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        Ok(slots.into_iter().map(|slot| slot.lock().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use std::thread;

    fn template(key: &BreakerKey) -> CircuitBreaker {
        CircuitBreaker::new(key, &CircuitBreakerConfig::default(), Utc::now())
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = MemoryBreakerStore::new();
        let key = BreakerKey::new("svc", Some("op")).unwrap();

        let first = store.get_or_create(&key, template(&key)).unwrap();
        let second = store.get_or_create(&key, template(&key)).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_distinct_operations_are_distinct_records() {
        let store = MemoryBreakerStore::new();
        let bare = BreakerKey::new("svc", None).unwrap();
        let op = BreakerKey::new("svc", Some("op")).unwrap();

        let a = store.get_or_create(&bare, template(&bare)).unwrap();
        let b = store.get_or_create(&op, template(&op)).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_modify_missing_key_fails() {
        let store = MemoryBreakerStore::new();
        let key = BreakerKey::new("svc", None).unwrap();

        let result = store.modify(&key, &mut |_: &mut CircuitBreaker| {});
        assert!(matches!(result, Err(GuardianError::BreakerNotFound(_))));
    }

    #[test]
    fn test_upsert_keeps_identity() {
        let store = MemoryBreakerStore::new();
        let key = BreakerKey::new("svc", None).unwrap();
        let original = store.get_or_create(&key, template(&key)).unwrap();

        let mut replacement = template(&key);
        replacement.failure_count = 3;
        let stored = store.upsert(&replacement).unwrap();

        assert_eq!(stored.id, original.id);
        assert_eq!(stored.failure_count, 3);
        assert_eq!(store.find_by_id(original.id).unwrap().unwrap().failure_count, 3);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryBreakerStore::new());
        let key = BreakerKey::new("svc", None).unwrap();
        store.get_or_create(&key, template(&key)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.increment_failure(&key, Utc::now()).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.find(&key).unwrap().unwrap().failure_count, 2000);
    }
}
