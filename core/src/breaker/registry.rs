/// Breaker registry - the circuit breaker entry point used by the orchestrator
///
/// Ties together the store (source of truth), the state cache (latency
/// optimisation) and the clock. Every mutation goes through the store's atomic
/// `modify` and invalidates the cached `can_attempt` decision before returning,
/// so the next caller observes the new state even if the TTL has not expired.
use super::cache::{DisabledCache, StateCache, TtlStateCache};
use super::sqlite::SqliteBreakerStore;
use super::state::{BreakerKey, CircuitBreaker, CircuitState, Transition};
use super::store::{BreakerStore, MemoryBreakerStore};
use crate::clock::Clock;
use crate::config::{CircuitBreakerConfig, GuardianConfig, StorageBackend, StorageConfig};
use crate::{GuardianError, GuardianResult};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const CAN_ATTEMPT: &str = "can_attempt";

/// Manual outcome injected by an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestAction {
    Success,
    Failure,
}

impl FromStr for TestAction {
    type Err = GuardianError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(TestAction::Success),
            "failure" => Ok(TestAction::Failure),
            other => Err(GuardianError::InvalidAction(other.to_string())),
        }
    }
}

/// Listing filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerFilter {
    pub state: Option<CircuitState>,

    /// Substring of the service name
    pub service: Option<String>,
}

impl BreakerFilter {
    fn matches(&self, breaker: &CircuitBreaker) -> bool {
        self.state.map_or(true, |state| breaker.state == state)
            && self
                .service
                .as_deref()
                .map_or(true, |needle| breaker.service.contains(needle))
    }
}

/// Aggregate counts across all breakers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
    pub closed: usize,

    /// Breakers whose last failure is within the past hour
    pub recent_failures: usize,
}

/// Read-only snapshot consumed by the error-formatting layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub service: String,
    pub operation: Option<String>,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub can_attempt: bool,

    /// RFC 3339
    pub next_attempt_at: Option<String>,
}

/// Circuit breaker manager
pub struct BreakerRegistry {
    store: Arc<dyn BreakerStore>,
    cache: Arc<dyn StateCache>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
    /// Bumped by every mutation; lets a gate read detect a write that
    /// landed while it was filling the cache
    generation: AtomicU64,
}

impl BreakerRegistry {
    pub fn new(
        config: CircuitBreakerConfig,
        store: Arc<dyn BreakerStore>,
        cache: Arc<dyn StateCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// In-memory store with a TTL cache
    pub fn in_memory(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = default_cache(&config, Arc::clone(&clock));
        Self::new(config, Arc::new(MemoryBreakerStore::new()), cache, clock)
    }

    /// Store and cache chosen from the full configuration
    pub fn from_config(config: &GuardianConfig, clock: Arc<dyn Clock>) -> GuardianResult<Self> {
        let store = open_store(&config.storage)?;
        let cache = default_cache(&config.circuit_breaker, Arc::clone(&clock));
        Ok(Self::new(
            config.circuit_breaker.clone(),
            store,
            cache,
            clock,
        ))
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Look up the breaker for `key`, creating a Closed one on first use
    pub fn get_or_create(&self, key: &BreakerKey) -> GuardianResult<CircuitBreaker> {
        let template = CircuitBreaker::new(key, &self.config, self.clock.now());
        self.store.get_or_create(key, template)
    }

    pub fn find(&self, key: &BreakerKey) -> GuardianResult<Option<CircuitBreaker>> {
        self.store.find(key)
    }

    pub fn find_by_id(&self, id: Uuid) -> GuardianResult<CircuitBreaker> {
        self.store
            .find_by_id(id)?
            .ok_or_else(|| GuardianError::BreakerNotFound(id.to_string()))
    }

    /// Permission gate evaluated before every protected call
    ///
    /// Served from the cache when possible. Cache errors are logged and fall
    /// back to a direct read.
    pub fn can_attempt(&self, key: &BreakerKey) -> GuardianResult<bool> {
        let cache_key = key.cache_key(CAN_ATTEMPT);

        match self.cache.get(&cache_key) {
            Ok(Some(allowed)) => return Ok(allowed),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(breaker = %key, error = %e, "State cache read failed, reading store");
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let breaker = self.get_or_create(key)?;
        let now = self.clock.now();
        let allowed = breaker.can_attempt(now);

        let ttl = self.decision_ttl(&breaker, allowed, now);
        if ttl > Duration::zero() {
            if let Err(e) = self.cache.set(&cache_key, allowed, ttl) {
                tracing::warn!(breaker = %key, error = %e, "State cache write failed");
            }
            // A mutation since the read may have been invalidated before our write
            if self.generation.load(Ordering::SeqCst) != generation {
                self.invalidate(key, &cache_key);
            }
        }

        Ok(allowed)
    }

    /// A cached "no" never outlives the cooldown it reflects
    fn decision_ttl(&self, breaker: &CircuitBreaker, allowed: bool, now: DateTime<Utc>) -> Duration {
        let ttl = self.config.cache_ttl();
        match (allowed, breaker.next_attempt_at) {
            (false, Some(next_attempt_at)) => ttl.min(next_attempt_at - now),
            _ => ttl,
        }
    }

    pub fn record_success(&self, key: &BreakerKey) -> GuardianResult<CircuitBreaker> {
        let policy = self.config.half_open_policy;
        self.mutate(key, |breaker, now| breaker.record_success(now, policy))
    }

    pub fn record_failure(&self, key: &BreakerKey) -> GuardianResult<CircuitBreaker> {
        self.mutate(key, |breaker, now| breaker.record_failure(now))
    }

    /// Administrative reset to Closed
    pub fn reset(&self, key: &BreakerKey) -> GuardianResult<CircuitBreaker> {
        if self.store.find(key)?.is_none() {
            return Err(GuardianError::BreakerNotFound(key.to_string()));
        }
        let breaker = self.mutate(key, |breaker, now| breaker.reset(now))?;
        tracing::info!(breaker = %key, "Circuit breaker manually reset to CLOSED");
        Ok(breaker)
    }

    pub fn reset_by_id(&self, id: Uuid) -> GuardianResult<CircuitBreaker> {
        let breaker = self.find_by_id(id)?;
        self.reset(&breaker.key())
    }

    /// Inject a manual success or failure, same semantics as real outcomes
    pub fn force(&self, id: Uuid, action: TestAction) -> GuardianResult<CircuitBreaker> {
        let key = self.find_by_id(id)?.key();
        tracing::info!(breaker = %key, action = ?action, "Manual circuit breaker test");
        match action {
            TestAction::Success => self.record_success(&key),
            TestAction::Failure => self.record_failure(&key),
        }
    }

    /// Breakers matching `filter`, most recently updated first
    pub fn list(&self, filter: &BreakerFilter) -> GuardianResult<Vec<CircuitBreaker>> {
        let mut breakers: Vec<_> = self
            .store
            .list()?
            .into_iter()
            .filter(|breaker| filter.matches(breaker))
            .collect();
        breakers.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(breakers)
    }

    pub fn stats(&self) -> GuardianResult<BreakerStats> {
        let recent_cutoff = self.clock.now() - Duration::hours(1);

        let stats = self
            .store
            .list()?
            .iter()
            .fold(BreakerStats::default(), |mut stats, breaker| {
                stats.total += 1;
                match breaker.state {
                    CircuitState::Open => stats.open += 1,
                    CircuitState::HalfOpen => stats.half_open += 1,
                    CircuitState::Closed => stats.closed += 1,
                }
                if breaker.last_failure_at.map_or(false, |t| t >= recent_cutoff) {
                    stats.recent_failures += 1;
                }
                stats
            });

        Ok(stats)
    }

    /// Snapshot of every breaker for API error enrichment
    pub fn status(&self) -> GuardianResult<Vec<BreakerStatus>> {
        self.list(&BreakerFilter::default())?
            .into_iter()
            .map(|breaker| {
                let can_attempt = self.can_attempt(&breaker.key())?;
                Ok(BreakerStatus {
                    can_attempt,
                    next_attempt_at: breaker
                        .next_attempt_at
                        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
                    service: breaker.service,
                    operation: breaker.operation,
                    state: breaker.state,
                    failure_count: breaker.failure_count,
                    failure_threshold: breaker.failure_threshold,
                })
            })
            .collect()
    }

    fn mutate<F>(&self, key: &BreakerKey, mut apply: F) -> GuardianResult<CircuitBreaker>
    where
        F: FnMut(&mut CircuitBreaker, DateTime<Utc>) -> Option<Transition>,
    {
        let cache_key = key.cache_key(CAN_ATTEMPT);
        self.invalidate(key, &cache_key);

        self.get_or_create(key)?;

        let now = self.clock.now();
        let mut transition = None;
        let breaker = self.store.modify(key, &mut |breaker: &mut CircuitBreaker| {
            transition = apply(breaker, now);
        })?;

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.invalidate(key, &cache_key);

        if let Some(transition) = transition {
            log_transition(&breaker, transition, now);
        }

        Ok(breaker)
    }

    fn invalidate(&self, key: &BreakerKey, cache_key: &str) {
        if let Err(e) = self.cache.invalidate(cache_key) {
            tracing::warn!(breaker = %key, error = %e, "State cache invalidation failed");
        }
    }
}

/// Backend selected by `storage.backend`
pub(crate) fn open_store(config: &StorageConfig) -> GuardianResult<Arc<dyn BreakerStore>> {
    Ok(match config.backend {
        StorageBackend::Memory => Arc::new(MemoryBreakerStore::new()),
        StorageBackend::Sqlite => Arc::new(SqliteBreakerStore::open(config.sqlite_path.as_deref())?),
    })
}

/// TTL cache, or no cache at all when the TTL is zero
pub(crate) fn default_cache(
    config: &CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
) -> Arc<dyn StateCache> {
    if config.cache_ttl_secs > 0 {
        Arc::new(TtlStateCache::new(clock))
    } else {
        Arc::new(DisabledCache)
    }
}

fn log_transition(breaker: &CircuitBreaker, transition: Transition, now: DateTime<Utc>) {
    let key = breaker.key();
    match (transition.from, transition.to) {
        (CircuitState::Open, CircuitState::Open) => tracing::debug!(
            breaker = %key,
            failure_count = breaker.failure_count,
            "Circuit breaker cooldown extended"
        ),
        (CircuitState::HalfOpen, CircuitState::Open) => tracing::warn!(
            breaker = %key,
            failure_count = breaker.failure_count,
            "Circuit breaker REOPENED after failure in HalfOpen state"
        ),
        (_, CircuitState::Open) => {
            let cooldown = breaker
                .next_attempt_at
                .and_then(|t| (t - now).to_std().ok())
                .unwrap_or_default();
            tracing::warn!(
                breaker = %key,
                failure_count = breaker.failure_count,
                failure_threshold = breaker.failure_threshold,
                retry_in = %humantime::format_duration(cooldown),
                "Circuit breaker OPENED"
            );
        }
        (_, CircuitState::HalfOpen) => tracing::info!(
            breaker = %key,
            "Circuit breaker transitioning to HalfOpen"
        ),
        (_, CircuitState::Closed) => tracing::info!(breaker = %key, "Circuit breaker CLOSED"),
    }
}
