/// Recovery orchestrator - top-level entry point
///
/// For every call:
/// 1. Resolve the breaker for `(service, operation)` and ask whether a call
///    may proceed; if not, go straight to fallback
/// 2. Run the operation under the retry policy for that key
/// 3. Record exactly one success or failure on the breaker
/// 4. On failure, resolve a fallback payload
use super::classification::{OperationError, TransientClassifier};
use super::fallback::{FailureCause, FallbackRegistry};
use super::retry::{
    ExecutionContext, RetryExecutor, RetryPolicy, Sleeper, StopReason, ThreadSleeper,
};
use super::suggestion::{RecoverySuggestion, SuggestionGenerator};
use crate::breaker::registry::{default_cache, open_store};
use crate::breaker::{BreakerKey, BreakerRegistry, BreakerStatus, BreakerStore, StateCache};
use crate::clock::{Clock, SystemClock};
use crate::config::GuardianConfig;
use crate::{GuardianError, GuardianResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a protected call
#[derive(Debug)]
pub enum Recovered<T> {
    /// The operation's own result
    Success(T),

    /// A fallback payload, with the failure that triggered it
    Fallback { payload: Value, cause: FailureCause },
}

impl<T> Recovered<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Recovered::Success(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Recovered::Fallback { .. })
    }

    pub fn success(self) -> Option<T> {
        match self {
            Recovered::Success(value) => Some(value),
            Recovered::Fallback { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Recovered::Success(_) => None,
            Recovered::Fallback { payload, .. } => Some(payload),
        }
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Recovered::Success(_) => None,
            Recovered::Fallback { cause, .. } => Some(cause),
        }
    }
}

/// Circuit breaker + retry + fallback
pub struct RecoveryOrchestrator {
    config: GuardianConfig,
    breakers: BreakerRegistry,
    executor: RetryExecutor,
    classifier: Arc<TransientClassifier>,
    fallbacks: FallbackRegistry,
    default_policy: RetryPolicy,
    retry_policies: HashMap<String, RetryPolicy>,
    suggestions: SuggestionGenerator,
}

impl RecoveryOrchestrator {
    /// Orchestrator with default collaborators for `config`
    pub fn new(config: GuardianConfig) -> GuardianResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: GuardianConfig) -> RecoveryOrchestratorBuilder {
        RecoveryOrchestratorBuilder::new(config)
    }

    /// Run `operation` under breaker, retry and fallback protection
    pub fn execute<T, F>(
        &self,
        service: &str,
        operation: Option<&str>,
        op: F,
    ) -> GuardianResult<Recovered<T>>
    where
        F: FnMut() -> Result<T, OperationError>,
    {
        self.execute_with(&ExecutionContext::default(), service, operation, op)
    }

    /// [`execute`](Self::execute) with cancellation and a deadline
    ///
    /// Cancellation returns [`GuardianError::Cancelled`] and leaves the
    /// breaker untouched. A value the operation produced is always returned,
    /// even if recording the success on the breaker fails.
    pub fn execute_with<T, F>(
        &self,
        ctx: &ExecutionContext,
        service: &str,
        operation: Option<&str>,
        op: F,
    ) -> GuardianResult<Recovered<T>>
    where
        F: FnMut() -> Result<T, OperationError>,
    {
        let key = BreakerKey::new(service, operation)?;

        if ctx.is_cancelled() {
            return Err(GuardianError::Cancelled);
        }

        let breaker_enabled = self.config.circuit_breaker.enabled;

        if breaker_enabled && !self.breakers.can_attempt(&key)? {
            tracing::info!(breaker = %key, "Circuit breaker is OPEN, using fallback");
            let error = OperationError::circuit_open();
            let class = self.classifier.classify(&error);
            return self.fallback(&key, FailureCause::CircuitOpen { error, class });
        }

        let policy = self.retry_policy_for(&key);

        match self.executor.run(&key, &policy, ctx, op) {
            Ok(value) => {
                if breaker_enabled {
                    if let Err(e) = self.breakers.record_success(&key) {
                        tracing::warn!(
                            breaker = %key,
                            error = %e,
                            "Failed to record success on circuit breaker"
                        );
                    }
                }
                Ok(Recovered::Success(value))
            }
            Err(failure) if failure.reason == StopReason::Cancelled => {
                tracing::info!(
                    breaker = %key,
                    attempts = failure.attempt_count(),
                    "Operation cancelled during backoff"
                );
                Err(GuardianError::Cancelled)
            }
            Err(failure) => {
                if breaker_enabled {
                    self.breakers.record_failure(&key)?;
                }
                tracing::warn!(
                    breaker = %key,
                    attempts = failure.attempt_count(),
                    class = %failure.class,
                    reason = %failure.reason,
                    error = %failure.error,
                    "Operation failed, using fallback"
                );
                self.fallback(&key, FailureCause::Failed(failure))
            }
        }
    }

    fn fallback<T>(&self, key: &BreakerKey, cause: FailureCause) -> GuardianResult<Recovered<T>> {
        let payload = self.fallbacks.resolve(key, &cause)?;
        Ok(Recovered::Fallback { payload, cause })
    }

    /// Override for `service.operation`, then `service`, then the default
    ///
    /// With recovery disabled every key gets a single attempt.
    pub fn retry_policy_for(&self, key: &BreakerKey) -> RetryPolicy {
        if !self.config.recovery.enabled {
            return RetryPolicy::single_attempt();
        }

        key.operation()
            .and_then(|op| {
                self.retry_policies
                    .get(&format!("{}.{}", key.service(), op))
            })
            .or_else(|| self.retry_policies.get(key.service()))
            .unwrap_or(&self.default_policy)
            .clone()
    }

    /// Snapshot of every breaker for the error-formatting layer
    pub fn circuit_breaker_status(&self) -> GuardianResult<Vec<BreakerStatus>> {
        self.breakers.status()
    }

    pub fn suggest(&self, error: &OperationError) -> RecoverySuggestion {
        self.suggestions.for_error(error)
    }

    /// Admin access to the breakers
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn classifier(&self) -> &TransientClassifier {
        &self.classifier
    }

    pub fn fallbacks(&self) -> &FallbackRegistry {
        &self.fallbacks
    }

    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }
}

/// Collaborators and strategies for a [`RecoveryOrchestrator`]
pub struct RecoveryOrchestratorBuilder {
    config: GuardianConfig,
    store: Option<Arc<dyn BreakerStore>>,
    cache: Option<Arc<dyn StateCache>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    fallbacks: FallbackRegistry,
    retry_policies: HashMap<String, RetryPolicy>,
}

impl RecoveryOrchestratorBuilder {
    pub fn new(config: GuardianConfig) -> Self {
        let fallbacks = FallbackRegistry::new(config.recovery.retry_after_secs);
        Self {
            config,
            store: None,
            cache: None,
            clock: None,
            sleeper: None,
            fallbacks,
            retry_policies: HashMap::new(),
        }
    }

    /// Defaults to the backend named in `storage`
    pub fn store(mut self, store: Arc<dyn BreakerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to a TTL cache (or none when `cache_ttl_secs` is 0)
    pub fn cache(mut self, cache: Arc<dyn StateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Fallback for `service` or `service.operation`
    pub fn fallback<F>(mut self, key: impl Into<String>, strategy: F) -> Self
    where
        F: Fn(&FailureCause) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.fallbacks.register(key, strategy);
        self
    }

    /// Retry policy for `service` or `service.operation`
    pub fn retry_policy(mut self, key: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retry_policies.insert(BreakerKey::normalize_scope(&key.into()), policy);
        self
    }

    pub fn build(self) -> GuardianResult<RecoveryOrchestrator> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.config.storage)?,
        };
        let cache = self
            .cache
            .unwrap_or_else(|| default_cache(&self.config.circuit_breaker, Arc::clone(&clock)));

        let breakers = BreakerRegistry::new(
            self.config.circuit_breaker.clone(),
            store,
            cache,
            Arc::clone(&clock),
        );

        let classifier = Arc::new(TransientClassifier::from_config(&self.config.recovery)?);
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(ThreadSleeper));
        let executor = RetryExecutor::new(Arc::clone(&classifier), sleeper, clock);

        tracing::debug!(
            breaker_enabled = self.config.circuit_breaker.enabled,
            recovery_enabled = self.config.recovery.enabled,
            fallbacks = self.fallbacks.len(),
            retry_overrides = self.retry_policies.len(),
            "Recovery orchestrator ready"
        );

        Ok(RecoveryOrchestrator {
            default_policy: RetryPolicy::from_config(&self.config.recovery),
            config: self.config,
            breakers,
            executor,
            classifier,
            fallbacks: self.fallbacks,
            retry_policies: self.retry_policies,
            suggestions: SuggestionGenerator::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreaker, CircuitState, MemoryBreakerStore};
    use crate::clock::ManualClock;
    use crate::recovery::CancellationToken;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct NoWait {
        delays: Mutex<Vec<Duration>>,
    }

    impl Sleeper for NoWait {
        fn sleep(&self, duration: Duration, _cancel: Option<&CancellationToken>) -> bool {
            self.delays.lock().push(duration);
            true
        }
    }

    fn builder(config: GuardianConfig) -> (RecoveryOrchestratorBuilder, Arc<ManualClock>, Arc<NoWait>) {
        let clock = Arc::new(ManualClock::starting_now());
        let sleeper = Arc::new(NoWait::default());
        let builder = RecoveryOrchestrator::builder(config)
            .clock(clock.clone())
            .sleeper(sleeper.clone());
        (builder, clock, sleeper)
    }

    #[test]
    fn test_success_records_on_breaker() {
        let (builder, _, _) = builder(GuardianConfig::default());
        let orchestrator = builder.build().unwrap();

        let outcome = orchestrator
            .execute("svc", Some("op"), || Ok::<_, OperationError>("value"))
            .unwrap();

        assert_eq!(outcome.success(), Some("value"));
        let key = BreakerKey::new("svc", Some("op")).unwrap();
        let breaker = orchestrator.breakers().find(&key).unwrap().unwrap();
        assert_eq!(breaker.state, CircuitState::Closed);
    }

    /// Memory store whose writes fail
    struct ReadOnlyStore(MemoryBreakerStore);

    impl BreakerStore for ReadOnlyStore {
        fn find(&self, key: &BreakerKey) -> GuardianResult<Option<CircuitBreaker>> {
            self.0.find(key)
        }

        fn find_by_id(&self, id: Uuid) -> GuardianResult<Option<CircuitBreaker>> {
            self.0.find_by_id(id)
        }

        fn get_or_create(
            &self,
            key: &BreakerKey,
            template: CircuitBreaker,
        ) -> GuardianResult<CircuitBreaker> {
            self.0.get_or_create(key, template)
        }

        fn upsert(&self, _breaker: &CircuitBreaker) -> GuardianResult<CircuitBreaker> {
            Err(GuardianError::StorageUnavailable("read-only".to_string()))
        }

        fn modify(
            &self,
            _key: &BreakerKey,
            _f: &mut dyn FnMut(&mut CircuitBreaker),
        ) -> GuardianResult<CircuitBreaker> {
            Err(GuardianError::StorageUnavailable("read-only".to_string()))
        }

        fn list(&self) -> GuardianResult<Vec<CircuitBreaker>> {
            self.0.list()
        }
    }

    #[test]
    fn test_success_survives_breaker_write_failure() {
        let (builder, _, _) = builder(GuardianConfig::default());
        let orchestrator = builder
            .store(Arc::new(ReadOnlyStore(MemoryBreakerStore::new())))
            .build()
            .unwrap();

        let mut calls = 0;
        let outcome = orchestrator
            .execute("svc", Some("op"), || {
                calls += 1;
                Ok::<_, OperationError>("charged")
            })
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(outcome.success(), Some("charged"));
    }

    #[test]
    fn test_failure_counts_once_per_execute() {
        let (builder, _, sleeper) = builder(GuardianConfig::default());
        let orchestrator = builder.build().unwrap();

        let outcome = orchestrator
            .execute("svc", None, || Err::<(), _>(OperationError::new("timeout")))
            .unwrap();

        assert_eq!(outcome.payload().unwrap()["type"], "transient_error");
        assert_eq!(sleeper.delays.lock().len(), 2);

        let key = BreakerKey::new("svc", None).unwrap();
        assert_eq!(
            orchestrator.breakers().find(&key).unwrap().unwrap().failure_count,
            1
        );
    }

    #[test]
    fn test_retry_policy_precedence() {
        let (builder, _, _) = builder(GuardianConfig::default());
        let orchestrator = builder
            .retry_policy("svc", RetryPolicy::new(2, Duration::from_millis(5), 1.0))
            .retry_policy("svc.op", RetryPolicy::new(7, Duration::from_millis(5), 1.0))
            .build()
            .unwrap();

        let op = BreakerKey::new("svc", Some("op")).unwrap();
        let other = BreakerKey::new("svc", Some("other")).unwrap();
        let unrelated = BreakerKey::new("search", None).unwrap();

        assert_eq!(orchestrator.retry_policy_for(&op).max_retries, 7);
        assert_eq!(orchestrator.retry_policy_for(&other).max_retries, 2);
        assert_eq!(orchestrator.retry_policy_for(&unrelated).max_retries, 3);
    }

    #[test]
    fn test_padded_registration_names_match_keys() {
        let (builder, _, _) = builder(GuardianConfig::default());
        let orchestrator = builder
            .retry_policy(" svc . op ", RetryPolicy::new(7, Duration::from_millis(5), 1.0))
            .fallback(" svc", |_: &FailureCause| Ok(json!({"source": "padded"})))
            .build()
            .unwrap();

        let key = BreakerKey::new("svc", Some("op")).unwrap();
        assert_eq!(orchestrator.retry_policy_for(&key).max_retries, 7);

        let outcome = orchestrator
            .execute(" svc ", None, || {
                Err::<(), _>(OperationError::permanent("Invalid request"))
            })
            .unwrap();
        assert_eq!(outcome.payload(), Some(&json!({"source": "padded"})));
    }

    #[test]
    fn test_recovery_disabled_runs_once() {
        let mut config = GuardianConfig::default();
        config.recovery.enabled = false;
        let (builder, _, sleeper) = builder(config);
        let orchestrator = builder.build().unwrap();
        let mut calls = 0;

        let outcome = orchestrator
            .execute("svc", None, || {
                calls += 1;
                Err::<(), _>(OperationError::new("Connection timeout"))
            })
            .unwrap();

        assert_eq!(calls, 1);
        assert!(sleeper.delays.lock().is_empty());
        assert_eq!(outcome.payload().unwrap()["type"], "transient_error");
    }

    #[test]
    fn test_breaker_disabled_never_short_circuits() {
        let mut config = GuardianConfig::default();
        config.circuit_breaker.enabled = false;
        config.circuit_breaker.failure_threshold = 1;
        config.recovery.max_retries = 1;
        let (builder, _, _) = builder(config);
        let orchestrator = builder.build().unwrap();
        let mut calls = 0;

        for _ in 0..3 {
            orchestrator
                .execute("svc", None, || {
                    calls += 1;
                    Err::<(), _>(OperationError::new("boom"))
                })
                .unwrap();
        }

        assert_eq!(calls, 3);
        assert!(orchestrator.circuit_breaker_status().unwrap().is_empty());
    }

    #[test]
    fn test_open_breaker_skips_operation() {
        let mut config = GuardianConfig::default();
        config.circuit_breaker.failure_threshold = 1;
        config.recovery.max_retries = 1;
        let (builder, _, _) = builder(config);
        let orchestrator = builder
            .fallback("svc", |cause: &FailureCause| {
                Ok(json!({ "open": cause.is_circuit_open() }))
            })
            .build()
            .unwrap();

        orchestrator
            .execute("svc", None, || Err::<(), _>(OperationError::new("boom")))
            .unwrap();

        let mut calls = 0;
        let outcome = orchestrator
            .execute("svc", None, || {
                calls += 1;
                Ok::<_, OperationError>(())
            })
            .unwrap();

        assert_eq!(calls, 0);
        assert_eq!(outcome.payload().unwrap()["open"], true);
        assert!(outcome.cause().unwrap().attempts().is_empty());
    }

    #[test]
    fn test_cancelled_before_start() {
        let (builder, _, _) = builder(GuardianConfig::default());
        let orchestrator = builder.build().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ExecutionContext::new().with_cancellation(token);

        let result = orchestrator.execute_with(&ctx, "svc", None, || Ok::<_, OperationError>(1));

        assert!(matches!(result, Err(GuardianError::Cancelled)));
        let key = BreakerKey::new("svc", None).unwrap();
        assert!(orchestrator.breakers().find(&key).unwrap().is_none());
    }

    #[test]
    fn test_invalid_service_name() {
        let (builder, _, _) = builder(GuardianConfig::default());
        let orchestrator = builder.build().unwrap();

        let result = orchestrator.execute(" ", None, || Ok::<_, OperationError>(1));
        assert!(matches!(result, Err(GuardianError::InvalidKey(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = GuardianConfig::default();
        config.recovery.max_retries = 0;
        assert!(matches!(
            RecoveryOrchestrator::new(config),
            Err(GuardianError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_suggest_uses_message() {
        let (builder, _, _) = builder(GuardianConfig::default());
        let orchestrator = builder.build().unwrap();

        let suggestion = orchestrator.suggest(&OperationError::new("Authentication failed"));
        assert_eq!(suggestion.kind.as_str(), "authentication");
    }
}
