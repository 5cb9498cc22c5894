/// Fallback resolution
///
/// Strategies are looked up by `service.operation`, then by bare `service`.
/// When neither is registered the default payload distinguishes transient
/// from permanent failures.
use super::classification::{ErrorClass, OperationError};
use super::retry::{RetryAttempt, RetryFailure};
use crate::breaker::BreakerKey;
use crate::{GuardianError, GuardianResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Substitute result producer; an `Err` is treated as a configuration bug
pub type FallbackFn = dyn Fn(&FailureCause) -> anyhow::Result<Value> + Send + Sync;

/// Why a fallback was needed
#[derive(Debug)]
pub enum FailureCause {
    /// The breaker refused the call; the operation never ran
    CircuitOpen {
        error: OperationError,
        class: ErrorClass,
    },

    /// The operation failed permanently or ran out of retries
    Failed(RetryFailure),
}

impl FailureCause {
    pub fn error(&self) -> &OperationError {
        match self {
            FailureCause::CircuitOpen { error, .. } => error,
            FailureCause::Failed(failure) => &failure.error,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FailureCause::CircuitOpen { class, .. } => *class,
            FailureCause::Failed(failure) => failure.class,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, FailureCause::CircuitOpen { .. })
    }

    /// Attempts made before giving up; empty when short-circuited
    pub fn attempts(&self) -> &[RetryAttempt] {
        match self {
            FailureCause::CircuitOpen { .. } => &[],
            FailureCause::Failed(failure) => &failure.attempts,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::CircuitOpen { error, .. } => write!(f, "{}", error),
            FailureCause::Failed(failure) => write!(f, "{}", failure),
        }
    }
}

/// Registered fallback strategies plus the default payloads
#[derive(Clone)]
pub struct FallbackRegistry {
    strategies: HashMap<String, Arc<FallbackFn>>,
    retry_after_secs: u64,
}

impl FallbackRegistry {
    pub fn new(retry_after_secs: u64) -> Self {
        Self {
            strategies: HashMap::new(),
            retry_after_secs,
        }
    }

    /// Register under `service` or `service.operation`; replaces any previous one
    pub fn register<F>(&mut self, key: impl Into<String>, strategy: F)
    where
        F: Fn(&FailureCause) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let key = BreakerKey::normalize_scope(&key.into());
        self.strategies.insert(key, Arc::new(strategy));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.strategies.contains_key(&BreakerKey::normalize_scope(key))
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_secs
    }

    /// Most specific strategy wins; the default payload never fails
    pub fn resolve(&self, key: &BreakerKey, cause: &FailureCause) -> GuardianResult<Value> {
        let scoped = key
            .operation()
            .map(|op| format!("{}.{}", key.service(), op));

        let candidates = scoped.iter().map(String::as_str).chain([key.service()]);
        for name in candidates {
            if let Some(strategy) = self.strategies.get(name) {
                tracing::debug!(breaker = %key, strategy = name, "Using registered fallback");
                return strategy(cause).map_err(|source| GuardianError::Fallback {
                    key: name.to_string(),
                    source,
                });
            }
        }

        tracing::debug!(breaker = %key, class = %cause.class(), "Using default fallback");
        Ok(self.default_payload(cause))
    }

    pub fn default_payload(&self, cause: &FailureCause) -> Value {
        if cause.is_transient() {
            json!({
                "error": "Service temporarily unavailable",
                "message": "The service is experiencing temporary issues. Please try again later.",
                "retry_after": self.retry_after_secs,
                "type": "transient_error",
            })
        } else {
            json!({
                "error": "Service unavailable",
                "message": "The service is currently unavailable. Please contact support if the problem persists.",
                "type": "permanent_error",
            })
        }
    }
}

impl Default for FallbackRegistry {
    fn default() -> Self {
        Self::new(60)
    }
}

impl fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.strategies.keys().collect();
        keys.sort();
        f.debug_struct("FallbackRegistry")
            .field("strategies", &keys)
            .field("retry_after_secs", &self.retry_after_secs)
            .finish()
    }
}
