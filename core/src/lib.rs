//! API Guardian recovery core
//!
//! Per-service circuit breakers combined with a retry + fallback recovery
//! engine. Callers hand a fallible operation to the [`RecoveryOrchestrator`],
//! which consults the breaker for the `(service, operation)` key, runs the
//! operation with exponential backoff on transient errors, records the
//! outcome, and resolves a fallback payload when the operation cannot succeed.
//!
//! ```text
//! caller ──▶ RecoveryOrchestrator::execute(service, op)
//!               │
//!               ├─▶ BreakerRegistry::can_attempt ──▶ StateCache ─┐
//!               │                                               └▶ BreakerStore
//!               ├─▶ RetryExecutor::run(op)   (backoff, classifier)
//!               ├─▶ BreakerRegistry::record_success / record_failure
//!               └─▶ FallbackRegistry::resolve (service.op → service → default)
//! ```
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use api_guardian::{GuardianConfig, OperationError, Recovered, RecoveryOrchestrator};
//!
//! let orchestrator = RecoveryOrchestrator::builder(GuardianConfig::default()).build()?;
//!
//! let outcome = orchestrator.execute("payments", Some("charge"), || {
//!     charge_card().map_err(|e| OperationError::from_error(e))
//! })?;
//!
//! match outcome {
//!     Recovered::Success(receipt) => println!("charged: {receipt:?}"),
//!     Recovered::Fallback { payload, .. } => println!("degraded: {payload}"),
//! }
//! # Ok::<(), api_guardian::GuardianError>(())
//! ```

pub mod breaker;
pub mod clock;
pub mod config;
pub mod recovery;
pub mod telemetry;

pub use breaker::{
    BreakerFilter, BreakerKey, BreakerRegistry, BreakerStats, BreakerStatus, BreakerStore,
    CircuitBreaker, CircuitState, DisabledCache, MemoryBreakerStore, SqliteBreakerStore,
    StateCache, TestAction, TtlStateCache,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CircuitBreakerConfig, GuardianConfig, HalfOpenPolicy, LoggingConfig, RecoveryConfig,
    StorageBackend, StorageConfig, MAX_CACHE_TTL_SECS, MAX_RECOVERY_TIMEOUT_SECS,
};
pub use recovery::{
    CancellationToken, ErrorClass, ExecutionContext, FailureCause, FallbackRegistry,
    OperationError, Recovered, RecoveryOrchestrator, RecoveryOrchestratorBuilder,
    RecoverySuggestion, RetryAttempt, RetryExecutor, RetryFailure, RetryPolicy, Sleeper,
    StopReason, SuggestionGenerator, SuggestionKind, ThreadSleeper, TransientClassifier,
};

use thiserror::Error;

/// Errors raised by the recovery core itself
///
/// Failures of the protected operation are not represented here: those are
/// [`OperationError`]s and always resolve through fallback.
#[derive(Error, Debug)]
pub enum GuardianError {
    #[error("Invalid circuit breaker key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load configuration: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Invalid transient error pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    StorageUnavailable(String),

    #[error("State cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Circuit breaker not found: {0}")]
    BreakerNotFound(String),

    #[error("Invalid action '{0}': action must be either \"success\" or \"failure\"")]
    InvalidAction(String),

    #[error("Fallback strategy '{key}' failed: {source}")]
    Fallback {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

pub type GuardianResult<T> = Result<T, GuardianError>;
