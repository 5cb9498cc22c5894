/// Retry and fallback recovery engine
///
/// ```text
/// RecoveryOrchestrator
///   ├── BreakerRegistry      (gate + outcome recording)
///   ├── RetryExecutor        (backoff, TransientClassifier)
///   ├── FallbackRegistry     (service.op → service → default payload)
///   └── SuggestionGenerator  (advisory metadata)
/// ```
pub mod classification;
pub mod fallback;
pub mod orchestrator;
pub mod retry;
pub mod suggestion;

pub use classification::{ErrorClass, OperationError, TransientClassifier, CIRCUIT_OPEN_MESSAGE};
pub use fallback::{FailureCause, FallbackFn, FallbackRegistry};
pub use orchestrator::{Recovered, RecoveryOrchestrator, RecoveryOrchestratorBuilder};
pub use retry::{
    CancellationToken, ExecutionContext, RetryAttempt, RetryExecutor, RetryFailure, RetryPolicy,
    Sleeper, StopReason, ThreadSleeper,
};
pub use suggestion::{RecoverySuggestion, SuggestionGenerator, SuggestionKind};
