/// Bounded retry with exponential backoff
///
/// The executor runs an operation until it succeeds, fails permanently, or
/// runs out of attempts. Backoff is a blocking sleep on the calling thread,
/// delegated to a [`Sleeper`] so that tests can record delays instead of
/// waiting, and so that a [`CancellationToken`] can cut a sleep short.
use super::classification::{ErrorClass, OperationError, TransientClassifier};
use crate::breaker::BreakerKey;
use crate::clock::Clock;
use crate::config::RecoveryConfig;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Attempt budget and backoff curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Cap applied to every delay
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::MAX,
            backoff_multiplier,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Run once, never retry
    pub fn single_attempt() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay after the `retry`-th failure (0-based): `base * multiplier^retry`, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }

    /// Every attempt counts, even with a zero budget
    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

/// One failed attempt, kept for the caller and the fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt: u32,

    /// Backoff slept after this attempt, `None` if it was the last one
    pub delay: Option<Duration>,

    pub class: ErrorClass,

    pub error: String,
}

/// Why the executor gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Not retryable, failed on the first occurrence
    Permanent,

    /// Attempt budget used up
    Exhausted,

    /// The next backoff would end past the caller's deadline
    DeadlineExceeded,

    /// The caller cancelled during backoff
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Permanent => "permanent error",
            StopReason::Exhausted => "retries exhausted",
            StopReason::DeadlineExceeded => "deadline exceeded",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Final failure of a retried operation
#[derive(Debug)]
pub struct RetryFailure {
    /// Last error returned by the operation
    pub error: OperationError,

    pub class: ErrorClass,

    pub reason: StopReason,

    pub attempts: Vec<RetryAttempt>,
}

impl RetryFailure {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

impl fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.reason,
            self.attempts.len(),
            self.error
        )
    }
}

impl std::error::Error for RetryFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Shared cancellation flag that also wakes sleeping waiters
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Block for up to `timeout`; returns true if cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        if !*cancelled {
            self.inner
                .wake
                .wait_while_for(&mut cancelled, |cancelled| !*cancelled, timeout);
        }
        *cancelled
    }
}

/// Per-call cancellation and deadline
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    cancel: Option<CancellationToken>,
    deadline: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stop retrying rather than sleep past `deadline` (read from the injected clock)
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancellationToken::is_cancelled)
    }
}

/// Backoff sleep
pub trait Sleeper: Send + Sync {
    /// Sleep for `duration`; returns false if woken early by cancellation
    fn sleep(&self, duration: Duration, cancel: Option<&CancellationToken>) -> bool;
}

/// Blocks the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: Option<&CancellationToken>) -> bool {
        match cancel {
            Some(token) => !token.wait_timeout(duration),
            None => {
                thread::sleep(duration);
                true
            }
        }
    }
}

/// Runs operations under a [`RetryPolicy`]
pub struct RetryExecutor {
    classifier: Arc<TransientClassifier>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl RetryExecutor {
    pub fn new(
        classifier: Arc<TransientClassifier>,
        sleeper: Arc<dyn Sleeper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            classifier,
            sleeper,
            clock,
        }
    }

    pub fn classifier(&self) -> &TransientClassifier {
        &self.classifier
    }

    /// Run `operation` until it succeeds or the policy says stop
    ///
    /// Permanent errors are returned after one attempt. Transient errors are
    /// retried until `max_retries` attempts have been made.
    pub fn run<T, F>(
        &self,
        key: &BreakerKey,
        policy: &RetryPolicy,
        ctx: &ExecutionContext,
        mut operation: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Result<T, OperationError>,
    {
        let max_attempts = policy.attempts();
        let mut attempts = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            service = key.service(),
                            operation = key.operation(),
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let class = self.classifier.classify(&error);
            let mut record = RetryAttempt {
                attempt,
                delay: None,
                class,
                error: error.to_string(),
            };

            let stop = if !class.allows_retry() {
                Some(StopReason::Permanent)
            } else if attempt >= max_attempts {
                Some(StopReason::Exhausted)
            } else {
                None
            };

            if let Some(reason) = stop {
                attempts.push(record);
                tracing::debug!(
                    service = key.service(),
                    operation = key.operation(),
                    attempt,
                    class = %class,
                    reason = %reason,
                    error = %error,
                    "Giving up on operation"
                );
                return Err(RetryFailure {
                    error,
                    class,
                    reason,
                    attempts,
                });
            }

            let delay = policy.delay_for(attempt - 1);

            if self.past_deadline(ctx, delay) {
                attempts.push(record);
                tracing::warn!(
                    service = key.service(),
                    operation = key.operation(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Next retry would pass the deadline, giving up"
                );
                return Err(RetryFailure {
                    error,
                    class,
                    reason: StopReason::DeadlineExceeded,
                    attempts,
                });
            }

            record.delay = Some(delay);
            attempts.push(record);

            if !self.sleeper.sleep(delay, ctx.cancellation()) || ctx.is_cancelled() {
                return Err(RetryFailure {
                    error,
                    class,
                    reason: StopReason::Cancelled,
                    attempts,
                });
            }

            tracing::warn!(
                service = key.service(),
                operation = key.operation(),
                attempt,
                max_retries = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying operation after transient error"
            );
        }
    }

    fn past_deadline(&self, ctx: &ExecutionContext, delay: Duration) -> bool {
        let Some(deadline) = ctx.deadline() else {
            return false;
        };

        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.clock.now().checked_add_signed(delay))
            .map_or(true, |wake_at| wake_at > deadline)
    }
}
