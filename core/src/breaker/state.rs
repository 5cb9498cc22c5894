/// Circuit breaker record and its state machine
///
/// ```text
/// Closed ──(failure_count >= failure_threshold)──▶ Open
/// Open ──(cooldown elapsed + success)──▶ HalfOpen
/// HalfOpen ──(success)──▶ Closed            failure_count = 0
/// HalfOpen ──(failure_count >= threshold)──▶ Open
/// any ──(reset)──▶ Closed                   counters and timestamps cleared
/// ```
///
/// All transitions are total functions of the record and the supplied `now`;
/// locking and persistence are the store's concern.
use crate::config::{CircuitBreakerConfig, HalfOpenPolicy};
use crate::{GuardianError, GuardianResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a breaker: a service plus an optional operation
///
/// `(svc, None)` and `(svc, Some("x"))` are distinct breakers. An empty
/// operation name is treated as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakerKey {
    service: String,
    operation: Option<String>,
}

impl BreakerKey {
    pub fn new(service: impl Into<String>, operation: Option<&str>) -> GuardianResult<Self> {
        let service = service.into().trim().to_string();
        if service.is_empty() {
            return Err(GuardianError::InvalidKey(
                "service name must not be empty".to_string(),
            ));
        }

        let operation = operation
            .map(str::trim)
            .filter(|op| !op.is_empty())
            .map(str::to_string);

        Ok(Self { service, operation })
    }

    /// Normalise a `service` or `service.operation` name the way [`new`]
    /// normalises its parts, so registrations line up with keys
    ///
    /// [`new`]: Self::new
    pub fn normalize_scope(name: &str) -> String {
        match name.split_once('.') {
            Some((service, op)) if !op.trim().is_empty() => {
                format!("{}.{}", service.trim(), op.trim())
            }
            Some((service, _)) => service.trim().to_string(),
            None => name.trim().to_string(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Cache key, e.g. `circuit_breaker:payments:charge:can_attempt`
    pub fn cache_key(&self, suffix: &str) -> String {
        let mut key = format!("circuit_breaker:{}", self.service);
        if let Some(op) = &self.operation {
            key.push(':');
            key.push_str(op);
        }
        if !suffix.is_empty() {
            key.push(':');
            key.push_str(suffix);
        }
        key
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operation {
            Some(op) => write!(f, "{}.{}", self.service, op),
            None => write!(f, "{}", self.service),
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,

    /// Dependency assumed down, calls are short-circuited
    Open,

    /// Cooldown elapsed, probing for recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = GuardianError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            other => Err(GuardianError::StorageUnavailable(format!(
                "unknown circuit state '{}'",
                other
            ))),
        }
    }
}

/// A state change produced by recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// One breaker record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub id: Uuid,
    pub service: String,
    pub operation: Option<String>,
    pub state: CircuitState,

    /// Failures since the breaker last closed or was reset
    pub failure_count: u32,

    /// Successes recorded while half-open
    pub success_count: u32,

    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_secs: u64,

    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreaker {
    /// Fresh Closed breaker with thresholds taken from `config`
    pub fn new(key: &BreakerKey, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service: key.service.clone(),
            operation: key.operation.clone(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            recovery_timeout_secs: config.recovery_timeout_secs,
            last_failure_at: None,
            opened_at: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> BreakerKey {
        BreakerKey {
            service: self.service.clone(),
            operation: self.operation.clone(),
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        crate::config::seconds(self.recovery_timeout_secs)
    }

    /// Open and still cooling down
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.state == CircuitState::Open && self.next_attempt_at.map_or(false, |t| t > now)
    }

    pub fn is_half_open(&self) -> bool {
        self.state == CircuitState::HalfOpen
    }

    pub fn is_closed(&self) -> bool {
        self.state == CircuitState::Closed
    }

    /// Whether a protected call may run right now (uncached)
    pub fn can_attempt(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.next_attempt_at.map_or(false, |t| t < now),
        }
    }

    /// Count a failure; trips to Open once the threshold is reached
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.failure_count = self.failure_count.saturating_add(1);
        self.success_count = 0;
        self.last_failure_at = Some(now);
        self.updated_at = now;

        if self.failure_count >= self.failure_threshold {
            let from = self.state;
            self.trip(now);
            return Some(Transition {
                from,
                to: CircuitState::Open,
            });
        }

        None
    }

    /// Count a success
    ///
    /// HalfOpen closes (per `policy`), Open with an elapsed cooldown moves to
    /// HalfOpen without touching `failure_count`, Closed is left alone.
    pub fn record_success(
        &mut self,
        now: DateTime<Utc>,
        policy: HalfOpenPolicy,
    ) -> Option<Transition> {
        match self.state {
            CircuitState::HalfOpen => {
                self.success_count = self.success_count.saturating_add(1);
                self.updated_at = now;

                let recovered = match policy {
                    HalfOpenPolicy::FirstSuccess => true,
                    HalfOpenPolicy::SuccessThreshold => {
                        self.success_count >= self.success_threshold
                    }
                };

                if recovered {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.opened_at = None;
                    self.next_attempt_at = None;
                    return Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                    });
                }

                None
            }
            CircuitState::Open if self.can_attempt(now) => {
                self.state = CircuitState::HalfOpen;
                self.success_count = 0;
                self.updated_at = now;
                Some(Transition {
                    from: CircuitState::Open,
                    to: CircuitState::HalfOpen,
                })
            }
            CircuitState::Open | CircuitState::Closed => None,
        }
    }

    /// Administrative reset to a clean Closed breaker
    pub fn reset(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.state;

        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure_at = None;
        self.opened_at = None;
        self.next_attempt_at = None;
        self.updated_at = now;

        (from != CircuitState::Closed).then_some(Transition {
            from,
            to: CircuitState::Closed,
        })
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.opened_at = Some(now);
        let next_attempt_at = now
            .checked_add_signed(self.recovery_timeout())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.next_attempt_at = Some(next_attempt_at);
    }
}
