/// Configuration for circuit breakers, retry/recovery, storage and logging
///
/// Configuration is an explicit value handed to the orchestrator at
/// construction. It can be built in code, or loaded in layers:
///
/// 1. Built-in defaults (every section is `#[serde(default)]`)
/// 2. An optional TOML/JSON file
/// 3. Environment variables prefixed `API_GUARDIAN`, sections separated by
///    `__` (e.g. `API_GUARDIAN__RECOVERY__MAX_RETRIES=5`)
use crate::{GuardianError, GuardianResult};
use ::config::{Config, Environment, File, FileFormat};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "API_GUARDIAN";

/// Longest accepted breaker cooldown (30 days)
pub const MAX_RECOVERY_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest accepted TTL for cached `can_attempt` decisions (1 day)
pub const MAX_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// How a half-open breaker decides it has recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// First successful probe closes the breaker; `success_threshold` is
    /// informational only
    #[default]
    FirstSuccess,

    /// Close only after `success_threshold` consecutive half-open successes
    SuccessThreshold,
}

/// Circuit breaker defaults applied to newly created breakers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// When false the orchestrator never consults or mutates breakers
    pub enabled: bool,

    /// Failures needed to trip a breaker to Open
    pub failure_threshold: u32,

    /// Half-open successes needed to close (see [`HalfOpenPolicy`])
    pub success_threshold: u32,

    /// Cooldown after opening before a probe is permitted, at most
    /// [`MAX_RECOVERY_TIMEOUT_SECS`]
    pub recovery_timeout_secs: u64,

    /// TTL of cached `can_attempt` decisions, at most [`MAX_CACHE_TTL_SECS`]
    pub cache_ttl_secs: u64,

    pub half_open_policy: HalfOpenPolicy,
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> chrono::Duration {
        seconds(self.recovery_timeout_secs)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        seconds(self.cache_ttl_secs)
    }
}

/// Whole seconds as a chrono duration, saturating at the largest
/// representable span
pub(crate) fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_secs: 60,
            cache_ttl_secs: 60,
            half_open_policy: HalfOpenPolicy::FirstSuccess,
        }
    }
}

/// Retry and fallback behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// When false the operation is attempted exactly once
    pub enabled: bool,

    /// Total attempts, including the first one
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay_ms: u64,

    /// Upper bound for any single backoff delay
    pub max_delay_ms: u64,

    pub backoff_multiplier: f64,

    /// Regexes matched case-insensitively against error messages
    pub transient_error_patterns: Vec<String>,

    /// Status codes that mark an error as transient
    pub transient_status_codes: Vec<u16>,

    /// `retry_after` hint placed in the default transient fallback payload
    pub retry_after_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            transient_error_patterns: [
                "timeout",
                "connection",
                "network",
                "temporary",
                "temporarily",
                "503",
                "502",
                "504",
                "429",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            transient_status_codes: vec![429, 502, 503, 504],
            retry_after_secs: 60,
        }
    }
}

/// Where breaker records live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local map, lost on restart
    #[default]
    Memory,

    /// SQLite database at `sqlite_path`
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Database file; `None` means an in-memory SQLite database
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub recovery: RecoveryConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl GuardianConfig {
    /// Load defaults, then the optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> GuardianResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: GuardianConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;

        tracing::debug!(
            file = ?path,
            failure_threshold = config.circuit_breaker.failure_threshold,
            recovery_timeout_secs = config.circuit_breaker.recovery_timeout_secs,
            max_retries = config.recovery.max_retries,
            storage = ?config.storage.backend,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse a TOML document (missing keys take their defaults)
    pub fn from_toml_str(toml: &str) -> GuardianResult<Self> {
        let config: GuardianConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot operate with
    pub fn validate(&self) -> GuardianResult<()> {
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be positive"));
        }
        if cb.success_threshold == 0 {
            return Err(invalid("circuit_breaker.success_threshold must be positive"));
        }
        if cb.recovery_timeout_secs == 0 {
            return Err(invalid(
                "circuit_breaker.recovery_timeout_secs must be positive",
            ));
        }
        if cb.recovery_timeout_secs > MAX_RECOVERY_TIMEOUT_SECS {
            return Err(GuardianError::InvalidConfig(format!(
                "circuit_breaker.recovery_timeout_secs must be at most {}",
                MAX_RECOVERY_TIMEOUT_SECS
            )));
        }
        if cb.cache_ttl_secs > MAX_CACHE_TTL_SECS {
            return Err(GuardianError::InvalidConfig(format!(
                "circuit_breaker.cache_ttl_secs must be at most {}",
                MAX_CACHE_TTL_SECS
            )));
        }

        let recovery = &self.recovery;
        if recovery.max_retries == 0 {
            return Err(invalid("recovery.max_retries must be at least 1"));
        }
        if !recovery.backoff_multiplier.is_finite() || recovery.backoff_multiplier < 1.0 {
            return Err(invalid("recovery.backoff_multiplier must be >= 1.0"));
        }
        if recovery.max_delay_ms < recovery.base_delay_ms {
            return Err(invalid(
                "recovery.max_delay_ms must not be smaller than recovery.base_delay_ms",
            ));
        }
        for pattern in &recovery.transient_error_patterns {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| GuardianError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
        }

        if self.logging.level.trim().is_empty() {
            return Err(invalid("logging.level must not be empty"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> GuardianError {
    GuardianError::InvalidConfig(msg.to_string())
}
