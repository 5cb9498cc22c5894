/// Typed operation errors and transient/permanent classification
///
/// Protected operations report failure with an [`OperationError`]: a message,
/// an optional status code and an optional explicit [`ErrorClass`]. The
/// [`TransientClassifier`] decides retryability from those fields alone.
use crate::config::RecoveryConfig;
use crate::{GuardianError, GuardianResult};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Message of the synthetic error produced when a breaker refuses a call
pub const CIRCUIT_OPEN_MESSAGE: &str = "Circuit breaker is open";

/// Retryability of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Expected to clear up on its own; worth retrying
    Transient,

    /// Retrying will not help; fail fast
    Permanent,
}

impl ErrorClass {
    pub fn allows_retry(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure reported by a protected operation
#[derive(Error, Debug)]
#[error("{message}")]
pub struct OperationError {
    message: String,
    status_code: Option<u16>,
    class: Option<ErrorClass>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl OperationError {
    /// Error classified by the configured patterns and status codes
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            class: None,
            source: None,
        }
    }

    /// Always retried, whatever the message says
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(message).with_class(ErrorClass::Transient)
    }

    /// Never retried, whatever the message says
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(message).with_class(ErrorClass::Permanent)
    }

    /// Wrap an underlying error, keeping it as the source
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            status_code: None,
            class: None,
            source: Some(Box::new(error)),
        }
    }

    pub(crate) fn circuit_open() -> Self {
        Self::new(CIRCUIT_OPEN_MESSAGE)
    }

    /// Attach an HTTP-style status code
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Override pattern-based classification
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Explicit classification, if the operation supplied one
    pub fn class(&self) -> Option<ErrorClass> {
        self.class
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", error),
            status_code: None,
            class: None,
            source: Some(error.into()),
        }
    }
}

/// Decides whether an [`OperationError`] is worth retrying
#[derive(Debug, Clone)]
pub struct TransientClassifier {
    patterns: Vec<Regex>,
    status_codes: Vec<u16>,
}

impl TransientClassifier {
    /// Compile case-insensitive patterns
    pub fn new<I, S>(patterns: I, status_codes: Vec<u16>) -> GuardianResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| GuardianError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect::<GuardianResult<Vec<_>>>()?;

        Ok(Self {
            patterns,
            status_codes,
        })
    }

    pub fn from_config(config: &RecoveryConfig) -> GuardianResult<Self> {
        Self::new(
            &config.transient_error_patterns,
            config.transient_status_codes.clone(),
        )
    }

    /// An explicit class wins; otherwise message patterns, then status code
    pub fn classify(&self, error: &OperationError) -> ErrorClass {
        if let Some(class) = error.class() {
            return class;
        }

        let by_message = self.patterns.iter().any(|p| p.is_match(error.message()));
        let by_status = error
            .status_code()
            .map_or(false, |code| self.status_codes.contains(&code));

        if by_message || by_status {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }

    pub fn is_transient(&self, error: &OperationError) -> bool {
        self.classify(error).allows_retry()
    }
}

impl Default for TransientClassifier {
    fn default() -> Self {
        let config = RecoveryConfig::default();
        let patterns = config
            .transient_error_patterns
            .iter()
            .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
            .collect();

        Self {
            patterns,
            status_codes: config.transient_status_codes,
        }
    }
}
