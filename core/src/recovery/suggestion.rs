/// Recovery suggestions surfaced to API consumers
///
/// Advisory only: nothing in the core branches on a suggestion.
use super::classification::OperationError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Timeout,
    Connection,
    RateLimit,
    Authentication,
    Validation,
    General,
}

impl SuggestionKind {
    /// Matching order; the first keyword found in the message wins
    const PRIORITY: [SuggestionKind; 5] = [
        SuggestionKind::Timeout,
        SuggestionKind::Connection,
        SuggestionKind::RateLimit,
        SuggestionKind::Authentication,
        SuggestionKind::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionKind::Timeout => "timeout",
            SuggestionKind::Connection => "connection",
            SuggestionKind::RateLimit => "rate_limit",
            SuggestionKind::Authentication => "authentication",
            SuggestionKind::Validation => "validation",
            SuggestionKind::General => "general",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            SuggestionKind::Timeout => {
                "The operation timed out. Consider increasing the timeout or optimizing the request."
            }
            SuggestionKind::Connection => {
                "Connection to the service failed. The service may be temporarily unavailable."
            }
            SuggestionKind::RateLimit => {
                "Rate limit exceeded. Too many requests were made in a short period."
            }
            SuggestionKind::Authentication => {
                "Authentication failed. Invalid or expired credentials."
            }
            SuggestionKind::Validation => {
                "Request validation failed. The request data is invalid."
            }
            SuggestionKind::General => {
                "An unexpected error occurred. Please try again or contact support if the problem persists."
            }
        }
    }

    fn actions(&self) -> [&'static str; 3] {
        match self {
            SuggestionKind::Timeout => [
                "Try again with a longer timeout",
                "Check if the request payload can be optimized",
                "Verify network connectivity",
            ],
            SuggestionKind::Connection => [
                "Retry the operation in a few moments",
                "Check service status",
                "Verify network configuration",
            ],
            SuggestionKind::RateLimit => [
                "Wait before retrying",
                "Implement exponential backoff",
                "Consider reducing request frequency",
            ],
            SuggestionKind::Authentication => [
                "Refresh authentication tokens",
                "Verify API credentials",
                "Check token expiration",
            ],
            SuggestionKind::Validation => [
                "Check request format",
                "Validate required fields",
                "Review API documentation",
            ],
            SuggestionKind::General => [
                "Retry the operation",
                "Check service status",
                "Contact support team",
            ],
        }
    }
}

impl fmt::Display for SuggestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured suggestion, serialised as `{ "type", "message", "actions" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySuggestion {
    #[serde(rename = "type")]
    pub kind: SuggestionKind,
    pub message: String,
    pub actions: Vec<String>,
}

impl From<SuggestionKind> for RecoverySuggestion {
    fn from(kind: SuggestionKind) -> Self {
        Self {
            kind,
            message: kind.message().to_string(),
            actions: kind.actions().iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Keyword classifier over lowercased error messages
#[derive(Debug, Clone, Copy, Default)]
pub struct SuggestionGenerator;

impl SuggestionGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, message: &str) -> SuggestionKind {
        let message = message.to_lowercase();
        SuggestionKind::PRIORITY
            .into_iter()
            .find(|kind| message.contains(kind.as_str()))
            .unwrap_or(SuggestionKind::General)
    }

    pub fn suggest(&self, message: &str) -> RecoverySuggestion {
        self.classify(message).into()
    }

    pub fn for_error(&self, error: &OperationError) -> RecoverySuggestion {
        self.suggest(error.message())
    }
}
