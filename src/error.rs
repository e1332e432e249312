//! Failure taxonomy shared by capabilities, the sampler and cleanup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Binance-style API code for "unknown order sent".
pub const API_CODE_UNKNOWN_ORDER: i64 = -2011;
/// Binance-style API code for "account has insufficient balance".
pub const API_CODE_INSUFFICIENT_BALANCE: i64 = -2010;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Timeout,
    ConnectionError,
    ApiError,
    ParseError,
    NotFound,
    InsufficientFunds,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionError => "connection",
            FailureKind::ApiError => "api",
            FailureKind::ParseError => "parse",
            FailureKind::NotFound => "not_found",
            FailureKind::InsufficientFunds => "insufficient_funds",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure with the original error text retained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Typed errors raised by capability implementations.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("api error (code {code:?}): {message}")]
    Api { code: Option<i64>, message: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("{0} is not supported by this venue")]
    Unsupported(&'static str),
}

impl CapabilityError {
    /// Builds an API error, promoting the codes that have a dedicated kind.
    pub fn api(code: Option<i64>, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Some(API_CODE_UNKNOWN_ORDER) => CapabilityError::NotFound(message),
            Some(API_CODE_INSUFFICIENT_BALANCE) => CapabilityError::InsufficientFunds(message),
            _ => CapabilityError::Api { code, message },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            CapabilityError::Timeout(_) => FailureKind::Timeout,
            CapabilityError::Connection(_) => FailureKind::ConnectionError,
            CapabilityError::Api { .. } => FailureKind::ApiError,
            CapabilityError::Parse(_) => FailureKind::ParseError,
            CapabilityError::NotFound(_) => FailureKind::NotFound,
            CapabilityError::InsufficientFunds(_) => FailureKind::InsufficientFunds,
            CapabilityError::Unsupported(_) => FailureKind::Unknown,
        }
    }
}

const CONNECTION_KEYWORDS: [&str; 6] = [
    "connection",
    "socket",
    "network",
    "disconnect",
    "reset",
    "broken",
];

/// Classifies an operation error into the failure taxonomy.
///
/// Typed causes anywhere in the chain win over message heuristics; anything left
/// over becomes `Unknown` with the full message kept.
pub fn classify(err: &anyhow::Error) -> FailureReason {
    let message = format!("{err:#}");
    for cause in err.chain() {
        if let Some(kind) = classify_cause(cause) {
            return FailureReason::new(kind, message);
        }
    }
    FailureReason::new(classify_message(&message), message)
}

fn classify_cause(cause: &(dyn std::error::Error + 'static)) -> Option<FailureKind> {
    if let Some(e) = cause.downcast_ref::<CapabilityError>() {
        return Some(e.kind());
    }
    if cause.is::<tokio::time::error::Elapsed>() {
        return Some(FailureKind::Timeout);
    }
    if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
        return Some(if e.is_timeout() {
            FailureKind::Timeout
        } else if e.is_connect() || e.is_request() {
            FailureKind::ConnectionError
        } else if e.is_decode() {
            FailureKind::ParseError
        } else if e.status().map(|s| s.as_u16()) == Some(404) {
            FailureKind::NotFound
        } else {
            FailureKind::ApiError
        });
    }
    if cause.is::<tokio_tungstenite::tungstenite::Error>() {
        return Some(FailureKind::ConnectionError);
    }
    if cause.is::<serde_json::Error>() {
        return Some(FailureKind::ParseError);
    }
    if let Some(e) = cause.downcast_ref::<std::io::Error>() {
        return Some(match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => FailureKind::Timeout,
            _ => FailureKind::ConnectionError,
        });
    }
    None
}

fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        FailureKind::Timeout
    } else if lower.contains("insufficient") {
        FailureKind::InsufficientFunds
    } else if lower.contains("not found") || lower.contains("unknown order") {
        FailureKind::NotFound
    } else if CONNECTION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FailureKind::ConnectionError
    } else {
        FailureKind::Unknown
    }
}
