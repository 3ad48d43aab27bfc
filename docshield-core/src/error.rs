use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error raised by a remote document store: a message and, when the backend
/// provides one, a machine-readable code (`unavailable`, `not-found`, `503`...).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    pub message: String,
    pub code: Option<String>,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_code("unavailable", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_code("not-found", message)
    }
}

#[derive(Error, Debug, Clone)]
pub enum AccessError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Circuit breaker is open for {name}")]
    CircuitOpen { name: String },

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, AccessError>;

impl From<serde_json::Error> for AccessError {
    fn from(err: serde_json::Error) -> Self {
        AccessError::Serialization(err.to_string())
    }
}

impl AccessError {
    /// Stable code surfaced to callers of the gateway.
    pub fn code(&self) -> &str {
        match self {
            AccessError::Store(err) => err.code.as_deref().unwrap_or_else(|| {
                if ErrorKind::classify(&err.message, None) == ErrorKind::Transient {
                    "unavailable"
                } else {
                    "unknown"
                }
            }),
            AccessError::CircuitOpen { .. } => "circuit-open",
            AccessError::NotFound { .. } => "not-found",
            AccessError::Serialization(_) => "serialization",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AccessError::Store(err) => ErrorKind::classify(&err.message, err.code.as_deref()),
            AccessError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AccessError::NotFound { .. } | AccessError::Serialization(_) => ErrorKind::Permanent,
        }
    }
}

/// Failure taxonomy driving retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, timeout, connection, unavailable, 5xx: worth retrying
    Transient,
    /// Validation, not-found, permission: surfaced immediately
    Permanent,
    /// Dependency known bad, failed fast
    CircuitOpen,
}

const TRANSIENT_MESSAGE_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "econnreset",
    "econnrefused",
    "socket hang up",
    "unavailable",
    "deadline exceeded",
    "resource exhausted",
];

const TRANSIENT_CODES: &[&str] = &[
    "unavailable",
    "deadline-exceeded",
    "resource-exhausted",
    "aborted",
    "internal",
];

impl ErrorKind {
    /// Classifies a backend failure from its message and optional code.
    pub fn classify(message: &str, code: Option<&str>) -> Self {
        if let Some(code) = code {
            let code = code.trim().to_ascii_lowercase();
            if TRANSIENT_CODES.contains(&code.as_str()) {
                return ErrorKind::Transient;
            }
            if let Ok(status) = code.parse::<u16>() {
                return if (500..600).contains(&status) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                };
            }
        }

        let message = message.to_ascii_lowercase();
        if TRANSIENT_MESSAGE_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Errors that can be recorded by the error tracker.
pub trait ReportableError: fmt::Display {
    fn code(&self) -> Option<&str> {
        None
    }

    fn stack_trace(&self) -> Option<String> {
        None
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::classify(&self.to_string(), self.code())
    }
}

impl ReportableError for StoreError {
    fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl ReportableError for AccessError {
    fn code(&self) -> Option<&str> {
        Some(AccessError::code(self))
    }

    fn kind(&self) -> ErrorKind {
        AccessError::kind(self)
    }
}

impl ReportableError for str {}

impl ReportableError for &str {}

impl ReportableError for String {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("network timeout", None, ErrorKind::Transient)]
    #[case("Connection reset by peer", None, ErrorKind::Transient)]
    #[case("boom", Some("unavailable"), ErrorKind::Transient)]
    #[case("boom", Some("deadline-exceeded"), ErrorKind::Transient)]
    #[case("boom", Some("RESOURCE-EXHAUSTED"), ErrorKind::Transient)]
    #[case("boom", Some("503"), ErrorKind::Transient)]
    #[case("boom", Some("404"), ErrorKind::Permanent)]
    #[case("validation failed: name required", None, ErrorKind::Permanent)]
    #[case("permission denied", Some("permission-denied"), ErrorKind::Permanent)]
    fn classifies_failures(
        #[case] message: &str,
        #[case] code: Option<&str>,
        #[case] expected: ErrorKind,
    ) {
        assert_eq!(ErrorKind::classify(message, code), expected);
    }

    #[test]
    fn access_error_codes_are_stable() {
        let open = AccessError::CircuitOpen {
            name: "orders:findById".to_string(),
        };
        assert_eq!(open.code(), "circuit-open");
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);

        let coded = AccessError::from(StoreError::with_code("permission-denied", "nope"));
        assert_eq!(coded.code(), "permission-denied");

        let transient = AccessError::from(StoreError::new("network timeout"));
        assert_eq!(transient.code(), "unavailable");
        assert!(transient.kind().is_retryable());

        let not_found = AccessError::NotFound {
            collection: "orders".to_string(),
            id: "o-1".to_string(),
        };
        assert_eq!(not_found.code(), "not-found");
        assert!(!not_found.kind().is_retryable());
    }

    #[test]
    fn store_error_displays_message() {
        let err = StoreError::unavailable("backend down");
        assert_eq!(err.to_string(), "backend down");
        assert_eq!(ReportableError::code(&err), Some("unavailable"));
    }
}
