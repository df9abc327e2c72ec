//! Error types for the fetch pipeline
//!
//! Every component reports failures through [`FetchError`]. The type is
//! `Clone` because a single deduplicated network call fans its outcome out to
//! every waiting caller.

use std::time::Duration;
use thiserror::Error;

/// Main error type for fetch operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Endpoint circuit is open and no fallback satisfied the request
    #[error("Circuit open for {endpoint}: retry in {}ms", retry_after.as_millis())]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    /// Deduplicated call exceeded the configured timeout
    #[error("Request timed out after {timeout_ms}ms: {key}")]
    RequestTimeout { key: String, timeout_ms: u64 },

    /// Transport-level failure (connection refused, DNS, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Persistent tier write failed even after eviction
    #[error("Cache write error: {0}")]
    CacheWrite(String),

    /// Internal fault while deriving a cache key
    #[error("Key build error: {0}")]
    KeyBuild(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Coarse classification for caller-facing handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Service unavailable, retry later
    ServiceUnavailable,
    /// The request itself failed (network, HTTP status, timeout)
    RequestFailed,
    /// Local fault (serialization, configuration, ...)
    Internal,
}

impl FetchError {
    /// Classify the error so a UI can pick between "retry later" and "request failed"
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::CircuitOpen { .. } => ErrorKind::ServiceUnavailable,
            FetchError::RequestTimeout { .. } | FetchError::Network(_) | FetchError::Http { .. } => {
                ErrorKind::RequestFailed
            }
            _ => ErrorKind::Internal,
        }
    }

    /// Remaining wait time when the error is a short-circuited call
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, FetchError::CircuitOpen { .. })
    }
}

/// Result type alias for fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;

impl From<String> for FetchError {
    fn from(s: String) -> Self {
        FetchError::Other(s)
    }
}

impl From<&str> for FetchError {
    fn from(s: &str) -> Self {
        FetchError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = FetchError::Network("connection refused".to_string());
        assert_eq!(error.to_string(), "Network error: connection refused");

        let timeout_error = FetchError::RequestTimeout {
            key: "/api/feed|method:GET".to_string(),
            timeout_ms: 30_000,
        };
        assert!(timeout_error.to_string().contains("timed out after 30000ms"));

        let open = FetchError::CircuitOpen {
            endpoint: "/api/feed".to_string(),
            retry_after: Duration::from_millis(1500),
        };
        assert!(open.to_string().contains("retry in 1500ms"));
    }

    #[test]
    fn test_error_kind() {
        let open = FetchError::CircuitOpen {
            endpoint: "/api/feed".to_string(),
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(open.kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(open.retry_after(), Some(Duration::from_secs(1)));

        let http = FetchError::Http {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(http.kind(), ErrorKind::RequestFailed);
        assert!(http.retry_after().is_none());

        assert_eq!(
            FetchError::SerializationError("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_error_conversion() {
        let error: FetchError = "test error".into();
        assert!(matches!(error, FetchError::Other(_)));

        let error: FetchError = "test error".to_string().into();
        assert!(matches!(error, FetchError::Other(_)));

        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: FetchError = parse_err.into();
        assert!(matches!(error, FetchError::SerializationError(_)));
    }
}
