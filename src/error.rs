use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category assigned to a failed upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    Proxy,
    RateLimited,
    InvalidSymbol,
    Other,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Proxy | ErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Proxy => "proxy",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::InvalidSymbol => "invalid-symbol",
            ErrorKind::Other => "other",
        };
        f.write_str(label)
    }
}

/// Raw failure reported by a market data source. `kind` is set when the
/// source already knows the category; otherwise the message is classified.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub message: String,
    pub kind: Option<ErrorKind>,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("data unavailable for {request} after {attempts} attempts: {last_error}")]
    DataUnavailable {
        request: String,
        attempts: u32,
        last_error: String,
    },
    #[error("upstream rejected {request} ({kind}): {message}")]
    Fatal {
        request: String,
        kind: ErrorKind,
        message: String,
    },
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),
    #[error("invalid fetch parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("invalid indicator parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("request to {provider} failed: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} response carried no message content")]
    EmptyResponse { provider: String },
    #[error("{provider} has no usable credential")]
    MissingCredential { provider: String },
}

/// A model call that failed partway through a step sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("model call failed at step {step}: {message}")]
pub struct StepModelError {
    pub step: usize,
    pub message: String,
}

/// Why a provider run did not complete. Stored on the run result.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunError {
    #[error("provider {provider} skipped: credential missing or placeholder")]
    MissingCredential { provider: String },
    #[error(transparent)]
    StepModel(#[from] StepModelError),
    #[error("unsupported provider '{provider}'")]
    UnsupportedProvider { provider: String },
    #[error("provider task aborted: {reason}")]
    TaskAborted { reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-symbol pipeline failure. Never aborts the other symbols of a batch.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload for {0}")]
    UnexpectedPayload(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::Connection.is_transient());
        assert!(ErrorKind::Proxy.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(!ErrorKind::InvalidSymbol.is_transient());
        assert!(!ErrorKind::Other.is_transient());
    }

    #[test]
    fn test_run_error_serializes_with_tag() {
        let err = RunError::from(StepModelError {
            step: 3,
            message: "HTTP 500".to_string(),
        });
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "step_model");
        assert_eq!(json["step"], 3);
        assert_eq!(err.to_string(), "model call failed at step 3: HTTP 500");
    }
}
