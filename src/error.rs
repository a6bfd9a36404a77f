use std::time::Duration;
use thiserror::Error;

/// Errors produced by the engine and its components.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid or missing configuration detected at build or load time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Source I/O failure: missing resource, authorization, bad selector.
    #[error("connector error ({kind:?}): {message}")]
    Connector {
        /// Classified failure cause.
        kind: ConnectorErrorKind,
        /// Human-readable description, includes the resource URI where known.
        message: String,
    },

    /// Unit iteration, interpolation, or parsing failure.
    #[error("processing failed: {0}")]
    Processing(String),

    /// Provider I/O, streaming failure, deadline exceeded.
    #[error("inference failed: {message}")]
    Inference {
        /// Description of the failure.
        message: String,
        /// Provider HTTP status, when one was observed.
        status_code: Option<u16>,
    },

    /// Provider capability mismatch (e.g. streaming required but unsupported).
    #[error("provider error: {0}")]
    Provider(String),

    /// Sink write failure.
    #[error("export failed: {0}")]
    Export(String),

    /// Secret resolution failure.
    #[error("secret resolution failed: {0}")]
    Secret(String),

    /// The run was cancelled via the cancellation flag.
    #[error("run was cancelled")]
    Cancelled,

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Provider`](crate::provider::Provider) implementations when
    /// the endpoint returns a non-success status code. The `retry_after` field
    /// is populated from the `Retry-After` response header when present.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization failed at the serde level.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classified connector failure causes, used for retry and exit-code decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorErrorKind {
    /// The selector matched no resource, or the resource vanished.
    NotFound,
    /// The caller lacks permission on the resource.
    Permission,
    /// A transient failure that may succeed on retry.
    Transient,
    /// The selector itself is malformed.
    InvalidSelector,
}

impl EngineError {
    /// Shorthand for an [`EngineError::Inference`] without a status code.
    pub fn inference(message: impl Into<String>) -> Self {
        EngineError::Inference {
            message: message.into(),
            status_code: None,
        }
    }

    /// Shorthand for a connector error of the given kind.
    pub fn connector(kind: ConnectorErrorKind, message: impl Into<String>) -> Self {
        EngineError::Connector {
            kind,
            message: message.into(),
        }
    }

    /// The HTTP status associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            EngineError::Http { status, .. } => Some(*status),
            EngineError::Inference { status_code, .. } => *status_code,
            EngineError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Stable process exit class for this error kind.
    ///
    /// Run-level failures map deterministically: config=2, secret=3,
    /// connector=4, processing=5, inference/provider=6, export=7.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 2,
            EngineError::Secret(_) => 3,
            EngineError::Connector { .. } => 4,
            EngineError::Processing(_) | EngineError::Json(_) => 5,
            EngineError::Inference { .. }
            | EngineError::Provider(_)
            | EngineError::Cancelled
            | EngineError::Http { .. }
            | EngineError::Request(_) => 6,
            EngineError::Export(_) => 7,
        }
    }

    /// Short kind tag used in per-unit error records and counters.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Connector { .. } => "connector",
            EngineError::Processing(_) | EngineError::Json(_) => "processing",
            EngineError::Inference { .. } | EngineError::Http { .. } | EngineError::Request(_) => {
                "inference"
            }
            EngineError::Provider(_) => "provider",
            EngineError::Export(_) => "export",
            EngineError::Secret(_) => "secret",
            EngineError::Cancelled => "cancelled",
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Processing(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(EngineError::Config("x".into()).exit_code(), 2);
        assert_eq!(EngineError::Secret("x".into()).exit_code(), 3);
        assert_eq!(
            EngineError::connector(ConnectorErrorKind::NotFound, "x").exit_code(),
            4
        );
        assert_eq!(EngineError::Processing("x".into()).exit_code(), 5);
        assert_eq!(EngineError::inference("x").exit_code(), 6);
        assert_eq!(EngineError::Provider("x".into()).exit_code(), 6);
        assert_eq!(EngineError::Export("x".into()).exit_code(), 7);
    }

    #[test]
    fn test_status_code_from_http_error() {
        let err = EngineError::Http {
            status: 429,
            body: "rate limited".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.status_code(), Some(429));
    }

    #[test]
    fn test_status_code_from_inference_error() {
        let err = EngineError::Inference {
            message: "boom".into(),
            status_code: Some(503),
        };
        assert_eq!(err.status_code(), Some(503));
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(EngineError::Cancelled.kind_tag(), "cancelled");
        assert_eq!(EngineError::inference("x").kind_tag(), "inference");
        assert_eq!(EngineError::Provider("x".into()).kind_tag(), "provider");
    }
}
