//! Error types for repoqa.
//!
//! Library crates use [`RepoQaError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Failures of external collaborators (search index, language model) are
//! reported through [`BackendError`] instead, because the pipeline steps must
//! map them onto the tool error taxonomy rather than propagate them.

use std::path::PathBuf;

use crate::types::{ToolError, ToolErrorKind, codes};

/// Top-level error type for repoqa operations outside the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RepoQaError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an external service.
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Language model error (API or response parsing).
    #[error("llm error: {0}")]
    Llm(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, schema mismatch, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Malformed pipeline state (illegal phase transition, missing slot).
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Clone or fetch of a repository checkout failed.
    #[error("git error: {0}")]
    Git(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RepoQaError>;

impl RepoQaError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure reported by an external collaborator (search backend, LLM, embedder).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Transport-level failure.
    #[error("network failure: {0}")]
    Network(String),

    /// Rate or quota exhaustion.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The collaborator did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The collaborator is down or not configured for this operation.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Credentials are missing or were rejected.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// The response could not be parsed into the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The collaborator refused the request itself (unknown model, bad
    /// parameters). Repeating it cannot succeed.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Map onto the tool error taxonomy. `retryable` is the step-level default;
    /// failures that can never succeed on retry override it to `false`.
    pub fn to_tool_error(&self, retryable: bool) -> ToolError {
        let (kind, code, retryable) = match self {
            Self::Network(_) => (ToolErrorKind::Network, None, retryable),
            Self::RateLimited(_) => (ToolErrorKind::ApiLimit, None, retryable),
            Self::Timeout => (ToolErrorKind::Timeout, None, retryable),
            Self::Unavailable(_) => (
                ToolErrorKind::Execution,
                Some(codes::BACKEND_UNAVAILABLE),
                retryable,
            ),
            Self::MissingCredentials(_) => (
                ToolErrorKind::Execution,
                Some(codes::MISSING_CREDENTIALS),
                false,
            ),
            Self::InvalidResponse(_) => {
                (ToolErrorKind::Validation, Some(codes::PARSE_ERROR), false)
            }
            Self::Rejected(_) => (
                ToolErrorKind::Validation,
                Some(codes::REQUEST_REJECTED),
                false,
            ),
        };

        let mut error = ToolError::new(kind, self.to_string()).retryable(retryable);
        if let Some(code) = code {
            error = error.with_code(code);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = RepoQaError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = RepoQaError::validation("query must not be empty");
        assert!(err.to_string().contains("query must not be empty"));
    }

    #[test]
    fn backend_errors_map_to_taxonomy() {
        let err = BackendError::RateLimited("429".into()).to_tool_error(true);
        assert_eq!(err.kind, ToolErrorKind::ApiLimit);
        assert!(err.retryable);

        let err = BackendError::MissingCredentials("no key".into()).to_tool_error(true);
        assert_eq!(err.kind, ToolErrorKind::Execution);
        assert_eq!(err.code.as_deref(), Some(codes::MISSING_CREDENTIALS));
        assert!(!err.retryable);

        let err = BackendError::InvalidResponse("not json".into()).to_tool_error(true);
        assert_eq!(err.kind, ToolErrorKind::Validation);
        assert_eq!(err.code.as_deref(), Some(codes::PARSE_ERROR));
        assert!(!err.retryable);

        let err = BackendError::Rejected("HTTP 404".into()).to_tool_error(true);
        assert_eq!(err.kind, ToolErrorKind::Validation);
        assert_eq!(err.code.as_deref(), Some(codes::REQUEST_REJECTED));
        assert!(!err.retryable);
    }
}
