//! Error types for Lorepath.
//!
//! Library crates use [`LorepathError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Lorepath operations.
#[derive(Debug, thiserror::Error)]
pub enum LorepathError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while polling a source or calling a provider.
    #[error("network error: {0}")]
    Network(String),

    /// AI provider failure (rate limit, 5xx, malformed response).
    #[error("provider error: {0}")]
    Provider(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed payload, missing required field, invalid value.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// No decoder for the source format, or undecodable bytes.
    #[error("decode error: {0}")]
    Decode(String),

    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An administrative precondition was violated.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The embedding provider returned no vector.
    #[error("empty embedding for {0}")]
    EmptyEmbedding(String),

    /// File-system watch registration failure.
    #[error("watch error: {0}")]
    Watch(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LorepathError>;

impl LorepathError {
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

    /// Create a conflict (precondition violation) error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given entity kind.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a job failing with this error should be attempted again.
    ///
    /// Transient failures (network, provider, storage, I/O) are retried;
    /// validation, not-found, decode, conflict and empty-embedding failures
    /// fail the job immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Provider(_) | Self::Storage(_) | Self::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LorepathError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = LorepathError::not_found("job", "abc");
        assert_eq!(err.to_string(), "job not found: abc");

        let err = LorepathError::conflict("only pending jobs can be cancelled");
        assert!(err.to_string().contains("only pending jobs"));
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(LorepathError::Network("timeout".into()).is_retryable());
        assert!(LorepathError::Provider("429".into()).is_retryable());
        assert!(LorepathError::Storage("locked".into()).is_retryable());
        assert!(!LorepathError::validation("missing source").is_retryable());
        assert!(!LorepathError::not_found("nugget", "x").is_retryable());
        assert!(!LorepathError::EmptyEmbedding("n1".into()).is_retryable());
        assert!(!LorepathError::Decode("pdf".into()).is_retryable());
    }
}
