//! Error types for storysync.
//!
//! Library crates use [`StorySyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only [`StorySyncError::Config`] is fatal to a run; every other variant is
//! isolated to the unit, entity, or publish step that produced it.

use std::path::PathBuf;

/// Top-level error type for all storysync operations.
#[derive(Debug, thiserror::Error)]
pub enum StorySyncError {
    /// Missing or invalid configuration. Raised before any network activity.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network failure or timeout while fetching a source page.
    #[error("transport error: {url}: {message}")]
    Transport { url: String, message: String },

    /// The source answered with a non-success HTTP status.
    #[error("transport error: {url}: HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// Expected content was absent from a fetched page.
    #[error("structure error: {url}: {message}")]
    Structure { url: String, message: String },

    /// A unit page was fetched but yielded zero assets.
    #[error("empty content: {url}")]
    EmptyContent { url: String },

    /// Publishing to the downstream sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed snapshot, bad URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StorySyncError>;

impl StorySyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a transport error for `url`.
    pub fn transport(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a structure error for `url`.
    pub fn structure(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Structure {
            url: url.into(),
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

    /// Whether the fetch layer should try the operation again.
    ///
    /// Server-side statuses (5xx) and throttling (429) are transient; any
    /// other status, including 404, is a definitive answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short machine-readable label, used in the skip log and run stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Transport { .. } | Self::HttpStatus { .. } => "transport",
            Self::Structure { .. } => "structure",
            Self::EmptyContent { .. } => "empty_content",
            Self::Sink(_) => "sink",
            Self::Storage(_) => "storage",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = StorySyncError::config("no sink configured");
        assert_eq!(err.to_string(), "config error: no sink configured");

        let err = StorySyncError::HttpStatus {
            url: "https://example.com/a".into(),
            status: 503,
        };
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn retry_classification() {
        assert!(StorySyncError::transport("u", "timed out").is_retryable());
        assert!(
            StorySyncError::HttpStatus {
                url: "u".into(),
                status: 502
            }
            .is_retryable()
        );
        assert!(
            StorySyncError::HttpStatus {
                url: "u".into(),
                status: 429
            }
            .is_retryable()
        );
        assert!(
            !StorySyncError::HttpStatus {
                url: "u".into(),
                status: 404
            }
            .is_retryable()
        );
        assert!(!StorySyncError::EmptyContent { url: "u".into() }.is_retryable());
        assert!(!StorySyncError::structure("u", "no title").is_retryable());
    }

    #[test]
    fn kind_labels() {
        assert_eq!(StorySyncError::EmptyContent { url: "u".into() }.kind(), "empty_content");
        assert_eq!(
            StorySyncError::HttpStatus {
                url: "u".into(),
                status: 500
            }
            .kind(),
            "transport"
        );
    }
}
