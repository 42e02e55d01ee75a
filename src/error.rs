//! Domain-specific error types for the streaming core
//!
//! Mirrors the error table in spec.md §7: each kind records how it is
//! classified and handled locally before (if at all) it is allowed to
//! surface to the stream's caller.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type returned by the public stream surface.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("NZB error: {0}")]
    Nzb(#[from] NzbError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("a required segment is missing from all providers: {id}")]
    SegmentMissing { id: String },

    #[error("stream is in an invalid state: {0}")]
    InvalidState(String),

    #[error("cannot safely reconstruct byte offsets for this stream: {0}")]
    InvalidData(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while executing a single segment fetch attempt against
/// one provider. See spec.md §4.3 for the classification each maps to.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("article not found: {message_id}")]
    ArticleNotFound { message_id: String },

    #[error("authentication failed on provider {provider}: {reason}")]
    AuthFailed { provider: String, reason: String },

    #[error("timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("segment incomplete: got {got} bytes, declared {declared}")]
    IncompleteSegment { got: u64, declared: u64 },

    #[error("no healthy provider available")]
    NoProviderAvailable,

    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse classification of a fetch failure (spec.md §4.3), used to decide
/// whether to retry, fail over to another provider, or give up entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorClass {
    /// Try the next provider; current provider remains eligible later.
    Transient,
    /// Disable the provider for the current operation; try next.
    Fatal,
    /// Permanent for this segment specifically; do not retry, degrade.
    Permanent,
    /// Segment is unavailable at all providers.
    Blocking,
    /// The caller's context was cancelled; propagate, do not retry.
    Cancelled,
}

impl FetchError {
    pub fn classify(&self) -> FetchErrorClass {
        match self {
            FetchError::ArticleNotFound { .. } => FetchErrorClass::Permanent,
            FetchError::AuthFailed { .. } => FetchErrorClass::Fatal,
            FetchError::Timeout { .. } | FetchError::Io(_) | FetchError::Protocol(_) => {
                FetchErrorClass::Transient
            }
            FetchError::IncompleteSegment { .. } => FetchErrorClass::Transient,
            FetchError::NoProviderAvailable => FetchErrorClass::Blocking,
            FetchError::Cancelled => FetchErrorClass::Cancelled,
        }
    }
}

/// NZB parsing and validation errors (ambient addition, see SPEC_FULL.md §3).
#[derive(Error, Debug)]
pub enum NzbError {
    #[error("failed to parse NZB document: {0}")]
    ParseError(String),

    #[error("NZB file not found: {0}")]
    NotFound(PathBuf),

    #[error("no files found in NZB")]
    EmptyNzb,

    #[error("file has no segments")]
    EmptyFile,

    #[error("invalid segment: {0}")]
    InvalidSegment(String),
}

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error(
        "operation-kind guarantees ({queue} + {health_check} + {streaming}) must equal total_connections ({total})"
    )]
    GuaranteesMismatch {
        queue: u32,
        health_check: u32,
        streaming: u32,
        total: u32,
    },
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Helper trait for adding log context to an error as it propagates.
pub trait ErrorContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<StreamError>,
{
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let error: StreamError = e.into();
            tracing::error!("{}: {}", msg.into(), error);
            error
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = NzbError::NotFound(PathBuf::from("/test/file.nzb"));
        assert_eq!(err.to_string(), "NZB file not found: /test/file.nzb");
    }

    #[test]
    fn error_conversion() {
        let nzb_err = NzbError::EmptyNzb;
        let stream_err: StreamError = nzb_err.into();
        assert!(matches!(stream_err, StreamError::Nzb(_)));
    }

    #[test]
    fn classify_article_not_found_is_permanent() {
        let err = FetchError::ArticleNotFound {
            message_id: "abc".into(),
        };
        assert_eq!(err.classify(), FetchErrorClass::Permanent);
    }

    #[test]
    fn classify_auth_failed_is_fatal() {
        let err = FetchError::AuthFailed {
            provider: "p0".into(),
            reason: "bad creds".into(),
        };
        assert_eq!(err.classify(), FetchErrorClass::Fatal);
    }

    #[test]
    fn classify_incomplete_is_transient() {
        let err = FetchError::IncompleteSegment {
            got: 10,
            declared: 100,
        };
        assert_eq!(err.classify(), FetchErrorClass::Transient);
    }
}
