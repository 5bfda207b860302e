//! Error types for nga-mirror
//!
//! This module provides error handling for the whole crate:
//! - Domain-specific error variants (sandbox, scheduling, downloader, transfer)
//! - HTTP status code mapping for the API layer
//!
//! The taxonomy follows a simple rule: validation failures surface as 4xx to
//! the HTTP caller and are never recorded in topic state; downloader and
//! provider failures are recorded in topic state and never propagate out of
//! their worker.

use axum::http::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for nga-mirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nga-mirror
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "network.ua")
        key: Option<String>,
    },

    /// A path would escape its sandboxed root after cleaning
    #[error("path escapes sandbox root: {0}")]
    PathEscape(PathBuf),

    /// Invalid cron expression supplied through the lifecycle API.
    ///
    /// The display string is the exact message surfaced to HTTP callers.
    #[error("无效的 cron 表达式")]
    InvalidCron {
        /// The rejected expression, for logging
        expr: String,
    },

    /// Topic id could not be parsed or is not positive
    #[error("invalid topic id: {0}")]
    InvalidTopicId(String),

    /// Topic not present in the store
    #[error("topic {0} not found")]
    TopicNotFound(i64),

    /// Topic already present in the store
    #[error("topic {0} already exists")]
    TopicExists(i64),

    /// The refresh queue is full; the caller should back off
    #[error("too many adding requests")]
    QueueFull,

    /// Downloader invocation or bootstrap failure
    #[error("downloader error: {0}")]
    Downloader(String),

    /// Cloud-storage provider failure
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Forum user lookup failure (also used for negative-cache hits)
    #[error("user lookup failed: {0}")]
    UserLookup(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Mapping from errors to HTTP status codes for the API layer
pub trait ToHttpStatus {
    /// The status code this error should surface as
    fn to_http_status(&self) -> StatusCode;
}

impl ToHttpStatus for Error {
    fn to_http_status(&self) -> StatusCode {
        match self {
            Error::InvalidCron { .. } | Error::InvalidTopicId(_) | Error::PathEscape(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::TopicNotFound(_) => StatusCode::NOT_FOUND,
            Error::TopicExists(_) => StatusCode::CONFLICT,
            Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_cron_display_is_exact_api_message() {
        let e = Error::InvalidCron {
            expr: "xxx".to_string(),
        };
        assert_eq!(e.to_string(), "无效的 cron 表达式");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::TopicNotFound(1).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(Error::TopicExists(1).to_http_status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::QueueFull.to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::InvalidTopicId("abc".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Other("boom".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
