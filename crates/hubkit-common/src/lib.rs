//! # HubKit Common
//!
//! Shared error type, logging setup and retry helpers for the HubKit offline worker.
//!
//! ## Features
//!
//! - Unified error type with a category and a retry hint
//! - Logging configuration and subscriber setup
//! - Exponential backoff and timeout utilities

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for HubKit.
#[derive(Error, Debug)]
pub enum HubKitError {
    /// The network could not deliver a response.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The origin answered with a non-success status.
    #[error("Origin responded with status {0}")]
    Status(u16),

    /// Durable storage errors.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Worker lifecycle errors.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl HubKitError {
    /// Create a network error with source.
    pub fn network<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error with source.
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the same operation may succeed later. Server errors and rate
    /// limiting count; other statuses will not change on replay.
    pub fn is_retryable(&self) -> bool {
        match self {
            HubKitError::Network { .. } | HubKitError::Timeout(_) | HubKitError::Io(_) => true,
            HubKitError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            HubKitError::Network { .. } => "network",
            HubKitError::Status(_) => "status",
            HubKitError::Storage { .. } => "storage",
            HubKitError::Lifecycle(_) => "lifecycle",
            HubKitError::Config(_) => "config",
            HubKitError::Io(_) => "io",
            HubKitError::Timeout(_) => "timeout",
            HubKitError::NotFound(_) => "not_found",
            HubKitError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for HubKit operations.
pub type Result<T> = std::result::Result<T, HubKitError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_categories() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "locked");
        assert_eq!(HubKitError::storage("pending store", io).category(), "storage");
        assert_eq!(HubKitError::Status(404).category(), "status");
        assert_eq!(
            HubKitError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(HubKitError::network("fetch failed", reset).is_retryable());
        assert!(HubKitError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(HubKitError::Status(503).is_retryable());
        assert!(HubKitError::Status(429).is_retryable());
        assert!(!HubKitError::Status(400).is_retryable());
        assert!(!HubKitError::Lifecycle("not installed".into()).is_retryable());
    }

    #[test]
    fn test_source_is_kept() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = HubKitError::network("fetch failed", refused);
        assert_eq!(err.to_string(), "Network error: fetch failed");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("refused"));
    }

    #[test]
    fn test_io_converts() {
        fn read() -> Result<String> {
            Ok(std::fs::read_to_string("/nonexistent/hubkit.json")?)
        }
        assert_eq!(read().unwrap_err().category(), "io");
    }
}
