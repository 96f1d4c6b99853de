//! Error types for nozomi-dl
//!
//! This module provides the error taxonomy for the library:
//! - Transport failures (transient network errors, overload, exhausted retries)
//! - Index failures (corrupt node or data-blob bytes, stale version tokens)
//! - Retrieval failures (stale obfuscation routing, failed or overloaded downloads)
//! - Local failures (configuration, I/O, archive writing)

use thiserror::Error;

/// Result type alias for nozomi-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nozomi-dl
///
/// Only exhausted retries, corrupt data, cancellation and retrieval failures are
/// meant to reach callers of the search API. Misses and malformed lookup results
/// are absorbed into empty result sets.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "retry.max_attempts")
        key: Option<String>,
    },

    /// Transport-level error (timeout, connection reset, malformed response)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The index server answered 503 (overloaded)
    #[error("service unavailable: {url}")]
    ServiceUnavailable {
        /// The URL that returned 503
        url: String,
    },

    /// The server answered with a status that is neither success nor retryable
    #[error("request to {url} failed with HTTP {status}")]
    RequestFailed {
        /// The URL that was requested
        url: String,
        /// The HTTP status code returned
        status: u16,
    },

    /// All retry attempts were used up on transient failures
    #[error("gave up on {url} after {attempts} attempts")]
    Exhausted {
        /// The URL that kept failing
        url: String,
        /// Number of attempts made
        attempts: u32,
        /// HTTP status of the last failed attempt; `None` for transport errors
        last_status: Option<u16>,
    },

    /// Malformed index node or data-blob bytes
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// A lookup miss that may be caused by an outdated version token
    #[error("index {field} may be stale")]
    StaleIndex {
        /// The index field whose traversal missed
        field: String,
    },

    /// A derived resource URL was rejected, the routing table is probably outdated
    #[error("obfuscation table is stale: HTTP {status} on {url}")]
    StaleObfuscation {
        /// The HTTP status returned by the CDN
        status: u16,
        /// The derived URL that was rejected
        url: String,
    },

    /// Retrieval failed even after refreshing the routing table
    #[error("download failed: {reason}")]
    DownloadFailed {
        /// Why the retrieval failed
        reason: String,
    },

    /// The CDN kept answering with server errors
    #[error("server overloaded (HTTP {status}) at concurrency {concurrency}, try fewer parallel downloads")]
    ServerOverloaded {
        /// The HTTP status returned by the CDN
        status: u16,
        /// The concurrency limit in effect
        concurrency: usize,
    },

    /// Malformed lookup input (bad lengths, oversized declared counts)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The obfuscation script could not be parsed
    #[error("failed to parse obfuscation script: {0}")]
    ObfuscationParse(String),

    /// An item record did not contain the expected embedded JSON
    #[error("invalid item record: {0}")]
    InvalidRecord(String),

    /// The operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL construction error
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Archive writing error
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::ServiceUnavailable { .. } => Some(503),
            Error::RequestFailed { status, .. }
            | Error::StaleObfuscation { status, .. }
            | Error::ServerOverloaded { status, .. } => Some(*status),
            Error::Exhausted { last_status, .. } => *last_status,
            Error::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Stable machine-readable code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Network(_) => "network_error",
            Error::ServiceUnavailable { .. } => "service_unavailable",
            Error::RequestFailed { .. } => "request_failed",
            Error::Exhausted { .. } => "exhausted",
            Error::CorruptIndex(_) => "corrupt_index",
            Error::StaleIndex { .. } => "stale_index",
            Error::StaleObfuscation { .. } => "stale_obfuscation",
            Error::DownloadFailed { .. } => "download_failed",
            Error::ServerOverloaded { .. } => "server_overloaded",
            Error::InvalidInput(_) => "invalid_input",
            Error::ObfuscationParse(_) => "obfuscation_parse_error",
            Error::InvalidRecord(_) => "invalid_record",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Url(_) => "url_error",
            Error::Zip(_) => "archive_error",
        }
    }
}
