//! Error types for the download module.
//!
//! This module defines structured errors for all download and cache
//! operations, providing context-rich error messages for debugging and
//! user feedback.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while fetching or caching a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before response headers were received.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The server answered with a status other than 200 (or 304 on revalidation).
    #[error("unexpected HTTP status {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error outside the cache directory.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// File system error inside the cache directory.
    #[error("cache error in {dir}: {source}")]
    Cache {
        /// The cache directory.
        dir: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A cached header file could not be parsed back into a response.
    #[error("invalid cached header file {path}: {reason}")]
    HeaderFile {
        /// Path of the header file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The request demanded `only-if-cached` but nothing usable was cached.
    #[error("HTTP 504 Gateway Timeout: {url} is not cached (only-if-cached)")]
    GatewayTimeout {
        /// The requested URL.
        url: String,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid download URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Cache subdirectories are not on the same device as the cache root,
    /// so staging cannot be promoted with an atomic rename.
    #[error("cache dir {cache_dir} and {path} are on different devices")]
    CrossDevice {
        /// The cache root directory.
        cache_dir: PathBuf,
        /// The offending subdirectory.
        path: PathBuf,
    },

    /// Caching is disabled for this downloader.
    #[error("cache doesn't exist for: {url}")]
    CacheDisabled {
        /// The download URL.
        url: String,
    },

    /// No valid cache entry exists.
    #[error("no cache for: {url}")]
    NotCached {
        /// The download URL.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    Client {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a cache IO error.
    pub fn cache(dir: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Cache {
            dir: dir.into(),
            source,
        }
    }

    /// Creates a header file parse error.
    pub fn header_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::HeaderFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns true if this is a transport failure or a 5xx response, the
    /// class of errors `stale-if-error` covers.
    #[must_use]
    pub fn is_transport_or_server(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// No `From<reqwest::Error>` or `From<std::io::Error>`: every variant needs the url or path.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/file.csv");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/file.csv"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/file.csv", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(
            msg.contains("https://example.com/file.csv"),
            "Expected URL in: {msg}"
        );
    }

    #[test]
    fn test_download_error_cache_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::cache(PathBuf::from("/tmp/dlcache"), io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/dlcache"), "Expected dir in: {msg}");
        assert!(msg.contains("access denied"), "Expected cause in: {msg}");
    }

    #[test]
    fn test_download_error_invalid_url_display() {
        let error = DownloadError::invalid_url("not-a-url");
        let msg = error.to_string();
        assert!(msg.contains("invalid download URL"), "got: {msg}");
        assert!(msg.contains("not-a-url"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_transport_or_server_classification() {
        assert!(DownloadError::timeout("u").is_transport_or_server());
        assert!(DownloadError::http_status("u", 503).is_transport_or_server());
        assert!(DownloadError::http_status("u", 500).is_transport_or_server());
        assert!(!DownloadError::http_status("u", 404).is_transport_or_server());
        assert!(!DownloadError::invalid_url("u").is_transport_or_server());
    }

    #[test]
    fn test_gateway_timeout_mentions_only_if_cached() {
        let error = DownloadError::GatewayTimeout {
            url: "https://example.com/a".to_string(),
        };
        assert!(error.to_string().contains("only-if-cached"));
        assert!(error.to_string().contains("504"));
    }
}
