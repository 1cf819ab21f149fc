//! Constants for the download module (timeouts, cache layout, marker headers).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Subdirectory holding the durable cache.
pub const MAIN_DIR: &str = "main";

/// Subdirectory holding an in-progress cache write.
pub const STAGING_DIR: &str = "staging";

/// Response header file name inside `main`/`staging`.
pub const HEADER_FILE: &str = "header";

/// Response body file name inside `main`/`staging`.
pub const BODY_FILE: &str = "body";

/// Fingerprint file name inside `main`/`staging`.
pub const CHECKSUMS_FILE: &str = "checksums.txt";

/// Header added to responses that were loaded from the cache.
pub const X_FROM_CACHE: &str = "X-From-Stream";

/// Prefix for the synthetic headers recording request values named in `Vary`.
pub const X_VARIED_PREFIX: &str = "X-Varied-";
