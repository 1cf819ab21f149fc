//! HTTP downloads through a private, crash-safe disk cache.
//!
//! This module provides a [`Downloader`] per remote resource. It decides
//! between serving the cached body, revalidating it, or fetching it again,
//! and hands new downloads out as a [`Stream`] that any number of readers can
//! consume while the body is written to the cache exactly once.
//!
//! # Features
//!
//! - RFC 7234 freshness (`max-age`, `Expires`, `no-cache`, `min-fresh`, `max-stale`)
//! - Conditional revalidation with `ETag` / `Last-Modified`
//! - RFC 5861 `stale-if-error` and a continue-on-error fallback
//! - Staging writes promoted by directory rename, never a half-written cache
//! - Configurable timeouts (30s connect, 5min read by default)
//!
//! # Example
//!
//! ```no_run
//! use dlcache::download::{Download, Downloader, DownloaderOptions, HttpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dl = Downloader::new(
//!     "@data",
//!     HttpClient::new()?,
//!     "https://example.com/data.csv",
//!     "/tmp/dlcache/data",
//!     DownloaderOptions::default(),
//! )?;
//! match dl.get().await? {
//!     Download::Cached(path) => println!("cached at {}", path.display()),
//!     Download::Stream(stream) => {
//!         let mut reader = stream.new_reader().ok_or("stream sealed")?;
//!         stream.seal();
//!         let body = reader.read_to_end().await?;
//!         println!("downloaded {} bytes", body.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod checksum;
mod client;
mod constants;
mod downloader;
mod error;
pub mod freshness;
mod header_file;
mod progress;
mod response_cacher;
pub mod stream;

pub use cache::{Cache, CachePaths, CachedResponse};
pub use checksum::Checksum;
pub use client::HttpClient;
pub use constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, X_FROM_CACHE, X_VARIED_PREFIX};
pub use downloader::{Download, Downloader, DownloaderOptions};
pub use error::DownloadError;
pub use freshness::{Clock, ManualClock, State, SystemClock};
pub use header_file::ResponseHead;
pub use progress::Progress;
pub use response_cacher::ResponseCacher;
pub use stream::{BodySource, ByteSource, FileSource, Reader, Stream, StreamError, WeakStream};
