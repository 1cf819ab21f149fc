//! dlcache library
//!
//! Fetches a remote file over HTTP through a private, single-consumer disk
//! cache, and lets callers start reading a new download before it has been
//! written to the cache.
//!
//! # Architecture
//!
//! - [`download::freshness`] - cache-control parsing, freshness and `Vary` rules
//! - [`download::Cache`] - on-disk layout, consistency checks, staging promotion
//! - [`download::ResponseCacher`] - tees a response body into the staging cache
//! - [`download::Stream`] - one body, many independently paced readers
//! - [`download::Downloader`] - the decision logic tying them together

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
mod user_agent;

// Re-export commonly used types
pub use download::{
    Download, DownloadError, Downloader, DownloaderOptions, HttpClient, State, Stream, StreamError,
};
