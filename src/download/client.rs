//! HTTP transport used by the [`Downloader`](super::Downloader).
//!
//! A thin wrapper around `reqwest::Client` that owns the timeout and
//! User-Agent configuration and turns transport failures into
//! [`DownloadError`]s. It performs exactly one attempt per request; redirects
//! are followed by reqwest's default policy.

use std::time::{Duration, Instant};

use reqwest::{Client, ClientBuilder, Method, Request, Response};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// HTTP client shared by downloaders. Cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes (for large files)
    /// - No transparent decompression: cached bytes are the bytes on the wire
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Client`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeout values, in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Client`] if the client cannot be built.
    #[instrument(level = "debug")]
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, DownloadError> {
        let client = base_client_builder(connect_timeout_secs, read_timeout_secs)
            .build()
            .map_err(|source| DownloadError::Client { source })?;
        Ok(Self { client })
    }

    /// Wraps an already configured `reqwest::Client`.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Builds a bodyless request for `url`.
    #[must_use]
    pub fn request(&self, method: Method, url: &Url) -> Request {
        Request::new(method, url.clone())
    }

    /// Performs one round trip and returns the response, whatever its status.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Timeout`] if no response headers arrived in
    /// time, or [`DownloadError::Network`] for any other transport failure.
    #[instrument(skip(self, req), fields(method = %req.method(), url = %req.url()))]
    pub async fn execute(&self, req: Request) -> Result<Response, DownloadError> {
        let url = req.url().to_string();
        let start = Instant::now();
        let result = self.client.execute(req).await;
        let elapsed_ms = elapsed_millis(start.elapsed());

        match result {
            Ok(resp) => {
                debug!(
                    status = resp.status().as_u16(),
                    content_length = resp.content_length(),
                    elapsed_ms,
                    "received response"
                );
                Ok(resp)
            }
            Err(e) if e.is_timeout() => {
                debug!(elapsed_ms, "request timed out");
                Err(DownloadError::timeout(url))
            }
            Err(e) => {
                debug!(elapsed_ms, error = %e, "request failed");
                Err(DownloadError::network(url, e))
            }
        }
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn elapsed_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn base_client_builder(connect_timeout_secs: u64, read_timeout_secs: u64) -> ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .timeout(Duration::from_secs(read_timeout_secs))
        .user_agent(user_agent::default_user_agent())
}
