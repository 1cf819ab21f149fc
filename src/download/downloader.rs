//! The [`Downloader`]: one remote resource, one cache directory.
//!
//! [`Downloader::get`] either returns the path of a usable cached body, or a
//! [`Stream`] of a download in progress. The cache is only updated once that
//! stream has been read to the end: every reader sees end of stream only after
//! the new body has been promoted into place. A stream that is abandoned or
//! fails leaves the previous cache untouched.
//!
//! Decision order for each call:
//!
//! 1. A fresh cache whose `Vary` headers match is served without touching
//!    the network.
//! 2. A stale cache whose `Vary` headers match is revalidated with
//!    `If-None-Match` / `If-Modified-Since`; a `304` refreshes only the
//!    header file.
//! 3. If the origin fails (transport error or `5xx`) and `stale-if-error`
//!    allows it, the stale cache is served.
//! 4. Any other failure falls back to the cache when `continue_on_error` is
//!    set, and is returned otherwise.
//! 5. A storable `200` is teed into the staging cache while it is streamed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::header::{
    ETAG, HeaderMap, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RANGE, VARY,
};
use reqwest::{Method, Request, Response, StatusCode};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::cache::{Cache, CachedResponse};
use super::checksum::Checksum;
use super::client::HttpClient;
use super::error::DownloadError;
use super::freshness::{
    Clock, State, SystemClock, can_stale_on_error, can_store, clone_request,
    get_end_to_end_headers, get_freshness, header_all_comma_sep_values, parse_cache_control,
    varied_header_name, vary_matches,
};
use super::header_file::ResponseHead;
use super::progress::{Progress, ProgressSource};
use super::stream::{BodySource, ByteSource, FileSource, Stream, WeakStream};

/// Outcome of [`Downloader::get`].
#[derive(Debug)]
pub enum Download {
    /// Path of the cached body on disk. It may be stale if a refresh failed
    /// and a fallback policy allowed serving it.
    Cached(PathBuf),
    /// A download in progress.
    Stream(Stream),
}

impl Download {
    #[must_use]
    pub fn cached_path(&self) -> Option<&Path> {
        match self {
            Self::Cached(path) => Some(path),
            Self::Stream(_) => None,
        }
    }

    #[must_use]
    pub fn into_stream(self) -> Option<Stream> {
        match self {
            Self::Stream(stream) => Some(stream),
            Self::Cached(_) => None,
        }
    }
}

/// Policy switches for a [`Downloader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloaderOptions {
    /// Read from and write to the disk cache at all.
    pub cache: bool,
    /// Serve a cached body, possibly stale, when a refresh fails.
    pub continue_on_error: bool,
    /// Add `X-From-Stream: 1` to heads loaded from the cache.
    pub mark_cached_responses: bool,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            cache: true,
            continue_on_error: true,
            mark_cached_responses: true,
        }
    }
}

/// Fetches a single URL through a private on-disk cache.
///
/// Calls on one `Downloader` are serialized; separate downloaders are
/// independent. The lock covers the cache decision and the request, not the
/// draining of a returned stream. While a returned stream is still writing
/// the cache, later calls stream their response without caching it.
pub struct Downloader {
    name: String,
    url: Url,
    dir: PathBuf,
    client: HttpClient,
    cache: Option<Cache>,
    continue_on_error: bool,
    mark_cached_responses: bool,
    clock: Arc<dyn Clock>,
    progress: Progress,
    lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<InFlight>,
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("name", &self.name)
            .field("url", &self.url.as_str())
            .field("dir", &self.dir)
            .field("cache", &self.cache.is_some())
            .field("continue_on_error", &self.continue_on_error)
            .finish_non_exhaustive()
    }
}

/// Streams handed out by `get`, held weakly so a dropped stream releases its source.
#[derive(Default)]
struct InFlight {
    last: Option<WeakStream>,
    /// The stream that tees into the staging cache.
    cache_writer: Option<WeakStream>,
}

fn live(stream: Option<&WeakStream>) -> Option<Stream> {
    stream?.upgrade().filter(|stream| !stream.is_filled())
}

/// The body to hand out and the head it belongs to.
enum Effective {
    /// The cached response, refreshed by a `304`.
    Reused(CachedResponse),
    /// A new `200` from the origin.
    Live(Response),
}

impl Downloader {
    /// Creates a downloader for `url` caching into `dir`.
    ///
    /// `name` is a short label for logs and progress bars. `dir` is made
    /// absolute but not created; it appears on the first cache write.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] unless `url` is an absolute
    /// http(s) URL, and [`DownloadError::CrossDevice`] if an existing cache
    /// subdirectory lives on another device than `dir`.
    pub fn new(
        name: impl Into<String>,
        client: HttpClient,
        url: &str,
        dir: impl AsRef<Path>,
        options: DownloaderOptions,
    ) -> Result<Self, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") || !parsed.has_host() {
            return Err(DownloadError::invalid_url(url));
        }
        let dir = std::path::absolute(dir.as_ref())
            .map_err(|e| DownloadError::io(dir.as_ref(), e))?;

        let cache = options.cache.then(|| Cache::new(&dir));
        if let Some(cache) = &cache {
            cache.check_same_device()?;
        }

        Ok(Self {
            name: name.into(),
            url: parsed,
            dir,
            client,
            cache,
            continue_on_error: options.continue_on_error,
            mark_cached_responses: options.mark_cached_responses,
            clock: Arc::new(SystemClock),
            progress: Progress::default(),
            lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(InFlight::default()),
        })
    }

    /// Replaces the time source used for freshness.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Draws progress for requests and bodies.
    #[must_use]
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetches the resource. See the module docs for the decision order.
    ///
    /// # Errors
    ///
    /// Returns the transport or status error when no fallback applies,
    /// [`DownloadError::GatewayTimeout`] for `only-if-cached` without a
    /// cache, or a cache I/O error.
    pub async fn get(&self) -> Result<Download, DownloadError> {
        self.get_with(HeaderMap::new()).await
    }

    /// Like [`get`](Self::get), with extra request headers such as
    /// `Cache-Control`, `Accept` or `Range`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    #[instrument(skip(self, headers), fields(name = %self.name, url = %self.url))]
    pub async fn get_with(&self, headers: HeaderMap) -> Result<Download, DownloadError> {
        let _guard = self.lock.lock().await;
        debug!("get download");
        let (download, caching) = self.get_locked(self.request(headers)).await?;
        if let Download::Stream(stream) = &download {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight.last = Some(stream.downgrade());
            if caching {
                in_flight.cache_writer = Some(stream.downgrade());
            }
        }
        Ok(download)
    }

    /// Cache state for a plain GET, without touching the network.
    pub async fn state(&self) -> State {
        self.state_with(&HeaderMap::new()).await
    }

    /// Cache state for a GET carrying `headers`.
    pub async fn state_with(&self, headers: &HeaderMap) -> State {
        let _guard = self.lock.lock().await;
        self.state_for(&self.request(headers.clone())).await
    }

    /// Path of the cached body, if a valid cache exists.
    ///
    /// While a returned stream is still being read this may be the previous
    /// download; wait on [`Stream::filled`] first to see the new one.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::CacheDisabled`] or [`DownloadError::NotCached`].
    pub async fn cache_file(&self) -> Result<PathBuf, DownloadError> {
        let _guard = self.lock.lock().await;
        let Some(cache) = &self.cache else {
            return Err(DownloadError::CacheDisabled {
                url: self.url.to_string(),
            });
        };
        if !cache.exists(&Method::GET).await {
            return Err(DownloadError::NotCached {
                url: self.url.to_string(),
            });
        }
        Ok(cache.paths(&Method::GET).body)
    }

    /// The fingerprint stored for the cached body, if any.
    pub async fn checksum(&self) -> Option<Checksum> {
        let _guard = self.lock.lock().await;
        self.cache.as_ref()?.cached_checksum(&Method::GET).await
    }

    /// Deletes the cache. A no-op when caching is disabled.
    ///
    /// # Errors
    ///
    /// Returns the failure to delete or recreate the cache directory.
    pub async fn clear(&self) -> Result<(), DownloadError> {
        let _guard = self.lock.lock().await;
        match &self.cache {
            Some(cache) => cache.clear().await,
            None => Ok(()),
        }
    }

    /// The last stream handed out by [`get`](Self::get), while its source is
    /// still being read and the caller still holds it or one of its readers.
    #[must_use]
    pub fn in_flight(&self) -> Option<Stream> {
        live(
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last
                .as_ref(),
        )
    }

    /// Whether a returned stream is still writing the staging cache.
    fn cache_write_in_flight(&self) -> bool {
        live(
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cache_writer
                .as_ref(),
        )
        .is_some()
    }

    fn request(&self, headers: HeaderMap) -> Request {
        let mut req = self.client.request(Method::GET, &self.url);
        req.headers_mut().extend(headers);
        req
    }

    fn is_cacheable(&self, req: &Request) -> bool {
        self.cache.is_some()
            && matches!(*req.method(), Method::GET | Method::HEAD)
            && !req.headers().contains_key(RANGE)
    }

    async fn state_for(&self, req: &Request) -> State {
        let Some(cache) = self.cache.as_ref().filter(|_| self.is_cacheable(req)) else {
            return State::Uncached;
        };
        if !cache.exists(req.method()).await {
            return State::Uncached;
        }
        match cache.read_head(req.method()).await {
            // The stored variant answers a different request.
            Ok(head) if !vary_matches(&head.headers, req.headers()) => State::Uncached,
            Ok(head) => get_freshness(&head.headers, req.headers(), self.clock.as_ref()),
            Err(e) => {
                error!(error = %e, "failed to read cached response header");
                State::Uncached
            }
        }
    }

    /// Returns the download and whether it tees into the staging cache.
    async fn get_locked(&self, req: Request) -> Result<(Download, bool), DownloadError> {
        let method = req.method().clone();
        let fp_body = self.cache.as_ref().map(|c| c.paths(&method).body);

        let state = self.state_for(&req).await;
        if state == State::Fresh
            && let Some(fp) = &fp_body
        {
            debug!(%state, path = %fp.display(), "serving fresh cached download");
            return Ok((Download::Cached(fp.clone()), false));
        }

        let cacheable = self.is_cacheable(&req);
        let mut cached = None;
        if cacheable && let Some(cache) = &self.cache {
            match cache.get(&method, self.mark_cached_responses).await {
                Ok(found) => cached = found,
                Err(e) => warn!(error = %e, "ignoring unreadable cached response"),
            }
        }

        let (req, effective) = match (cached, &fp_body) {
            (Some(cached), Some(fp_body)) => {
                match self.refresh(req, cached, fp_body).await? {
                    Ok(refreshed) => refreshed,
                    Err(path) => return Ok((Download::Cached(path), false)),
                }
            }
            _ => {
                if parse_cache_control(req.headers()).contains_key("only-if-cached") {
                    return Err(DownloadError::GatewayTimeout {
                        url: self.url.to_string(),
                    });
                }
                let outcome = self.execute(clone_request(&req)).await;
                match self.accept_status(&method, outcome).await {
                    Ok(resp) => (req, Effective::Live(resp)),
                    Err(Ok(path)) => return Ok((Download::Cached(path), false)),
                    Err(Err(e)) => return Err(e),
                }
            }
        };

        self.finish(&req, effective, cacheable).await
    }

    /// Revalidates or refetches against an existing cache.
    ///
    /// `Ok(Err(path))` means the cached body should be served as is.
    async fn refresh(
        &self,
        req: Request,
        mut cached: CachedResponse,
        fp_body: &Path,
    ) -> Result<Result<(Request, Effective), PathBuf>, DownloadError> {
        let mut req = req;
        if vary_matches(&cached.head.headers, req.headers()) {
            match get_freshness(&cached.head.headers, req.headers(), self.clock.as_ref()) {
                State::Fresh => return Ok(Err(fp_body.to_path_buf())),
                State::Stale => req = with_validators(req, &cached.head.headers),
                State::Uncached | State::Transparent => {}
            }
        } else {
            debug!("cached response does not match request Vary headers");
        }

        let method = req.method().clone();
        let outcome = self.execute(clone_request(&req)).await;

        match outcome {
            Ok(resp) if method == Method::GET && resp.status() == StatusCode::NOT_MODIFIED => {
                for name in get_end_to_end_headers(resp.headers()) {
                    cached.head.headers.remove(&name);
                    for value in resp.headers().get_all(&name) {
                        cached.head.headers.append(name.clone(), value.clone());
                    }
                }
                info!("cached download revalidated (304 Not Modified)");
                return Ok(Ok((req, Effective::Reused(cached))));
            }
            Ok(resp)
                if resp.status().is_server_error()
                    && method == Method::GET
                    && can_stale_on_error(&cached.head.headers, req.headers(), self.clock.as_ref()) =>
            {
                warn!(
                    status = resp.status().as_u16(),
                    "returning cached response due to server error (stale-if-error)"
                );
                return Ok(Err(fp_body.to_path_buf()));
            }
            Err(e)
                if e.is_transport_or_server()
                    && method == Method::GET
                    && can_stale_on_error(&cached.head.headers, req.headers(), self.clock.as_ref()) =>
            {
                warn!(error = %e, "returning cached response due to transport failure (stale-if-error)");
                return Ok(Err(fp_body.to_path_buf()));
            }
            outcome => match self.accept_status(&method, outcome).await {
                Ok(resp) => Ok(Ok((req, Effective::Live(resp)))),
                Err(Ok(path)) => Ok(Err(path)),
                Err(Err(e)) => Err(e),
            },
        }
    }

    /// Keeps a `200`; anything else falls back to the cache or becomes the error.
    ///
    /// `Err(Ok(path))` is a cache fallback, `Err(Err(e))` the error to return.
    async fn accept_status(
        &self,
        method: &Method,
        outcome: Result<Response, DownloadError>,
    ) -> Result<Response, Result<PathBuf, DownloadError>> {
        let err = match outcome {
            Ok(resp) if resp.status() == StatusCode::OK => return Ok(resp),
            Ok(resp) => {
                let status = resp.status().as_u16();
                warn!(status, "unexpected HTTP status from server; will serve from cache if possible");
                DownloadError::http_status(self.url.as_str(), status)
            }
            Err(e) => e,
        };
        match self.cache_file_on_error(method, &err).await {
            Some(path) => Err(Ok(path)),
            None => Err(Err(err)),
        }
    }

    /// Writes storable responses through the cache and wraps the body in a stream.
    async fn finish(
        &self,
        req: &Request,
        effective: Effective,
        cacheable: bool,
    ) -> Result<(Download, bool), DownloadError> {
        let method = req.method();
        let req_cc = parse_cache_control(req.headers());

        match effective {
            Effective::Reused(mut cached) => {
                let cache = self.cache.as_ref().filter(|_| cacheable);
                if let Some(cache) = cache
                    && can_store(&req_cc, &parse_cache_control(&cached.head.headers))
                {
                    record_varied(&mut cached.head.headers, req.headers());
                    if let Err(e) = cache.write_header(method, &cached.head).await {
                        error!(dir = %cache.dir().display(), error = %e, "failed to update cache header");
                        return Err(e);
                    }
                    return Ok((Download::Cached(cached.body), false));
                }
                let source = FileSource::open(&cached.body)
                    .await
                    .map_err(|e| DownloadError::io(&cached.body, e))?;
                Ok((Download::Stream(Stream::new(source)), false))
            }
            Effective::Live(resp) => {
                let mut head = ResponseHead::from_response(&resp);
                let body = self.body_source(resp);
                let cache = self.cache.as_ref().filter(|_| cacheable);
                if let Some(cache) = cache
                    && can_store(&req_cc, &parse_cache_control(&head.headers))
                {
                    // Staging belongs to the stream that is still being read.
                    if self.cache_write_in_flight() {
                        debug!("previous download still writing the cache; streaming without cache");
                        return Ok((Download::Stream(Stream::from_boxed(body)), false));
                    }
                    record_varied(&mut head.headers, req.headers());
                    let cacher = cache.new_response_cacher(method, &head, body).await?;
                    debug!(dir = %cache.dir().display(), "streaming download into staging cache");
                    return Ok((Download::Stream(Stream::new(cacher)), true));
                }
                debug!("response is not storable; streaming without cache");
                Ok((Download::Stream(Stream::from_boxed(body)), false))
            }
        }
    }

    /// Serves the existing cache after a failed refresh, when policy allows.
    async fn cache_file_on_error(&self, method: &Method, err: &DownloadError) -> Option<PathBuf> {
        let cache = self.cache.as_ref()?;
        if !self.continue_on_error || !cache.exists(method).await {
            return None;
        }
        let path = cache.paths(method).body;
        warn!(
            error = %err,
            path = %path.display(),
            "returning possibly stale cached response due to download refresh error"
        );
        Some(path)
    }

    async fn execute(&self, req: Request) -> Result<Response, DownloadError> {
        let waiter = self.progress.waiter(format!("{}: start download", self.name));
        let result = self.client.execute(req).await;
        if let Some(waiter) = waiter {
            waiter.finish_and_clear();
        }
        result
    }

    fn body_source(&self, resp: Response) -> Box<dyn ByteSource> {
        let len = resp.content_length();
        let body: Box<dyn ByteSource> = Box::new(BodySource::from_response(resp));
        match self.progress.bytes_bar(format!("{}: download", self.name), len) {
            Some(bar) => Box::new(ProgressSource::new(body, bar)),
            None => body,
        }
    }
}

/// Adds `If-None-Match` / `If-Modified-Since` from the cached head unless already set.
fn with_validators(req: Request, cached: &HeaderMap) -> Request {
    let etag = cached.get(ETAG).filter(|_| !req.headers().contains_key(IF_NONE_MATCH));
    let last_modified = cached
        .get(LAST_MODIFIED)
        .filter(|_| !req.headers().contains_key(IF_MODIFIED_SINCE));
    if etag.is_none() && last_modified.is_none() {
        return req;
    }

    let mut req2 = clone_request(&req);
    if let Some(etag) = etag {
        req2.headers_mut().insert(IF_NONE_MATCH, etag.clone());
    }
    if let Some(last_modified) = last_modified {
        req2.headers_mut()
            .insert(IF_MODIFIED_SINCE, last_modified.clone());
    }
    debug!("revalidating stale cached response");
    req2
}

/// Records the request value of every header named in `Vary` as `X-Varied-<Header>`.
fn record_varied(resp: &mut HeaderMap, req: &HeaderMap) {
    for key in header_all_comma_sep_values(resp, &VARY) {
        let Some(value) = req.get(key.as_str()).filter(|v| !v.is_empty()) else {
            continue;
        };
        if let Some(name) = varied_header_name(&key) {
            resp.insert(name, value.clone());
        }
    }
}
