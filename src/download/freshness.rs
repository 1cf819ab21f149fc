//! HTTP cache freshness rules (RFC 7234) and the stale-if-error extension (RFC 5861).
//!
//! Everything here is a pure function over two header collections, the
//! cached (or new) response headers and the request headers, plus an
//! injected [`Clock`] for the current time.
//!
//! This is a private, single-consumer cache: `public`, `private` and
//! `s-maxage` carry no meaning and are ignored.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use reqwest::Request;
use reqwest::header::{
    CACHE_CONTROL, CONNECTION, DATE, EXPIRES, HeaderMap, HeaderName, VARY,
};

use super::constants::X_VARIED_PREFIX;

/// Cache state of a stored response relative to a request.
///
/// `Uncached` means nothing usable is stored, `Fresh` means the stored
/// response may be returned as is, `Stale` means it needs revalidating, and
/// `Transparent` means the request insists on bypassing the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// The item is not cached.
    Uncached,
    /// The cached item needs validating before it is returned.
    Stale,
    /// The cached item can be returned.
    Fresh,
    /// The cached item should not be used to fulfil the request.
    Transparent,
}

impl State {
    /// Returns the stable lowercase label for the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uncached => "uncached",
            Self::Stale => "stale",
            Self::Fresh => "fresh",
            Self::Transparent => "transparent",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the current time for age calculations.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// [`Clock`] backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// [`Clock`] whose time only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Sets the clock to `to`.
    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parsed `Cache-Control` directives: lowercase name to value, with an empty
/// value for valueless directives.
pub type CacheControl = HashMap<String, String>;

/// Why a `Date` header could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DateError {
    /// No `Date` header, or an empty one.
    #[error("no Date header")]
    Missing,
    /// The header is present but not an HTTP-date.
    #[error("invalid Date header: {0}")]
    Invalid(String),
}

/// Parses the `Date` header of `headers`.
pub fn get_date(headers: &HeaderMap) -> Result<SystemTime, DateError> {
    let raw = headers
        .get(DATE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        return Err(DateError::Missing);
    }
    httpdate::parse_http_date(raw).map_err(|_| DateError::Invalid(raw.to_string()))
}

/// Splits every `Cache-Control` value on commas into a directive map.
#[must_use]
pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::new();
    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, val)) => {
                    cc.insert(key.trim().to_ascii_lowercase(), val.trim().to_string());
                }
                None => {
                    cc.insert(part.to_ascii_lowercase(), String::new());
                }
            }
        }
    }
    cc
}

/// Determines the freshness of a cached response (`resp`) for a new request (`req`).
///
/// Request `no-cache` wins over everything, then response `no-cache`, then
/// request `only-if-cached`. Without a usable `Date` the response is treated
/// as stale. Otherwise the lifetime comes from response `max-age` (or
/// `Expires - Date`), overridden by request `max-age`; request `min-fresh`
/// adds to the age and request `max-stale` subtracts from it (or, valueless,
/// accepts any age).
#[must_use]
pub fn get_freshness(resp: &HeaderMap, req: &HeaderMap, clock: &dyn Clock) -> State {
    let resp_cc = parse_cache_control(resp);
    let req_cc = parse_cache_control(req);

    if req_cc.contains_key("no-cache") {
        return State::Transparent;
    }
    if resp_cc.contains_key("no-cache") {
        return State::Stale;
    }
    if req_cc.contains_key("only-if-cached") {
        return State::Fresh;
    }

    let Ok(date) = get_date(resp) else {
        return State::Stale;
    };
    let mut current_age = signed_millis_between(date, clock.now());

    // max-age overrides Expires, even when Expires is more restrictive.
    let mut lifetime = if let Some(max_age) = resp_cc.get("max-age") {
        parse_seconds(max_age).unwrap_or(0)
    } else {
        resp.get(EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
            .map_or(0, |expires| signed_millis_between(date, expires))
    };

    if let Some(max_age) = req_cc.get("max-age") {
        lifetime = parse_seconds(max_age).unwrap_or(0);
    }
    if let Some(min_fresh) = req_cc.get("min-fresh")
        && let Some(min_fresh) = parse_seconds(min_fresh)
    {
        current_age += min_fresh;
    }
    if let Some(max_stale) = req_cc.get("max-stale") {
        if max_stale.is_empty() {
            return State::Fresh;
        }
        if let Some(max_stale) = parse_seconds(max_stale) {
            current_age -= max_stale;
        }
    }

    if lifetime > current_age {
        State::Fresh
    } else {
        State::Stale
    }
}

/// Reports whether a stale response may be served because the origin failed.
///
/// True if either side carries a valueless `stale-if-error`, or a valued one
/// whose window still covers the response's age. The request directive, when
/// present, replaces the response's window.
#[must_use]
pub fn can_stale_on_error(resp: &HeaderMap, req: &HeaderMap, clock: &dyn Clock) -> bool {
    let resp_cc = parse_cache_control(resp);
    let req_cc = parse_cache_control(req);

    let mut window: Option<i64> = None;
    for cc in [&resp_cc, &req_cc] {
        if let Some(value) = cc.get("stale-if-error") {
            if value.is_empty() {
                return true;
            }
            match parse_seconds(value) {
                Some(secs) => window = Some(secs),
                None => return false,
            }
        }
    }

    let Some(window) = window.filter(|w| *w >= 0) else {
        return false;
    };
    let Ok(date) = get_date(resp) else {
        return false;
    };
    window > signed_millis_between(date, clock.now())
}

/// Reports whether a response may be written to the cache (no `no-store` on either side).
#[must_use]
pub fn can_store(req_cc: &CacheControl, resp_cc: &CacheControl) -> bool {
    !resp_cc.contains_key("no-store") && !req_cc.contains_key("no-store")
}

/// Returns every comma-separated, trimmed value of header `name`, across all occurrences.
#[must_use]
pub fn header_all_comma_sep_values(headers: &HeaderMap, name: &HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .collect()
}

/// Returns the name of the synthetic header that records the request value of `header`.
#[must_use]
pub fn varied_header_name(header: &str) -> Option<HeaderName> {
    HeaderName::from_bytes(format!("{X_VARIED_PREFIX}{header}").as_bytes()).ok()
}

/// Checks the request headers named in the cached response's `Vary` against the
/// values recorded at write time. `Vary: *` never matches.
#[must_use]
pub fn vary_matches(cached: &HeaderMap, req: &HeaderMap) -> bool {
    for header in header_all_comma_sep_values(cached, &VARY) {
        if header.is_empty() {
            continue;
        }
        if header == "*" {
            return false;
        }
        let Some(varied) = varied_header_name(&header) else {
            return false;
        };
        let requested = req
            .get(header.as_str())
            .map(reqwest::header::HeaderValue::as_bytes)
            .unwrap_or_default();
        let recorded = cached
            .get(&varied)
            .map(reqwest::header::HeaderValue::as_bytes)
            .unwrap_or_default();
        if requested != recorded {
            return false;
        }
    }
    true
}

/// Returns the response header names that are end-to-end, i.e. not hop-by-hop
/// and not listed in `Connection`.
#[must_use]
pub fn get_end_to_end_headers(resp: &HeaderMap) -> Vec<HeaderName> {
    let mut hop_by_hop: HashSet<String> = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    for extra in header_all_comma_sep_values(resp, &CONNECTION) {
        if !extra.is_empty() {
            hop_by_hop.insert(extra.to_ascii_lowercase());
        }
    }

    resp.keys()
        .filter(|name| !hop_by_hop.contains(name.as_str()))
        .cloned()
        .collect()
}

/// Copies `req` so validators can be attached without touching the caller's request.
///
/// Method, URL, version, timeout and headers are copied. Bodies are not;
/// only bodyless GET/HEAD requests are cloned.
#[must_use]
pub fn clone_request(req: &Request) -> Request {
    let mut cloned = Request::new(req.method().clone(), req.url().clone());
    *cloned.headers_mut() = req.headers().clone();
    *cloned.version_mut() = req.version();
    *cloned.timeout_mut() = req.timeout().copied();
    cloned
}

/// Parses a directive value in seconds (decimals and a sign allowed) into milliseconds.
fn parse_seconds(value: &str) -> Option<i64> {
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some((secs * 1000.0).round() as i64)
}

/// Milliseconds from `from` to `to`, negative when `to` is earlier.
fn signed_millis_between(from: SystemTime, to: SystemTime) -> i64 {
    match to.duration_since(from) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn clock_at(secs_after_date: u64) -> (ManualClock, String) {
        let date = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = ManualClock::new(date + Duration::from_secs(secs_after_date));
        (clock, httpdate::fmt_http_date(date))
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(State::Uncached.to_string(), "uncached");
        assert_eq!(State::Stale.to_string(), "stale");
        assert_eq!(State::Fresh.to_string(), "fresh");
        assert_eq!(State::Transparent.to_string(), "transparent");
    }

    #[test]
    fn test_get_date() {
        let h = headers(&[("Date", "Mon, 02 Jan 2006 15:04:05 GMT")]);
        let expected = SystemTime::UNIX_EPOCH + Duration::from_secs(1_136_214_245);
        assert_eq!(get_date(&h).unwrap(), expected);

        assert_eq!(get_date(&HeaderMap::new()), Err(DateError::Missing));
        assert_eq!(get_date(&headers(&[("Date", "")])), Err(DateError::Missing));
        assert!(matches!(
            get_date(&headers(&[("Date", "2006-01-02")])),
            Err(DateError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_cache_control() {
        assert!(parse_cache_control(&HeaderMap::new()).is_empty());

        let cc = parse_cache_control(&headers(&[("Cache-Control", " no-cache , max-age=100 ")]));
        assert_eq!(cc.len(), 2);
        assert_eq!(cc["no-cache"], "");
        assert_eq!(cc["max-age"], "100");

        let cc = parse_cache_control(&headers(&[
            ("Cache-Control", "max-age=3600"),
            ("Cache-Control", "stale-if-error=60, No-Store"),
        ]));
        assert_eq!(cc["max-age"], "3600");
        assert_eq!(cc["stale-if-error"], "60");
        assert!(cc.contains_key("no-store"));
    }

    #[test]
    fn test_can_store() {
        let empty = CacheControl::new();
        let no_store: CacheControl = [("no-store".to_string(), String::new())].into();
        assert!(can_store(&empty, &empty));
        assert!(!can_store(&no_store, &empty));
        assert!(!can_store(&empty, &no_store));
    }

    #[test]
    fn test_freshness_request_no_cache_is_transparent() {
        let (clock, date) = clock_at(0);
        let resp = headers(&[("Date", &date), ("Cache-Control", "max-age=3600")]);
        let req = headers(&[("Cache-Control", "no-cache")]);
        assert_eq!(get_freshness(&resp, &req, &clock), State::Transparent);
    }

    #[test]
    fn test_freshness_response_no_cache_is_stale() {
        let (clock, date) = clock_at(0);
        let resp = headers(&[("Date", &date), ("Cache-Control", "no-cache, max-age=3600")]);
        assert_eq!(get_freshness(&resp, &HeaderMap::new(), &clock), State::Stale);
    }

    #[test]
    fn test_freshness_only_if_cached_is_fresh_even_without_date() {
        let (clock, _) = clock_at(0);
        let req = headers(&[("Cache-Control", "only-if-cached")]);
        assert_eq!(get_freshness(&HeaderMap::new(), &req, &clock), State::Fresh);
    }

    #[test]
    fn test_freshness_missing_date_is_stale() {
        let (clock, _) = clock_at(0);
        let resp = headers(&[("Cache-Control", "max-age=3600")]);
        assert_eq!(get_freshness(&resp, &HeaderMap::new(), &clock), State::Stale);
    }

    #[test]
    fn test_freshness_max_age() {
        let (clock, date) = clock_at(10);
        let resp = headers(&[("Date", &date), ("Cache-Control", "max-age=60")]);
        assert_eq!(get_freshness(&resp, &HeaderMap::new(), &clock), State::Fresh);

        clock.advance(Duration::from_secs(60));
        assert_eq!(get_freshness(&resp, &HeaderMap::new(), &clock), State::Stale);
    }

    #[test]
    fn test_freshness_max_age_overrides_expires() {
        let (clock, date) = clock_at(30);
        let expires = httpdate::fmt_http_date(
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + 3600),
        );
        let resp = headers(&[
            ("Date", &date),
            ("Expires", &expires),
            ("Cache-Control", "max-age=10"),
        ]);
        assert_eq!(get_freshness(&resp, &HeaderMap::new(), &clock), State::Stale);

        let resp = headers(&[("Date", &date), ("Expires", &expires)]);
        assert_eq!(get_freshness(&resp, &HeaderMap::new(), &clock), State::Fresh);
    }

    #[test]
    fn test_freshness_invalid_expires_is_stale() {
        let (clock, date) = clock_at(0);
        let resp = headers(&[("Date", &date), ("Expires", "0")]);
        assert_eq!(get_freshness(&resp, &HeaderMap::new(), &clock), State::Stale);
    }

    #[test]
    fn test_freshness_request_directives() {
        let (clock, date) = clock_at(30);
        let resp = headers(&[("Date", &date), ("Cache-Control", "max-age=60")]);

        // Request max-age replaces the response lifetime.
        let req = headers(&[("Cache-Control", "max-age=20")]);
        assert_eq!(get_freshness(&resp, &req, &clock), State::Stale);

        // min-fresh inflates the age: 30 + 40 > 60.
        let req = headers(&[("Cache-Control", "min-fresh=40")]);
        assert_eq!(get_freshness(&resp, &req, &clock), State::Stale);

        clock.advance(Duration::from_secs(60));
        // max-stale with a value deflates the age: 90 - 45 < 60.
        let req = headers(&[("Cache-Control", "max-stale=45")]);
        assert_eq!(get_freshness(&resp, &req, &clock), State::Fresh);

        // Valueless max-stale accepts any age.
        clock.advance(Duration::from_secs(100_000));
        let req = headers(&[("Cache-Control", "max-stale")]);
        assert_eq!(get_freshness(&resp, &req, &clock), State::Fresh);
    }

    #[test]
    fn test_can_stale_on_error() {
        let (clock, date) = clock_at(30);
        let none = HeaderMap::new();

        assert!(!can_stale_on_error(&headers(&[("Date", &date)]), &none, &clock));

        let resp = headers(&[("Date", &date), ("Cache-Control", "stale-if-error")]);
        assert!(can_stale_on_error(&resp, &none, &clock));

        let req = headers(&[("Cache-Control", "stale-if-error")]);
        assert!(can_stale_on_error(&headers(&[("Date", &date)]), &req, &clock));

        let resp = headers(&[("Date", &date), ("Cache-Control", "stale-if-error=60")]);
        assert!(can_stale_on_error(&resp, &none, &clock));
        let req = headers(&[("Cache-Control", "stale-if-error=10")]);
        assert!(!can_stale_on_error(&resp, &req, &clock));

        let resp = headers(&[("Date", &date), ("Cache-Control", "stale-if-error=abc")]);
        assert!(!can_stale_on_error(&resp, &none, &clock));

        let resp = headers(&[("Cache-Control", "stale-if-error=60")]);
        assert!(!can_stale_on_error(&resp, &none, &clock), "no Date header");
    }

    #[test]
    fn test_header_all_comma_sep_values() {
        let h = headers(&[("Vary", "Accept, Accept-Language"), ("Vary", " X-Foo ")]);
        assert_eq!(
            header_all_comma_sep_values(&h, &VARY),
            vec!["Accept", "Accept-Language", "X-Foo"]
        );
        assert!(header_all_comma_sep_values(&HeaderMap::new(), &VARY).is_empty());
    }

    #[test]
    fn test_get_end_to_end_headers() {
        let h = headers(&[
            ("Connection", "X-Private, close"),
            ("Keep-Alive", "timeout=5"),
            ("Transfer-Encoding", "chunked"),
            ("TE", "trailers"),
            ("X-Private", "1"),
            ("Content-Type", "text/plain"),
            ("ETag", "\"abc\""),
        ]);
        let mut names: Vec<String> = get_end_to_end_headers(&h)
            .into_iter()
            .map(|n| n.as_str().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["content-type", "etag"]);
    }

    #[test]
    fn test_vary_matches() {
        let req = headers(&[("Accept", "text/csv")]);
        assert!(vary_matches(&HeaderMap::new(), &req));

        let cached = headers(&[("Vary", "Accept"), ("X-Varied-Accept", "text/csv")]);
        assert!(vary_matches(&cached, &req));
        assert!(!vary_matches(&cached, &headers(&[("Accept", "text/html")])));
        assert!(!vary_matches(&cached, &HeaderMap::new()));

        // Nothing recorded and nothing requested matches.
        let cached = headers(&[("Vary", "Accept-Language")]);
        assert!(vary_matches(&cached, &req));

        assert!(!vary_matches(&headers(&[("Vary", "*")]), &req));
    }

    #[test]
    fn test_clone_request_copies_headers() {
        let url = reqwest::Url::parse("https://example.com/data.csv").unwrap();
        let mut req = Request::new(reqwest::Method::GET, url);
        req.headers_mut()
            .insert("x-original", HeaderValue::from_static("1"));

        let mut cloned = clone_request(&req);
        cloned
            .headers_mut()
            .insert("if-none-match", HeaderValue::from_static("\"abc\""));

        assert_eq!(cloned.url(), req.url());
        assert_eq!(cloned.method(), req.method());
        assert!(cloned.headers().contains_key("x-original"));
        assert!(!req.headers().contains_key("if-none-match"));
    }
}
