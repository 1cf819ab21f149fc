//! User-Agent sent with every download request.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/dlcache";

/// Default User-Agent: `dlcache/<version> (caching-fetcher; +<url>)`.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("dlcache/{version} (caching-fetcher; +{PROJECT_UA_URL})")
}
