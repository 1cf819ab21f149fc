//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Fetch a remote file through a private on-disk HTTP cache.
///
/// The first fetch streams the body to the output while it is written to the
/// cache. Later fetches serve the cached copy for as long as the server's
/// caching headers allow, and revalidate it once it goes stale.
#[derive(Parser, Debug)]
#[command(name = "dlcache")]
#[command(author, version, about)]
pub struct Args {
    /// URL to fetch (http or https)
    pub url: String,

    /// Cache directory (default: per-URL directory under $XDG_CACHE_HOME/dlcache)
    #[arg(short = 'd', long)]
    pub cache_dir: Option<PathBuf>,

    /// Write the body to this file instead of stdout
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Bypass the cache entirely
    #[arg(long)]
    pub no_cache: bool,

    /// Fail instead of serving a possibly stale cached copy when the refresh fails
    #[arg(long)]
    pub no_continue_on_error: bool,

    /// Delete the cache for this URL and exit
    #[arg(long, conflicts_with = "state")]
    pub clear: bool,

    /// Print the cache state for this URL and exit
    #[arg(long)]
    pub state: bool,

    /// TCP connect timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub connect_timeout: Option<u64>,

    /// Whole-request timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub read_timeout: Option<u64>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
