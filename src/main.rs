//! CLI entry point for the dlcache tool.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use dlcache::download::{CONNECT_TIMEOUT_SECS, Progress, READ_TIMEOUT_SECS};
use dlcache::{Download, Downloader, DownloaderOptions, HttpClient};
use indicatif::{MultiProgress, ProgressDrawTarget};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

mod cli;
mod config;

use cli::Args;
use config::FileConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = config::load_default_file_config()?;
    if loaded.loaded_from_file {
        debug!(path = ?loaded.path, "loaded config file");
    }
    let file_config = loaded.config;

    let client = HttpClient::with_timeouts(
        args.connect_timeout
            .or(file_config.connect_timeout_secs)
            .unwrap_or(CONNECT_TIMEOUT_SECS),
        args.read_timeout
            .or(file_config.read_timeout_secs)
            .unwrap_or(READ_TIMEOUT_SECS),
    )
    .context("Failed to build HTTP client")?;

    let cache_dir = resolve_cache_dir(&args, &file_config);
    let options = DownloaderOptions {
        cache: !args.no_cache && file_config.cache.unwrap_or(true),
        continue_on_error: !args.no_continue_on_error
            && file_config.continue_on_error.unwrap_or(true),
        ..DownloaderOptions::default()
    };

    let mut downloader = Downloader::new(
        display_name(&args.url),
        client,
        &args.url,
        &cache_dir,
        options,
    )
    .with_context(|| format!("Cannot download {}", args.url))?;

    if !args.quiet && io::stderr().is_terminal() {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());
        downloader = downloader.with_progress(Progress::new(multi));
    }

    if args.clear {
        downloader
            .clear()
            .await
            .with_context(|| format!("Failed to clear cache {}", cache_dir.display()))?;
        info!(dir = %cache_dir.display(), "cache cleared");
        return Ok(());
    }

    if args.state {
        println!("{}", downloader.state().await);
        return Ok(());
    }

    let download = downloader
        .get()
        .await
        .with_context(|| format!("Failed to download {}", args.url))?;

    let mut output = open_output(args.output.as_deref()).await?;
    let written = match download {
        Download::Cached(path) => {
            debug!(path = %path.display(), "serving cached file");
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open cached file {}", path.display()))?;
            let n = tokio::io::copy(&mut file, &mut output)
                .await
                .context("Failed to write output")?;
            output.flush().await.context("Failed to write output")?;
            n
        }
        Download::Stream(stream) => {
            let mut reader = stream
                .new_reader()
                .context("Download stream closed before it could be read")?;
            stream.seal();
            reader
                .copy_to(&mut output)
                .await
                .with_context(|| format!("Failed to download {}", args.url))?
        }
    };

    info!(bytes = written, "done");
    Ok(())
}

fn resolve_cache_dir(args: &Args, file_config: &FileConfig) -> PathBuf {
    if let Some(dir) = args.cache_dir.as_ref().or(file_config.cache_dir.as_ref()) {
        return dir.clone();
    }
    let key = format!("{:x}", Sha256::digest(args.url.as_bytes()));
    match config::env_var_non_empty_os("XDG_CACHE_HOME") {
        Some(base) => PathBuf::from(base).join("dlcache").join(key),
        None => PathBuf::from(".dlcache").join(key),
    }
}

/// Last path segment of the URL, for progress bars.
fn display_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(url)
        .to_string()
}

async fn open_output(path: Option<&Path>) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output file {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_uses_last_segment() {
        assert_eq!(display_name("https://example.com/a/data.csv"), "data.csv");
        assert_eq!(display_name("https://example.com/a/"), "a");
    }

    #[test]
    fn test_cache_dir_prefers_flag_over_config() {
        let args = Args::try_parse_from(["dlcache", "-d", "/flag", "https://x.test/f"]).unwrap();
        let cfg = FileConfig {
            cache_dir: Some(PathBuf::from("/config")),
            ..FileConfig::default()
        };
        assert_eq!(resolve_cache_dir(&args, &cfg), PathBuf::from("/flag"));

        let args = Args::try_parse_from(["dlcache", "https://x.test/f"]).unwrap();
        assert_eq!(resolve_cache_dir(&args, &cfg), PathBuf::from("/config"));
    }

    #[test]
    fn test_default_cache_dir_is_keyed_by_url() {
        let a = Args::try_parse_from(["dlcache", "https://x.test/a"]).unwrap();
        let b = Args::try_parse_from(["dlcache", "https://x.test/b"]).unwrap();
        let cfg = FileConfig::default();
        let dir_a = resolve_cache_dir(&a, &cfg);
        assert_ne!(dir_a, resolve_cache_dir(&b, &cfg));
        assert_eq!(dir_a, resolve_cache_dir(&a, &cfg));
        let key = dir_a.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(key.len(), 64);
    }
}
