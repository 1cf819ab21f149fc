//! On-disk cache for a single download.
//!
//! ```text
//! <dir>/main/header          status line + headers of the cached response
//! <dir>/main/body            raw body bytes
//! <dir>/main/checksums.txt   "<fingerprint>  body"
//! <dir>/staging/...          same shape, only while a write is in progress
//! ```
//!
//! `main` is either absent, empty, or holds all three files with a matching
//! fingerprint. Any other state is wiped on the next [`Cache::exists`] check.
//! New bodies are written to `staging` and promoted by renaming the directory
//! over `main`, so a failed download never touches the previous cache.

use std::io;
use std::path::{Path, PathBuf};

use reqwest::Method;
use tracing::{debug, info, warn};

use super::checksum::{self, Checksum};
use super::constants::{BODY_FILE, CHECKSUMS_FILE, HEADER_FILE, MAIN_DIR, STAGING_DIR, X_FROM_CACHE};
use super::error::DownloadError;
use super::header_file::ResponseHead;
use super::response_cacher::ResponseCacher;
use super::stream::ByteSource;

/// Locations of the three cache artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub header: PathBuf,
    pub body: PathBuf,
    pub checksums: PathBuf,
}

/// A cached response: its head and the path of its body file.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub head: ResponseHead,
    pub body: PathBuf,
}

/// File names for `method`. GET uses the plain names; other methods are prefixed.
fn file_names(method: &Method) -> [String; 3] {
    if *method == Method::GET {
        [HEADER_FILE, BODY_FILE, CHECKSUMS_FILE].map(String::from)
    } else {
        [HEADER_FILE, BODY_FILE, CHECKSUMS_FILE].map(|name| format!("{method}_{name}"))
    }
}

/// Disk cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn main_dir(&self) -> PathBuf {
        self.dir.join(MAIN_DIR)
    }

    fn staging_dir(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    /// Artifact paths under `main`. The files may not exist.
    #[must_use]
    pub fn paths(&self, method: &Method) -> CachePaths {
        let main = self.main_dir();
        let [header, body, checksums] = file_names(method);
        CachePaths {
            header: main.join(header),
            body: main.join(body),
            checksums: main.join(checksums),
        }
    }

    /// Reports whether a valid cache exists, wiping an inconsistent one first.
    pub async fn exists(&self, method: &Method) -> bool {
        if let Err(e) = self.clear_if_inconsistent(method).await {
            tracing::error!(dir = %self.dir.display(), error = %e, "failed to clear inconsistent cache");
            return false;
        }

        let paths = self.paths(method);
        match tokio::fs::metadata(&paths.header).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => return false,
        }
        self.checksums_match(method).await.is_some()
    }

    /// Wipes the cache if `main` holds some but not all artifacts, or a stale fingerprint.
    ///
    /// # Errors
    ///
    /// Returns the failure to list `main` or to clear the cache.
    pub async fn clear_if_inconsistent(&self, method: &Method) -> Result<(), DownloadError> {
        let main = self.main_dir();
        let mut entries = match tokio::fs::read_dir(&main).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DownloadError::cache(&self.dir, e)),
        };
        let has_entries = entries
            .next_entry()
            .await
            .map_err(|e| DownloadError::cache(&self.dir, e))?
            .is_some();
        if !has_entries {
            return Ok(());
        }

        let paths = self.paths(method);
        let mut consistent = true;
        for path in [&paths.header, &paths.body, &paths.checksums] {
            if !is_file(path).await {
                consistent = false;
                break;
            }
        }
        if consistent && self.checksums_match(method).await.is_none() {
            consistent = false;
        }

        if !consistent {
            warn!(dir = %self.dir.display(), "deleting inconsistent cache");
            self.clear().await?;
        }
        Ok(())
    }

    /// Loads the cached response, or `None` if there is none or its fingerprint is stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the header file cannot be read or parsed.
    pub async fn get(
        &self,
        method: &Method,
        mark_cached: bool,
    ) -> Result<Option<CachedResponse>, DownloadError> {
        let paths = self.paths(method);
        if !is_file(&paths.header).await {
            return Ok(None);
        }
        if self.checksums_match(method).await.is_none() {
            return Ok(None);
        }

        let raw = tokio::fs::read(&paths.header)
            .await
            .map_err(|e| DownloadError::cache(&self.dir, e))?;
        let mut head = ResponseHead::parse(&raw)
            .map_err(|reason| DownloadError::header_file(&paths.header, reason))?;
        if mark_cached {
            head.headers.insert(
                X_FROM_CACHE,
                reqwest::header::HeaderValue::from_static("1"),
            );
        }
        Ok(Some(CachedResponse {
            head,
            body: paths.body,
        }))
    }

    /// Reads the head from the header file without verifying the body.
    pub(crate) async fn read_head(&self, method: &Method) -> Result<ResponseHead, DownloadError> {
        let path = self.paths(method).header;
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| DownloadError::cache(&self.dir, e))?;
        ResponseHead::parse(&raw).map_err(|reason| DownloadError::header_file(&path, reason))
    }

    /// Returns the fingerprint stored in `checksums.txt`, without checking the body.
    pub async fn cached_checksum(&self, method: &Method) -> Option<Checksum> {
        let paths = self.paths(method);
        if !is_file(&paths.checksums).await {
            return None;
        }
        let mut sums = match checksum::read_file(&paths.checksums).await {
            Ok(sums) => sums,
            Err(e) => {
                warn!(file = %paths.checksums.display(), error = %e, "failed to read checksum file");
                return None;
            }
        };
        if sums.len() != 1 {
            return None;
        }
        sums.remove(&body_entry(method))
    }

    /// Returns the stored fingerprint if it matches a fresh fingerprint of the body.
    pub async fn checksums_match(&self, method: &Method) -> Option<Checksum> {
        let stored = self.cached_checksum(method).await?;
        let calculated = checksum::for_file(&self.paths(method).body).await.ok()?;
        if calculated != stored {
            warn!(dir = %self.dir.display(), "inconsistent cache: checksums don't match");
            return None;
        }
        Some(stored)
    }

    /// Deletes and recreates the cache directory.
    ///
    /// # Errors
    ///
    /// Returns the failure to delete or recreate the directory.
    pub async fn clear(&self) -> Result<(), DownloadError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(dir = %self.dir.display(), error = %e, "failed to delete cache dir");
                return Err(DownloadError::cache(&self.dir, e));
            }
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DownloadError::cache(&self.dir, e))?;
        info!(dir = %self.dir.display(), "deleted cache dir");
        Ok(())
    }

    /// Rewrites only the header file in `main`, after a 304 revalidation.
    ///
    /// # Errors
    ///
    /// Returns the failure to create `main` or write the file.
    pub async fn write_header(&self, method: &Method, head: &ResponseHead) -> Result<(), DownloadError> {
        let main = self.main_dir();
        tokio::fs::create_dir_all(&main)
            .await
            .map_err(|e| DownloadError::cache(&self.dir, e))?;
        tokio::fs::write(self.paths(method).header, persisted(head).dump())
            .await
            .map_err(|e| DownloadError::cache(&self.dir, e))?;
        info!(dir = %main.display(), status = head.status.as_u16(), "updated download main cache (header only)");
        Ok(())
    }

    /// Prepares `staging` for `head` and returns a cacher that tees `body` into it.
    ///
    /// `body` is consumed either way; on failure it is closed before returning.
    ///
    /// # Errors
    ///
    /// Returns the failure to create `staging` or its header and body files.
    pub async fn new_response_cacher(
        &self,
        method: &Method,
        head: &ResponseHead,
        mut body: Box<dyn ByteSource>,
    ) -> Result<ResponseCacher, DownloadError> {
        match self.prepare_staging(method, head).await {
            Ok((file, names)) => {
                debug!(dir = %self.dir.display(), "wrote response header to staging cache");
                Ok(ResponseCacher::new(
                    body,
                    file,
                    self.staging_dir(),
                    self.main_dir(),
                    names,
                ))
            }
            Err(e) => {
                let _ = body.close().await;
                Err(DownloadError::cache(&self.dir, e))
            }
        }
    }

    async fn prepare_staging(
        &self,
        method: &Method,
        head: &ResponseHead,
    ) -> io::Result<(tokio::fs::File, [String; 3])> {
        let staging = self.staging_dir();
        // Leftovers from an interrupted write.
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(&staging).await?;

        let names = file_names(method);
        tokio::fs::write(staging.join(&names[0]), persisted(head).dump()).await?;
        let file = tokio::fs::File::create(staging.join(&names[1])).await?;
        Ok((file, names))
    }

    /// Fails if `main` or `staging` lives on a different device than the cache root.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::CrossDevice`] for the first offending directory.
    #[cfg(unix)]
    pub fn check_same_device(&self) -> Result<(), DownloadError> {
        use std::os::unix::fs::MetadataExt;

        let Ok(root) = std::fs::metadata(&self.dir) else {
            // Created lazily on first write; nothing to compare yet.
            return Ok(());
        };
        for sub in [self.main_dir(), self.staging_dir()] {
            if let Ok(meta) = std::fs::metadata(&sub)
                && meta.dev() != root.dev()
            {
                return Err(DownloadError::CrossDevice {
                    cache_dir: self.dir.clone(),
                    path: sub,
                });
            }
        }
        Ok(())
    }

    /// Device numbers are only compared on Unix.
    ///
    /// # Errors
    ///
    /// Never fails.
    #[cfg(not(unix))]
    pub fn check_same_device(&self) -> Result<(), DownloadError> {
        Ok(())
    }
}

/// Name of the body entry inside `checksums.txt`.
pub(crate) fn body_entry(method: &Method) -> String {
    let [_, body, _] = file_names(method);
    body
}

/// The head as written to disk: the cache-served marker is never persisted.
fn persisted(head: &ResponseHead) -> ResponseHead {
    let mut head = head.clone();
    head.headers.remove(X_FROM_CACHE);
    head
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

/// Renames directory `from` to `to`, replacing an existing `to`.
///
/// An existing `to` is first moved aside next to it, then `from` takes its
/// place, then the old copy is deleted. If the second rename fails the old
/// directory is moved back. Both renames stay inside the parent directory, so
/// they are atomic on the same volume.
pub(crate) async fn rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    let from_meta = tokio::fs::metadata(from).await?;
    if !from_meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("rename dir: not a dir: {}", from.display()),
        ));
    }

    let to_is_dir = tokio::fs::metadata(to).await.is_ok_and(|m| m.is_dir());
    if !to_is_dir {
        return tokio::fs::rename(from, to).await;
    }

    let aside = aside_path(to);
    match tokio::fs::remove_dir_all(&aside).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::rename(to, &aside).await?;

    if let Err(e) = tokio::fs::rename(from, to).await {
        if let Err(restore) = tokio::fs::rename(&aside, to).await {
            warn!(dir = %to.display(), error = %restore, "failed to restore previous cache dir");
        }
        return Err(e);
    }

    if let Err(e) = tokio::fs::remove_dir_all(&aside).await {
        debug!(dir = %aside.display(), error = %e, "failed to delete replaced cache dir");
    }
    Ok(())
}

fn aside_path(dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.with_file_name(format!(".{name}.old"))
}
