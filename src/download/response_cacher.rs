//! Tee-and-promote wrapper around an in-flight response body.
//!
//! Every chunk read through a [`ResponseCacher`] is appended to the staging
//! body file before it is handed on. At a clean end of stream the staging
//! body is fingerprinted and the staging directory is renamed over `main`;
//! only then does the reader see end of stream. A failed promotion becomes
//! the terminal read error instead. Any other failure discards staging and
//! leaves `main` as it was.

use std::fmt;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::cache::rename_dir;
use super::checksum;
use super::stream::ByteSource;

pub struct ResponseCacher {
    body: Option<Box<dyn ByteSource>>,
    file: Option<tokio::fs::File>,
    /// Set while staging still needs cleanup; cleared once promoted or removed.
    staging_dir: Option<PathBuf>,
    main_dir: PathBuf,
    body_name: String,
    checksums_name: String,
    written: u64,
    close_outcome: Option<Result<(), (io::ErrorKind, String)>>,
}

impl fmt::Debug for ResponseCacher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCacher")
            .field("staging_dir", &self.staging_dir)
            .field("main_dir", &self.main_dir)
            .field("written", &self.written)
            .field("open", &self.body.is_some())
            .finish_non_exhaustive()
    }
}

impl ResponseCacher {
    /// `names` are the header, body and checksum file names inside staging.
    pub(crate) fn new(
        body: Box<dyn ByteSource>,
        file: tokio::fs::File,
        staging_dir: PathBuf,
        main_dir: PathBuf,
        names: [String; 3],
    ) -> Self {
        let [_, body_name, checksums_name] = names;
        Self {
            body: Some(body),
            file: Some(file),
            staging_dir: Some(staging_dir),
            main_dir,
            body_name,
            checksums_name,
            written: 0,
            close_outcome: None,
        }
    }

    async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        let result = match self.file.as_mut() {
            Some(file) => file.write_all(chunk).await,
            None => Err(io::Error::other("staging body file already closed")),
        };
        match result {
            Ok(()) => {
                self.written += chunk.len() as u64;
                Ok(())
            }
            Err(e) => {
                let _ = self.discard().await;
                Err(io::Error::new(
                    e.kind(),
                    format!("failed to append http response body bytes to staging cache: {e}"),
                ))
            }
        }
    }

    async fn promote(&mut self) -> io::Result<()> {
        let result = self.try_promote().await;
        // Whatever is still held is released, and staging is removed unless promoted.
        let _ = self.discard().await;
        result
    }

    async fn try_promote(&mut self) -> io::Result<()> {
        let Some(staging) = self.staging_dir.clone() else {
            return Err(io::Error::other("staging cache already removed"));
        };

        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| with_context(&e, "failed to flush staging cache body file"))?;
            file.sync_all()
                .await
                .map_err(|e| with_context(&e, "failed to close staging cache body file"))?;
        }
        if let Some(mut body) = self.body.take() {
            body.close()
                .await
                .map_err(|e| with_context(&e, "failed to close http response body"))?;
        }

        let body_path = staging.join(&self.body_name);
        let sum = checksum::for_file(&body_path)
            .await
            .map_err(|e| with_context(&e, "failed to compute checksum for cache body file"))?;
        checksum::write_file(&staging.join(&self.checksums_name), &sum, &self.body_name)
            .await
            .map_err(|e| with_context(&e, "failed to write checksum file for cache body"))?;

        rename_dir(&staging, &self.main_dir)
            .await
            .map_err(|e| with_context(&e, "failed to write download cache"))?;
        self.staging_dir = None;

        info!(size = self.written, dir = %self.main_dir.display(), "promoted download staging cache to main");
        Ok(())
    }

    /// Drops the staging file and directory and closes the body. Returns the
    /// first close/removal failure so [`ByteSource::close`] can report it.
    async fn discard(&mut self) -> io::Result<()> {
        let mut first_err = None;
        self.file = None;
        if let Some(mut body) = self.body.take()
            && let Err(e) = body.close().await
        {
            first_err.get_or_insert(e);
        }
        if let Some(staging) = self.staging_dir.take() {
            match tokio::fs::remove_dir_all(&staging).await {
                Ok(()) => debug!(dir = %staging.display(), "removed staging cache"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for ResponseCacher {
    /// Removes staging when the cacher is dropped before promotion or close.
    fn drop(&mut self) {
        self.file = None;
        self.body = None;
        if let Some(staging) = self.staging_dir.take() {
            match std::fs::remove_dir_all(&staging) {
                Ok(()) => debug!(dir = %staging.display(), "removed staging cache of dropped download"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %staging.display(), error = %e, "failed to remove staging cache"),
            }
        }
    }
}

fn with_context(e: &io::Error, msg: &str) -> io::Error {
    io::Error::new(e.kind(), format!("{msg}: {e}"))
}

#[async_trait]
impl ByteSource for ResponseCacher {
    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        let Some(body) = self.body.as_mut() else {
            return Err(io::Error::other("response cache already closed"));
        };

        let result = body.read().await;
        match result {
            Ok(Some(chunk)) => {
                self.append(&chunk).await?;
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.promote().await?;
                Ok(None)
            }
            Err(e) => {
                let _ = self.discard().await;
                Err(e)
            }
        }
    }

    /// Idempotent: repeated calls return the first call's outcome.
    async fn close(&mut self) -> io::Result<()> {
        if self.close_outcome.is_none() {
            let outcome = self
                .discard()
                .await
                .map_err(|e| (e.kind(), e.to_string()));
            self.close_outcome = Some(outcome);
        }
        match &self.close_outcome {
            Some(Err((kind, msg))) => Err(io::Error::new(*kind, msg.clone())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reqwest::Method;
    use reqwest::header::HeaderMap;
    use reqwest::{StatusCode, Version};
    use tempfile::TempDir;

    use crate::download::cache::Cache;
    use crate::download::constants::{BODY_FILE, CHECKSUMS_FILE, HEADER_FILE, MAIN_DIR, STAGING_DIR};
    use crate::download::header_file::ResponseHead;
    use crate::download::stream::BodySource;

    fn head() -> ResponseHead {
        ResponseHead {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    fn chunks(parts: &[&'static str]) -> Vec<io::Result<Bytes>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect()
    }

    async fn cacher(cache: &Cache, items: Vec<io::Result<Bytes>>) -> ResponseCacher {
        let source = BodySource::new(futures_util::stream::iter(items));
        cache
            .new_response_cacher(&Method::GET, &head(), Box::new(source))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_staging_exists_until_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let mut rc = cacher(&cache, chunks(&["Hello ", "World!"])).await;

        assert_eq!(rc.read().await.unwrap().unwrap(), "Hello ");
        assert!(dir.path().join(STAGING_DIR).join("header").exists());
        assert!(!cache.exists(&Method::GET).await);

        assert_eq!(rc.read().await.unwrap().unwrap(), "World!");
        assert!(rc.read().await.unwrap().is_none());
        assert!(cache.exists(&Method::GET).await);
        assert!(!dir.path().join(STAGING_DIR).exists());
        let body = tokio::fs::read(cache.paths(&Method::GET).body).await.unwrap();
        assert_eq!(body, b"Hello World!");

        let err = rc.read().await.unwrap_err();
        assert!(err.to_string().contains("already closed"));
    }

    #[tokio::test]
    async fn test_read_error_discards_staging_and_keeps_main() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let mut first = cacher(&cache, chunks(&["original"])).await;
        while first.read().await.unwrap().is_some() {}
        let body_path = cache.paths(&Method::GET).body;
        let before = tokio::fs::metadata(&body_path).await.unwrap();

        let mut items = chunks(&["partial"]);
        items.push(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated")));
        let mut rc = cacher(&cache, items).await;
        assert!(rc.read().await.unwrap().is_some());
        let err = rc.read().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        assert!(!dir.path().join(STAGING_DIR).exists());
        let after = tokio::fs::metadata(&body_path).await.unwrap();
        assert_eq!(before.len(), after.len());
        assert_eq!(before.modified().unwrap(), after.modified().unwrap());
        assert_eq!(tokio::fs::read(&body_path).await.unwrap(), b"original");
        assert!(cache.exists(&Method::GET).await);
    }

    #[tokio::test]
    async fn test_early_close_removes_staging_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let mut rc = cacher(&cache, chunks(&["a", "b"])).await;
        rc.read().await.unwrap();

        rc.close().await.unwrap();
        rc.close().await.unwrap();
        assert!(!dir.path().join(STAGING_DIR).exists());
        assert!(!cache.exists(&Method::GET).await);
    }

    #[tokio::test]
    async fn test_dropping_unfinished_cacher_removes_staging() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let rc = cacher(&cache, chunks(&["a", "b"])).await;
        assert!(dir.path().join(STAGING_DIR).exists());

        drop(rc);
        assert!(!dir.path().join(STAGING_DIR).exists());
        assert!(!cache.exists(&Method::GET).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_append_failure_discards_staging_and_keeps_main() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let mut first = cacher(&cache, chunks(&["original"])).await;
        while first.read().await.unwrap().is_some() {}
        let body_path = cache.paths(&Method::GET).body;
        let before = tokio::fs::metadata(&body_path).await.unwrap();

        // A read-only handle on the staging body makes appends fail.
        let staging = dir.path().join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await.unwrap();
        tokio::fs::write(staging.join(HEADER_FILE), head().dump()).await.unwrap();
        tokio::fs::write(staging.join(BODY_FILE), b"").await.unwrap();
        let read_only = tokio::fs::File::open(staging.join(BODY_FILE)).await.unwrap();
        let source = BodySource::new(futures_util::stream::iter(chunks(&["one", "two", "three"])));
        let mut rc = ResponseCacher::new(
            Box::new(source),
            read_only,
            staging.clone(),
            dir.path().join(MAIN_DIR),
            [HEADER_FILE, BODY_FILE, CHECKSUMS_FILE].map(String::from),
        );

        let err = loop {
            match rc.read().await {
                Ok(Some(_)) => {}
                Ok(None) => panic!("reached end of stream despite failing appends"),
                Err(e) => break e,
            }
        };
        assert!(err.to_string().contains("append"), "got: {err}");
        assert!(rc.body.is_none(), "source is closed");
        assert!(!staging.exists());

        let after = tokio::fs::metadata(&body_path).await.unwrap();
        assert_eq!(before.modified().unwrap(), after.modified().unwrap());
        assert_eq!(tokio::fs::read(&body_path).await.unwrap(), b"original");
        assert!(cache.exists(&Method::GET).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_promotion_failure_is_terminal_error() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let mut rc = cacher(&cache, chunks(&["abc"])).await;
        rc.read().await.unwrap();

        // Staging vanishing under the cacher makes the fingerprint step fail.
        tokio::fs::remove_dir_all(dir.path().join(STAGING_DIR))
            .await
            .unwrap();
        let err = rc.read().await.unwrap_err();
        assert!(err.to_string().contains("checksum"), "got: {err}");
        assert!(!cache.exists(&Method::GET).await);
    }
}
