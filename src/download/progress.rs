//! Terminal progress for downloads, drawn only when a `MultiProgress` is attached.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::stream::ByteSource;

/// Optional progress sink. The default draws nothing.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    multi: Option<MultiProgress>,
}

impl Progress {
    #[must_use]
    pub fn new(multi: MultiProgress) -> Self {
        Self { multi: Some(multi) }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.multi.is_some()
    }

    /// Spinner shown while waiting for response headers.
    #[must_use]
    pub fn waiter(&self, msg: impl Into<String>) -> Option<ProgressBar> {
        let multi = self.multi.as_ref()?;
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(msg.into());
        spinner.enable_steady_tick(Duration::from_millis(100));
        Some(spinner)
    }

    /// Byte bar for a body of `len` bytes, or a byte spinner when the length is unknown.
    #[must_use]
    pub fn bytes_bar(&self, msg: impl Into<String>, len: Option<u64>) -> Option<ProgressBar> {
        let multi = self.multi.as_ref()?;
        let bar = match len {
            Some(len) => {
                let bar = multi.add(ProgressBar::new(len));
                bar.set_style(
                    ProgressStyle::with_template(
                        "{msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar
            }
            None => {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(
                    ProgressStyle::with_template("{spinner} {msg} {bytes} ({bytes_per_sec})")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        };
        bar.set_message(msg.into());
        Some(bar)
    }
}

/// Passes chunks through from `inner`, advancing a progress bar.
pub struct ProgressSource {
    inner: Box<dyn ByteSource>,
    bar: ProgressBar,
}

impl ProgressSource {
    #[must_use]
    pub fn new(inner: Box<dyn ByteSource>, bar: ProgressBar) -> Self {
        Self { inner, bar }
    }
}

#[async_trait]
impl ByteSource for ProgressSource {
    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        match self.inner.read().await {
            Ok(Some(chunk)) => {
                self.bar.inc(chunk.len() as u64);
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.bar.finish_and_clear();
                Ok(None)
            }
            Err(e) => {
                self.bar.abandon();
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
        self.inner.close().await
    }
}
