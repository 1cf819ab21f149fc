//! Broadcast of one byte source to any number of independently paced readers.
//!
//! A [`Stream`] wraps a [`ByteSource`] and buffers every chunk it yields.
//! There is no background task: whichever [`Reader`] runs out of buffered
//! chunks first takes the source lock and pulls the next chunk for everyone.
//! Each reader keeps its own cursor into the shared buffer, so a slow reader
//! never holds back a fast one.
//!
//! Once the number of readers is known, call [`Stream::seal`]. After sealing
//! no new readers can be created, chunks every reader has passed are dropped
//! from the buffer, and [`Stream::done`] resolves once all readers are closed.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

/// A pull-based source of body chunks.
#[async_trait]
pub trait ByteSource: Send {
    /// Returns the next chunk, or `None` at a clean end of stream.
    ///
    /// Not cancel-safe: dropping the future may lose a chunk.
    async fn read(&mut self) -> io::Result<Option<Bytes>>;

    /// Releases the source. Called once reading has finished, successfully or not.
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type ChunkStream = Pin<Box<dyn futures_util::Stream<Item = io::Result<Bytes>> + Send>>;

/// [`ByteSource`] over a chunk stream, typically a response body.
pub struct BodySource {
    inner: Option<ChunkStream>,
}

impl BodySource {
    pub fn new<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Some(Box::pin(stream)),
        }
    }

    /// Streams the body of `resp`. Transport errors surface as [`io::ErrorKind::Other`].
    #[must_use]
    pub fn from_response(resp: reqwest::Response) -> Self {
        Self::new(resp.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)))
    }

    /// A source that yields `chunks` and then ends.
    #[must_use]
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self::new(futures_util::stream::iter(chunks.into_iter().map(Ok)))
    }
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySource")
            .field("open", &self.inner.is_some())
            .finish()
    }
}

#[async_trait]
impl ByteSource for BodySource {
    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        loop {
            match inner.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => {}
                Some(Ok(chunk)) => return Ok(Some(chunk)),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner = None;
        Ok(())
    }
}

/// [`ByteSource`] over a file on disk, such as a cached body.
#[derive(Debug)]
pub struct FileSource {
    file: Option<tokio::fs::File>,
}

impl FileSource {
    const CHUNK_SIZE: usize = 64 * 1024;

    /// Opens `path` for reading.
    ///
    /// # Errors
    ///
    /// Returns the open failure.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self { file: Some(file) })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let mut buf = BytesMut::with_capacity(Self::CHUNK_SIZE);
        if file.read_buf(&mut buf).await? == 0 {
            self.file = None;
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

/// Terminal error of a [`Stream`], shared by every reader.
#[derive(Debug, Clone)]
pub struct StreamError(Arc<io::Error>);

impl StreamError {
    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        self.0.kind()
    }

    #[must_use]
    pub fn io_error(&self) -> &io::Error {
        &self.0
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        Self(Arc::new(e))
    }
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        io::Error::new(e.kind(), e)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[derive(Default)]
struct Buffer {
    chunks: Vec<Bytes>,
    /// Absolute index of `chunks[0]`; earlier chunks were trimmed after sealing.
    offset: usize,
    size: u64,
    outcome: Option<Result<(), StreamError>>,
    sealed: bool,
    /// Open readers and the absolute index of the next chunk each will read.
    cursors: HashMap<u64, usize>,
    next_reader_id: u64,
}

impl Buffer {
    fn end(&self) -> usize {
        self.offset + self.chunks.len()
    }

    fn trim(&mut self) {
        if !self.sealed {
            return;
        }
        let keep_from = self.cursors.values().copied().min().unwrap_or(self.end());
        let drop = keep_from.saturating_sub(self.offset).min(self.chunks.len());
        if drop > 0 {
            self.chunks.drain(..drop);
            self.offset += drop;
        }
    }
}

struct Shared {
    buffer: Mutex<Buffer>,
    source: tokio::sync::Mutex<Option<Box<dyn ByteSource>>>,
    filled: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, buf: &mut Buffer, outcome: Result<(), StreamError>) {
        if buf.outcome.is_none() {
            buf.outcome = Some(outcome);
            self.filled.send_replace(true);
        }
    }

    fn signal_done_if_idle(&self, buf: &Buffer) {
        if buf.sealed && buf.cursors.is_empty() {
            self.done.send_replace(true);
        }
    }
}

/// Handle to a broadcast byte stream. Clones refer to the same stream.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buf = self.shared.buffer();
        f.debug_struct("Stream")
            .field("size", &buf.size)
            .field("sealed", &buf.sealed)
            .field("readers", &buf.cursors.len())
            .field("filled", &buf.outcome.is_some())
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub fn new<S: ByteSource + 'static>(source: S) -> Self {
        Self::from_boxed(Box::new(source))
    }

    #[must_use]
    pub fn from_boxed(source: Box<dyn ByteSource>) -> Self {
        let (filled, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(Buffer::default()),
                source: tokio::sync::Mutex::new(Some(source)),
                filled,
                done,
            }),
        }
    }

    /// Creates a reader positioned at the start of the stream, or `None` once sealed.
    #[must_use]
    pub fn new_reader(&self) -> Option<Reader> {
        let mut buf = self.shared.buffer();
        if buf.sealed {
            return None;
        }
        let id = buf.next_reader_id;
        buf.next_reader_id += 1;
        buf.cursors.insert(id, 0);
        Some(Reader {
            shared: Arc::clone(&self.shared),
            id,
            cursor: 0,
            closed: false,
        })
    }

    /// Fixes the set of readers. Idempotent.
    pub fn seal(&self) {
        let mut buf = self.shared.buffer();
        buf.sealed = true;
        buf.trim();
        self.shared.signal_done_if_idle(&buf);
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.shared.buffer().sealed
    }

    /// Bytes pulled from the source so far.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.buffer().size
    }

    /// Whether the source has reached end of stream or failed.
    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.shared.buffer().outcome.is_some()
    }

    /// The terminal error, if the source failed.
    #[must_use]
    pub fn err(&self) -> Option<StreamError> {
        self.shared
            .buffer()
            .outcome
            .as_ref()
            .and_then(|o| o.as_ref().err().cloned())
    }

    /// Waits until the source is exhausted and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the source.
    pub async fn filled(&self) -> Result<(), StreamError> {
        let mut rx = self.shared.filled.subscribe();
        // The sender lives in `shared`, so the channel cannot close under us.
        let _ = rx.wait_for(|filled| *filled).await;
        self.shared
            .buffer()
            .outcome
            .clone()
            .unwrap_or(Ok(()))
    }

    /// Waits until the stream is sealed and every reader has been closed.
    pub async fn done(&self) {
        let mut rx = self.shared.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// A handle that does not keep the stream or its source alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakStream {
        WeakStream(Arc::downgrade(&self.shared))
    }
}

/// Non-owning handle to a [`Stream`].
///
/// Once every [`Stream`] and [`Reader`] is dropped the source is released and
/// [`upgrade`](Self::upgrade) returns `None`.
#[derive(Clone)]
pub struct WeakStream(Weak<Shared>);

impl WeakStream {
    #[must_use]
    pub fn upgrade(&self) -> Option<Stream> {
        self.0.upgrade().map(|shared| Stream { shared })
    }
}

impl fmt::Debug for WeakStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakStream")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

/// One cursor over a [`Stream`]. Dropping a reader closes it.
pub struct Reader {
    shared: Arc<Shared>,
    id: u64,
    cursor: usize,
    closed: bool,
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Marks the stream failed if a fill is abandoned mid-read.
struct FillGuard<'a> {
    shared: &'a Shared,
    source: tokio::sync::MutexGuard<'a, Option<Box<dyn ByteSource>>>,
    armed: bool,
}

impl Drop for FillGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.source.take();
        let mut buf = self.shared.buffer();
        self.shared.finish(
            &mut buf,
            Err(io::Error::new(io::ErrorKind::Interrupted, "stream read cancelled").into()),
        );
    }
}

impl Reader {
    /// Returns the next chunk, or `None` once the source ended cleanly.
    ///
    /// # Errors
    ///
    /// Returns the source's terminal error after all chunks before it were read,
    /// or [`io::ErrorKind::BrokenPipe`] if this reader was closed.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream reader closed").into());
        }
        loop {
            if let Some(ready) = self.try_take() {
                return ready;
            }

            let shared = Arc::clone(&self.shared);
            let source = shared.source.lock().await;
            // Another reader may have filled while we waited for the lock.
            if let Some(ready) = self.try_take() {
                return ready;
            }
            fill(&shared, source).await;
        }
    }

    fn try_take(&mut self) -> Option<Result<Option<Bytes>, StreamError>> {
        let mut buf = self.shared.buffer();
        if self.cursor < buf.offset {
            self.cursor = buf.offset;
        }
        if self.cursor < buf.end() {
            let chunk = buf.chunks[self.cursor - buf.offset].clone();
            self.cursor += 1;
            buf.cursors.insert(self.id, self.cursor);
            buf.trim();
            return Some(Ok(Some(chunk)));
        }
        match &buf.outcome {
            Some(Ok(())) => Some(Ok(None)),
            Some(Err(e)) => Some(Err(e.clone())),
            None => None,
        }
    }

    /// Reads everything that remains into memory.
    ///
    /// # Errors
    ///
    /// See [`Reader::read_chunk`].
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Copies everything that remains into `writer`, returning the byte count.
    ///
    /// # Errors
    ///
    /// Returns the stream error or the write error.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.read_chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }

    /// Closes the reader. Idempotent.
    ///
    /// When the last reader of a sealed stream closes before the source is
    /// exhausted, the source is closed without being drained.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let abandon = {
            let mut buf = self.shared.buffer();
            buf.cursors.remove(&self.id);
            buf.trim();
            self.shared.signal_done_if_idle(&buf);
            buf.sealed && buf.cursors.is_empty() && buf.outcome.is_none()
        };
        if abandon {
            abandon_source(Arc::clone(&self.shared));
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

async fn fill(shared: &Shared, source: tokio::sync::MutexGuard<'_, Option<Box<dyn ByteSource>>>) {
    let mut guard = FillGuard {
        shared,
        source,
        armed: true,
    };
    let Some(src) = guard.source.as_mut() else {
        // Source already gone without an outcome; only possible after a cancelled fill.
        guard.armed = false;
        let mut buf = shared.buffer();
        shared.finish(
            &mut buf,
            Err(io::Error::new(io::ErrorKind::Interrupted, "stream source lost").into()),
        );
        return;
    };

    let result = src.read().await;
    let outcome = match result {
        Ok(Some(chunk)) => {
            guard.armed = false;
            let mut buf = shared.buffer();
            buf.size += chunk.len() as u64;
            buf.chunks.push(chunk);
            return;
        }
        Ok(None) => Ok(()),
        Err(e) => Err(StreamError::from(e)),
    };

    let close_result = src.close().await;
    guard.armed = false;
    guard.source.take();
    let outcome = match (outcome, close_result) {
        (Ok(()), Err(e)) => Err(StreamError::from(e)),
        (outcome, _) => outcome,
    };
    let mut buf = shared.buffer();
    debug!(size = buf.size, ok = outcome.is_ok(), "stream source finished");
    shared.finish(&mut buf, outcome);
}

fn abandon_source(shared: Arc<Shared>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        let mut source = shared.source.lock().await;
        if let Some(mut src) = source.take() {
            let close_result = src.close().await;
            debug!(ok = close_result.is_ok(), "closed abandoned stream source");
        }
        let mut buf = shared.buffer();
        shared.finish(
            &mut buf,
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "all stream readers closed").into()),
        );
    });
}
