//! Caching Stream Module
//!
//! Wraps an upstream byte stream so every chunk is passed through to the
//! consumer and also written, in order, to one slot of a pending cache entry.
//! Writes happen on a blocking-pool thread owned by the stream; the consumer
//! never waits on disk and never sees a caching failure.
//!
//! The entry is committed only when the upstream ended cleanly, every write
//! succeeded and the byte count matches the expected length. With a known
//! length, yielding the last expected byte counts as a clean end: HTTP/1
//! encoders stop polling a body once its Content-Length is written. Anything
//! else aborts the edit. A stream dropped before the end drains the rest of
//! the upstream in the background so the connection can be reused.

use crate::disk_cache::Editor;
use bytes::Bytes;
use futures::{Stream, TryStream, TryStreamExt};
use std::fmt;
use std::io::{BufWriter, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How a cache write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The entry was committed with this many payload bytes
    Committed(u64),
    Aborted,
}

pub type CompletionCallback = Box<dyn FnOnce(CacheOutcome) + Send + 'static>;

enum WriterMessage {
    Chunk(Bytes),
    Finished,
    Failed(String),
}

/// Stream wrapper that persists what it yields.
pub struct CachingStream<S>
where
    S: TryStream<Ok = Bytes> + Send + Unpin + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    inner: Option<S>,
    sender: Option<mpsc::UnboundedSender<WriterMessage>>,
    expected_len: Option<u64>,
    bytes_passed: u64,
}

impl<S> CachingStream<S>
where
    S: TryStream<Ok = Bytes> + Send + Unpin + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    /// Wrap `inner`, writing its bytes to `slot` of `editor`.
    ///
    /// # Arguments
    /// * `expected_len` - Upstream content length, if known; a mismatch aborts
    /// * `on_complete` - Called once after the entry is committed or aborted
    pub fn new(
        inner: S,
        editor: Editor,
        slot: usize,
        expected_len: Option<u64>,
        on_complete: CompletionCallback,
    ) -> Self {
        let sender = match Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn_blocking(move || {
                    let outcome = run_writer(editor, slot, expected_len, rx);
                    on_complete(outcome);
                });
                Some(tx)
            }
            Err(_) => {
                warn!("No runtime available for cache writer, streaming uncached");
                if let Err(e) = editor.abort() {
                    warn!("Failed to abort cache edit: {}", e);
                }
                on_complete(CacheOutcome::Aborted);
                None
            }
        };

        Self {
            inner: Some(inner),
            sender,
            expected_len,
            bytes_passed: 0,
        }
    }

    /// Bytes yielded to the consumer so far.
    pub fn bytes_passed(&self) -> u64 {
        self.bytes_passed
    }

    fn send(&mut self, message: WriterMessage) {
        if let Some(sender) = &self.sender {
            if sender.send(message).is_err() {
                debug!("Cache writer gone, continuing uncached");
                self.sender = None;
            }
        }
    }
}

fn run_writer(
    mut editor: Editor,
    slot: usize,
    expected_len: Option<u64>,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
) -> CacheOutcome {
    let key = editor.key().to_string();
    let mut writer = match editor.new_writer(slot) {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            warn!("Failed to open cache writer: key={}: {}", key, e);
            None
        }
    };

    let mut written = 0u64;
    let mut clean_eof = false;

    while let Some(message) = rx.blocking_recv() {
        match message {
            WriterMessage::Chunk(bytes) => {
                let Some(out) = writer.as_mut() else { break };
                if let Err(e) = out.write_all(&bytes) {
                    warn!("Cache write failed: key={}: {}", key, e);
                    writer = None;
                    break;
                }
                written += bytes.len() as u64;
            }
            WriterMessage::Finished => {
                clean_eof = true;
                break;
            }
            WriterMessage::Failed(reason) => {
                debug!("Upstream failed, abandoning cache write: key={}: {}", key, reason);
                break;
            }
        }
    }

    let flushed = match writer.take() {
        Some(mut out) => match out.flush() {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache flush failed: key={}: {}", key, e);
                false
            }
        },
        None => false,
    };

    let length_ok = expected_len.map_or(true, |expected| expected == written);
    if !length_ok {
        debug!(
            "Cache write length mismatch: key={}, expected={:?}, written={}",
            key, expected_len, written
        );
    }

    if clean_eof && flushed && length_ok {
        match editor.commit() {
            Ok(()) => {
                debug!("Cached stream committed: key={}, bytes={}", key, written);
                CacheOutcome::Committed(written)
            }
            Err(e) => {
                warn!("Cache commit failed: key={}: {}", key, e);
                CacheOutcome::Aborted
            }
        }
    } else {
        if let Err(e) = editor.abort() {
            warn!("Cache abort failed: key={}: {}", key, e);
        }
        CacheOutcome::Aborted
    }
}

impl<S> Stream for CachingStream<S>
where
    S: TryStream<Ok = Bytes> + Send + Unpin + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    type Item = Result<Bytes, S::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).try_poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_passed += bytes.len() as u64;
                self.send(WriterMessage::Chunk(bytes.clone()));
                if self.expected_len == Some(self.bytes_passed) {
                    self.send(WriterMessage::Finished);
                    self.sender = None;
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.send(WriterMessage::Failed(e.to_string()));
                self.sender = None;
                self.inner = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.send(WriterMessage::Finished);
                self.sender = None;
                self.inner = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for CachingStream<S>
where
    S: TryStream<Ok = Bytes> + Send + Unpin + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    fn drop(&mut self) {
        let sender = self.sender.take();
        let Some(inner) = self.inner.take() else {
            return;
        };

        // A sender still held here has not seen Finished, so the writer
        // aborts once the drain drops it.
        let drain = drain_upstream(inner, sender);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drain);
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("upstream-drain".to_string())
                    .spawn(move || futures::executor::block_on(drain));
                if let Err(e) = spawned {
                    warn!("Failed to start upstream drain: {}", e);
                }
            }
        }
    }
}

async fn drain_upstream<S>(mut inner: S, sender: Option<mpsc::UnboundedSender<WriterMessage>>)
where
    S: TryStream<Ok = Bytes> + Unpin,
    S::Error: fmt::Display,
{
    let mut drained = 0u64;
    loop {
        match inner.try_next().await {
            Ok(Some(bytes)) => drained += bytes.len() as u64,
            Ok(None) => break,
            Err(e) => {
                debug!("Upstream failed while draining: {}", e);
                break;
            }
        }
    }
    debug!("Drained abandoned upstream: bytes={}", drained);
    drop(sender);
}
