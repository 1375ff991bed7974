//! Download progress reporting for response bodies.

use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::Result;

/// One progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Bytes read so far.
    pub bytes_read: u64,
    /// Declared body length, if the server sent a usable `Content-Length`.
    pub content_length: Option<u64>,
    /// Set on the last notification for the body.
    pub done: bool,
}

impl ProgressEvent {
    /// Fraction complete in `0.0..=1.0`, when the length is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.content_length {
            Some(0) => Some(1.0),
            Some(len) => Some((self.bytes_read as f64 / len as f64).min(1.0)),
            None => None,
        }
    }
}

/// Receives progress notifications.
///
/// Called synchronously on the task reading the body, so implementations
/// should return quickly.
pub trait ProgressListener: Send + Sync {
    fn update(&self, event: ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn update(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Parse `Content-Length`, treating anything unusable as unknown.
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// A body stream that reports every chunk it yields to a listener.
pub struct ProgressStream<S> {
    inner: S,
    listener: Arc<dyn ProgressListener>,
    bytes_read: u64,
    content_length: Option<u64>,
    finished: bool,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    pub fn new(inner: S, content_length: Option<u64>, listener: Arc<dyn ProgressListener>) -> Self {
        Self {
            inner,
            listener,
            bytes_read: 0,
            content_length,
            finished: false,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn emit(&mut self, done: bool) {
        self.finished |= done;
        self.listener.update(ProgressEvent {
            bytes_read: self.bytes_read,
            content_length: self.content_length,
            done,
        });
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    this.bytes_read += chunk.len() as u64;
                    let done = this.content_length == Some(this.bytes_read);
                    this.emit(done);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // A failed body never reports completion.
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                // Unknown or mismatched lengths still get a closing event.
                if !this.finished {
                    this.emit(true);
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
