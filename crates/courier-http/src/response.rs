//! HTTP responses and body materialization.
//!
//! Every accessor consumes the response, so a body can only be read once.
//! Strict accessors fail with [`HttpError::Status`] on a non-2xx status
//! before touching the body; the `_force` variants never look at the status.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{HttpError, Result};
use crate::progress::{self, ProgressListener, ProgressStream};
use crate::{fs, json};

/// A response body as a stream of chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A received response whose body has not been read yet.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: BodyStream,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Assemble a response from its parts.
    pub fn from_parts(status: StatusCode, headers: HeaderMap, url: Url, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            url,
            body,
        }
    }

    /// Wrap an engine response, bounding each chunk read by `read_timeout`
    /// and reporting progress when a listener is attached.
    pub(crate) fn from_engine(
        response: reqwest::Response,
        read_timeout: Duration,
        listener: Option<Arc<dyn ProgressListener>>,
    ) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let length = progress::content_length(&headers);

        let chunks = response.bytes_stream().map(|chunk| chunk.map_err(HttpError::from));
        let timed = with_read_timeout(Box::pin(chunks), read_timeout);

        let body: BodyStream = match listener {
            Some(listener) => Box::pin(ProgressStream::new(timed, length, listener)),
            None => timed,
        };

        Self::from_parts(status, headers, url, body)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Numeric status code.
    pub fn code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Standard reason phrase for the status code, empty for unregistered
    /// codes. A custom phrase sent by the server is not preserved.
    pub fn message(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Declared body length from `Content-Length`.
    pub fn content_length(&self) -> Option<u64> {
        progress::content_length(&self.headers)
    }

    /// Fail with [`HttpError::Status`] unless the status is 2xx.
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(HttpError::Status {
                code: self.code(),
                message: self.message().to_string(),
            })
        }
    }

    pub async fn bytes(self) -> Result<Bytes> {
        self.error_for_status()?.bytes_force().await
    }

    pub async fn bytes_force(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub async fn text(self) -> Result<String> {
        self.error_for_status()?.text_force().await
    }

    /// Body as text whatever the status. Invalid UTF-8 is replaced.
    pub async fn text_force(self) -> Result<String> {
        let bytes = self.bytes_force().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn map(self) -> Result<Map<String, Value>> {
        self.error_for_status()?.map_force().await
    }

    pub async fn map_force(self) -> Result<Map<String, Value>> {
        json::to_map(&self.text_force().await?)
    }

    pub async fn object<T: DeserializeOwned>(self) -> Result<T> {
        self.error_for_status()?.object_force().await
    }

    pub async fn object_force<T: DeserializeOwned>(self) -> Result<T> {
        json::from_json(&self.text_force().await?)
    }

    pub fn stream(self) -> Result<BodyStream> {
        Ok(self.error_for_status()?.body)
    }

    pub fn stream_force(self) -> BodyStream {
        self.body
    }

    /// Copy the body into `sink`, returning the number of bytes written.
    pub async fn write_to<W>(self, sink: &mut W) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        self.error_for_status()?.write_to_force(sink).await
    }

    pub async fn write_to_force<W>(self, sink: &mut W) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        fs::copy_stream(self.body, sink).await
    }

    /// Save the body to `path`, creating parent directories.
    ///
    /// Returns `None` when `path` is not a regular file afterwards.
    pub async fn file(self, path: impl AsRef<Path>) -> Result<Option<PathBuf>> {
        self.error_for_status()?.file_force(path).await
    }

    pub async fn file_force(self, path: impl AsRef<Path>) -> Result<Option<PathBuf>> {
        let written = fs::write_stream_to_file(self.body, path, true).await?;
        match tokio::fs::metadata(&written).await {
            Ok(meta) if meta.is_file() => Ok(Some(written)),
            _ => Ok(None),
        }
    }
}

/// End the stream with [`HttpError::Timeout`] when a chunk takes longer
/// than `timeout` to arrive.
fn with_read_timeout<S>(inner: S, timeout: Duration) -> BodyStream
where
    S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
{
    Box::pin(futures_util::stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(timeout, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((Err(HttpError::Timeout), None)),
        }
    }))
}
