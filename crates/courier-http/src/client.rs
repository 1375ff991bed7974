//! Shared HTTP clients and call execution.

use once_cell::sync::OnceCell;
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{build_engine, ClientConfig};
use crate::dispatcher::{CallGuard, CallState, Dispatcher, InFlightCall};
use crate::error::{HttpError, Result};
use crate::progress::ProgressListener;
use crate::request::{
    build_form_body, build_get_url, build_headers, build_json_body, build_multipart_body,
    build_request, Params, Request, RequestBody, Tag,
};
use crate::response::Response;

static DEFAULT_CLIENT: OnceCell<Client> = OnceCell::new();

/// The process-wide client, built from [`ClientConfig::from_env`] on first use.
///
/// # Panics
///
/// Panics if the client cannot be built (for example when the TLS backend
/// fails to initialize); nothing can be sent without it.
pub fn default_client() -> &'static Client {
    DEFAULT_CLIENT.get_or_init(|| {
        Client::with_config(ClientConfig::from_env())
            .unwrap_or_else(|e| panic!("failed to build default HTTP client: {e}"))
    })
}

/// Like [`default_client`] but reports construction failures.
pub fn try_default_client() -> Result<&'static Client> {
    DEFAULT_CLIENT.get_or_try_init(|| Client::with_config(ClientConfig::from_env()))
}

/// Derive a client that reports download progress to `listener`.
///
/// `base` defaults to the [`default_client`]. Without a listener the base is
/// returned as-is.
pub fn with_progress(base: Option<&Client>, listener: Option<Arc<dyn ProgressListener>>) -> Client {
    let base = base.unwrap_or_else(|| default_client());
    match listener {
        Some(listener) => base.with_progress(listener),
        None => base.clone(),
    }
}

struct ClientInner {
    engine: reqwest::Client,
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
}

/// An HTTP client with its own connection pool and call dispatcher.
///
/// Cloning is cheap; clones share the pool and the dispatcher.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    progress: Option<Arc<dyn ProgressListener>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("dispatcher", &self.inner.dispatcher)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Client {
    /// Create a new client with default config.
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a new client with custom config.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let engine = build_engine(&config)?;
        let dispatcher = Arc::new(Dispatcher::new(config.max_requests));
        tracing::debug!(
            connect_timeout = ?config.connect_timeout,
            read_timeout = ?config.read_timeout,
            write_timeout = ?config.write_timeout,
            tls = ?config.tls,
            "built HTTP client"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                engine,
                config,
                dispatcher,
            }),
            progress: None,
        })
    }

    /// A client sharing this one's pool and dispatcher whose responses
    /// report read progress to `listener`.
    pub fn with_progress(&self, listener: Arc<dyn ProgressListener>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            progress: Some(listener),
        }
    }

    pub fn has_progress(&self) -> bool {
        self.progress.is_some()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Get the inner reqwest client.
    pub fn engine(&self) -> &reqwest::Client {
        &self.inner.engine
    }

    /// Whether two handles share the same pool and dispatcher.
    pub fn shares_state_with(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Prepare a call for `request` without starting it.
    pub fn new_call(&self, request: Request) -> Call {
        Call {
            client: self.clone(),
            request,
        }
    }

    /// Start `request` in the background.
    pub fn submit(&self, request: Request) -> InFlightCall {
        self.new_call(request).enqueue()
    }

    /// Prepare a GET; `params` are appended to the url.
    pub fn get(
        &self,
        url: &str,
        params: Option<&Params>,
        headers: Option<&Params>,
        tag: Option<Tag>,
    ) -> Result<Call> {
        let url = build_get_url(url, params);
        let request = build_request(Method::GET, &url, RequestBody::Empty, build_headers(headers)?, tag)?;
        Ok(self.new_call(request))
    }

    /// Prepare a POST with an arbitrary body.
    pub fn post(
        &self,
        url: &str,
        body: RequestBody,
        headers: Option<&Params>,
        tag: Option<Tag>,
    ) -> Result<Call> {
        let request = build_request(Method::POST, url, body, build_headers(headers)?, tag)?;
        Ok(self.new_call(request))
    }

    /// Prepare a POST with a JSON string body.
    pub fn post_json(
        &self,
        url: &str,
        json: impl Into<String>,
        headers: Option<&Params>,
        tag: Option<Tag>,
    ) -> Result<Call> {
        self.post(url, build_json_body(json), headers, tag)
    }

    /// Prepare a form POST. Params without a value are left out.
    pub fn post_form(
        &self,
        url: &str,
        params: Option<&Params>,
        headers: Option<&Params>,
        tag: Option<Tag>,
    ) -> Result<Call> {
        self.post(url, build_form_body(params), headers, tag)
    }

    /// Prepare a multipart POST uploading `files` plus `params` as fields.
    ///
    /// Fails with [`HttpError::FileNotFound`] before anything is sent when a
    /// file is missing.
    pub fn post_multipart(
        &self,
        url: &str,
        files: &[PathBuf],
        params: Option<&Params>,
        headers: Option<&Params>,
        tag: Option<Tag>,
    ) -> Result<Call> {
        self.post(url, build_multipart_body(files, params)?, headers, tag)
    }

    /// Cancel every queued and running call made through this client.
    pub fn cancel_all(&self) -> usize {
        self.inner.dispatcher.cancel_all()
    }

    /// Cancel the calls tagged `tag`; `None` cancels everything.
    pub fn cancel_tagged(&self, tag: Option<&Tag>) -> usize {
        self.inner.dispatcher.cancel_tagged(tag)
    }

    async fn run(&self, request: Request, guard: &CallGuard, queued: bool) -> Result<Response> {
        let cell = guard.cell();
        let method = request.method().clone();
        let url = request.url().clone();
        let started = Instant::now();

        let work = async {
            let _permit = if queued {
                let permit = self.inner.dispatcher.acquire().await?;
                guard.promote()?;
                Some(permit)
            } else {
                None
            };

            let engine_request = request.into_engine(&self.inner.engine).await?;
            let response = tokio::time::timeout(
                self.inner.config.header_timeout(),
                self.inner.engine.execute(engine_request),
            )
            .await
            .map_err(|_| HttpError::Timeout)??;

            Ok::<_, HttpError>(Response::from_engine(
                response,
                self.inner.config.read_timeout,
                self.progress.clone(),
            ))
        };

        tracing::debug!(call = guard.id(), tag = ?guard.tag(), "{} {}", method, url);

        let result = tokio::select! {
            biased;
            _ = cell.cancelled() => Err(HttpError::Cancelled),
            result = work => result,
        };

        match &result {
            Ok(response) => tracing::debug!(
                call = guard.id(),
                status = response.code(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{} {}", method, url
            ),
            Err(HttpError::Cancelled) => {
                tracing::warn!(call = guard.id(), tag = ?guard.tag(), "{} {} cancelled", method, url)
            }
            Err(e) => tracing::debug!(call = guard.id(), error = %e, "{} {} failed", method, url),
        }

        result
    }
}

/// A prepared request bound to the client that will send it.
#[derive(Debug)]
pub struct Call {
    client: Client,
    request: Request,
}

impl Call {
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Send the request and wait for the response headers.
    ///
    /// The call is tracked as running for the whole round trip and can be
    /// cancelled through the client's dispatcher.
    pub async fn execute(self) -> Result<Response> {
        let guard = self
            .client
            .inner
            .dispatcher
            .register(self.request.tag().cloned(), CallState::Running);
        let result = self.client.run(self.request, &guard, false).await;
        guard.finish(&result);
        result
    }

    /// Queue the request on the runtime and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(self) -> InFlightCall {
        let guard = self
            .client
            .inner
            .dispatcher
            .register(self.request.tag().cloned(), CallState::Queued);
        let ticket = guard.ticket();
        let Call { client, request } = self;

        let handle = tokio::spawn(async move {
            let result = client.run(request, &guard, true).await;
            guard.finish(&result);
            result
        });

        ticket.attach(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;

    #[test]
    fn test_client_creation() {
        let client = Client::new().unwrap();
        assert!(!client.has_progress());
        assert_eq!(client.dispatcher().max_requests(), 64);
    }

    #[test]
    fn test_default_client_is_shared() {
        let a = default_client();
        let b = default_client();
        assert!(std::ptr::eq(a, b));
        assert!(try_default_client().unwrap().shares_state_with(a));
    }

    #[test]
    fn test_with_progress_without_listener_returns_base() {
        let base = Client::new().unwrap();
        let same = with_progress(Some(&base), None);
        assert!(same.shares_state_with(&base));
        assert!(!same.has_progress());

        let default = with_progress(None, None);
        assert!(default.shares_state_with(default_client()));
    }

    #[test]
    fn test_with_progress_shares_pool_and_dispatcher() {
        let base = Client::new().unwrap();
        let listener: Arc<dyn ProgressListener> = Arc::new(|_: ProgressEvent| {});
        let derived = with_progress(Some(&base), Some(listener));
        assert!(derived.has_progress());
        assert!(derived.shares_state_with(&base));
        assert!(Arc::ptr_eq(derived.dispatcher(), base.dispatcher()));
    }

    #[test]
    fn test_get_builds_url_and_tag() {
        let client = Client::new().unwrap();
        let params = Params::new().set("a", "1").set_absent("b");
        let call = client
            .get("http://example.test/api", Some(&params), None, Some("job-1".into()))
            .unwrap();
        assert_eq!(call.request().url().as_str(), "http://example.test/api?a=1&b=");
        assert_eq!(call.request().tag(), Some(&Tag::from("job-1")));
        assert_eq!(*call.request().method(), Method::GET);
    }

    #[test]
    fn test_invalid_url_rejected_before_sending() {
        let client = Client::new().unwrap();
        let err = client.post_json("example.test/no-scheme", "{}", None, None).unwrap_err();
        assert!(matches!(err, HttpError::InvalidArgument(_)));
        assert_eq!(client.dispatcher().running_count(), 0);
    }

    #[test]
    fn test_multipart_missing_file_rejected() {
        let client = Client::new().unwrap();
        let err = client
            .post_multipart(
                "http://example.test/upload",
                &[PathBuf::from("/definitely/not/here.bin")],
                None,
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, HttpError::FileNotFound { .. }));
    }
}
