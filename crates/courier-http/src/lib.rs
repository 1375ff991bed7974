//! HTTP request/response utilities for Courier.
//!
//! A shared [`Client`] sends GET, JSON, form and multipart requests, tracks
//! every in-flight call by tag so groups of calls can be cancelled together,
//! and turns responses into text, JSON, streams or files.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fs;
pub mod json;
pub mod materialize;
pub mod progress;
pub mod request;
pub mod response;

pub use client::{default_client, try_default_client, with_progress, Call, Client};
pub use config::{ClientConfig, TlsPolicy};
pub use dispatcher::{CallId, CallInfo, CallState, Dispatcher, InFlightCall};
pub use error::{HttpError, Result};
pub use request::{
    build_form_body, build_get_url, build_headers, build_json_body, build_multipart_body,
    build_request, content_types, MultipartBody, Params, Request, RequestBody, Tag,
};
pub use response::{BodyStream, Response};
pub use progress::{ProgressEvent, ProgressListener, ProgressStream};
