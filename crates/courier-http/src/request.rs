//! HTTP request types and builders.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Method};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use url::Url;

use crate::error::{HttpError, Result};
use crate::json;

/// Common content types.
pub mod content_types {
    pub const FORM: &str = "application/x-www-form-urlencoded; charset=utf-8";
    pub const JSON: &str = "application/json; charset=utf-8";
    pub const OCTET_STREAM: &str = "application/octet-stream";
}

/// Field name every uploaded file is attached under.
pub const MULTIPART_FILE_FIELD: &str = "file";

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Opaque label grouping calls for bulk cancellation. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(String);

impl Tag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for Tag {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Ordered key/value pairs whose values may be absent.
///
/// Keys are unique: inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, Option<String>)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key with a value.
    pub fn set(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(key, Some(value.into()))
    }

    /// Add a key with an absent value.
    pub fn set_absent(self, key: impl Into<String>) -> Self {
        self.with(key, None)
    }

    /// Add a key with an optional value.
    pub fn with(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, Option<V>)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v.map(Into::into));
        }
        params
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, Option<V>); N]> for Params {
    fn from(entries: [(K, Option<V>); N]) -> Self {
        entries.into_iter().collect()
    }
}

/// Files and fields of a multipart/form-data body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartBody {
    files: Vec<PathBuf>,
    fields: Vec<(String, Option<String>)>,
}

impl MultipartBody {
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    async fn into_form(self) -> Result<Form> {
        let mut form = Form::new();

        for path in self.files {
            let file = tokio::fs::File::open(&path).await?;
            let length = file.metadata().await?.len();
            let name = file_name(&path);
            let part = Part::stream_with_length(Body::wrap_stream(file_chunks(file)), length)
                .file_name(name)
                .mime_str(content_types::OCTET_STREAM)?;
            form = form.part(MULTIPART_FILE_FIELD, part);
        }

        // Absent values still produce a named part.
        for (key, value) in self.fields {
            form = form.text(key, value.unwrap_or_default());
        }

        Ok(form)
    }
}

/// Request body variants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Already url-encoded `k=v&k=v` pairs (possibly zero pairs).
    Form(String),
    Json(String),
    Multipart(MultipartBody),
}

impl RequestBody {
    /// Serialize `value` into a JSON body.
    pub fn json_value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Json(json::to_json(value)?))
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Self::Empty | Self::Multipart(_) => None,
            Self::Form(_) => Some(content_types::FORM),
            Self::Json(_) => Some(content_types::JSON),
        }
    }
}

/// An immutable request, ready to be handed to exactly one call.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
    tag: Option<Tag>,
}

impl Request {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    /// Turn this request into an engine request, reading upload files.
    pub(crate) async fn into_engine(self, engine: &reqwest::Client) -> Result<reqwest::Request> {
        let mut builder = engine
            .request(self.method, self.url)
            .headers(self.headers);

        builder = match self.body {
            RequestBody::Empty => builder,
            RequestBody::Form(encoded) => builder
                .header(CONTENT_TYPE, content_types::FORM)
                .body(encoded),
            RequestBody::Json(json) => builder.header(CONTENT_TYPE, content_types::JSON).body(json),
            RequestBody::Multipart(multipart) => builder.multipart(multipart.into_form().await?),
        };

        builder.build().map_err(HttpError::from)
    }
}

/// Append `params` to `url` as a query string, in order.
///
/// Absent values render as `key=`. Nothing is percent-encoded. The url is
/// returned unchanged when it is blank or there are no params.
pub fn build_get_url(url: &str, params: Option<&Params>) -> String {
    let params = match params {
        Some(p) if !p.is_empty() && !url.trim().is_empty() => p,
        _ => return url.to_string(),
    };

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v.unwrap_or("")))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", url, query)
}

/// Build a header map. Absent values become empty header values.
pub fn build_headers(headers: Option<&Params>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    let Some(headers) = headers else {
        return Ok(map);
    };

    for (name, value) in headers.iter() {
        let name = HeaderName::try_from(name)
            .map_err(|e| HttpError::InvalidArgument(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::try_from(value.unwrap_or("")).map_err(|e| {
            HttpError::InvalidArgument(format!("invalid value for header {name}: {e}"))
        })?;
        map.append(name, value);
    }

    Ok(map)
}

/// Build a request for an absolute `http`/`https` url.
pub fn build_request(
    method: Method,
    url: &str,
    body: RequestBody,
    headers: HeaderMap,
    tag: Option<Tag>,
) -> Result<Request> {
    let parsed = Url::parse(url)
        .map_err(|e| HttpError::InvalidArgument(format!("invalid URL {url:?}: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(HttpError::InvalidArgument(format!(
            "unsupported URL scheme {:?} in {url:?}",
            parsed.scheme()
        )));
    }

    Ok(Request {
        method,
        url: parsed,
        headers,
        body,
        tag,
    })
}

/// Build a form-url-encoded body. Entries with an absent value are dropped.
pub fn build_form_body(params: Option<&Params>) -> RequestBody {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(params) = params {
        for (key, value) in params.iter() {
            if let Some(value) = value {
                serializer.append_pair(key, value);
            }
        }
    }
    RequestBody::Form(serializer.finish())
}

/// Build a JSON body from an already-encoded string.
pub fn build_json_body(json: impl Into<String>) -> RequestBody {
    RequestBody::Json(json.into())
}

/// Build a multipart body.
///
/// Every file is checked before anything else happens; the first missing
/// or non-regular file fails the whole body.
pub fn build_multipart_body(files: &[PathBuf], params: Option<&Params>) -> Result<RequestBody> {
    for path in files {
        check_upload_file(path)?;
    }

    let fields = params
        .map(|p| {
            p.iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                .collect()
        })
        .unwrap_or_default();

    Ok(RequestBody::Multipart(MultipartBody {
        files: files.to_vec(),
        fields,
    }))
}

fn check_upload_file(path: &Path) -> Result<()> {
    let not_found = |reason: &str| HttpError::FileNotFound {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(not_found("is not a regular file")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found("not found")),
        Err(e) => Err(not_found(&e.to_string())),
    }
}

/// Read an upload file in chunks so it is never held in memory whole.
fn file_chunks(file: tokio::fs::File) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Sync {
    futures_util::stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = BytesMut::with_capacity(UPLOAD_CHUNK_SIZE);
        match file.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(file))),
            Err(e) => Some((Err(e), None)),
        }
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params(entries: &[(&str, Option<&str>)]) -> Params {
        entries.iter().map(|(k, v)| (*k, v.map(str::to_string))).collect()
    }

    #[test]
    fn test_get_url_with_absent_value() {
        let p = Params::new().set("a", "1").set_absent("b");
        assert_eq!(
            build_get_url("http://example.test/api", Some(&p)),
            "http://example.test/api?a=1&b="
        );
    }

    #[test]
    fn test_get_url_unchanged_without_params() {
        assert_eq!(build_get_url("http://x.test/a", None), "http://x.test/a");
        assert_eq!(build_get_url("http://x.test/a", Some(&Params::new())), "http://x.test/a");
        assert_eq!(build_get_url("   ", Some(&params(&[("a", Some("1"))]))), "   ");
    }

    #[test]
    fn test_params_keys_unique_keep_position() {
        let p = Params::new().set("a", "1").set("b", "2").set("a", "3");
        let keys: Vec<_> = p.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(p.get("a"), Some(Some("3")));
        assert_eq!(p.get("zzz"), None);
    }

    #[test]
    fn test_form_body_drops_absent() {
        let p = params(&[("a", Some("1")), ("b", None), ("c", Some(""))]);
        assert_eq!(build_form_body(Some(&p)), RequestBody::Form("a=1&c=".into()));
    }

    #[test]
    fn test_form_body_all_absent_is_empty() {
        let p = params(&[("a", None), ("b", None)]);
        assert_eq!(build_form_body(Some(&p)), RequestBody::Form(String::new()));
        assert_eq!(build_form_body(None), RequestBody::Form(String::new()));
    }

    #[test]
    fn test_form_body_encodes() {
        let p = params(&[("name", Some("a b&c")), ("city", Some("上海"))]);
        let RequestBody::Form(encoded) = build_form_body(Some(&p)) else {
            panic!("expected form body");
        };
        assert_eq!(encoded, "name=a+b%26c&city=%E4%B8%8A%E6%B5%B7");
    }

    #[test]
    fn test_build_request_rejects_relative_url() {
        let err = build_request(Method::GET, "/api/jobs", RequestBody::Empty, HeaderMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidArgument(_)));
    }

    #[test]
    fn test_build_request_rejects_other_schemes() {
        let err = build_request(Method::GET, "ftp://x.test/", RequestBody::Empty, HeaderMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidArgument(_)));
    }

    #[test]
    fn test_build_request_keeps_tag_and_url() {
        let req = build_request(
            Method::POST,
            "http://example.test/api?a=1&b=",
            build_json_body("{}"),
            HeaderMap::new(),
            Some("job-42".into()),
        )
        .unwrap();
        assert_eq!(req.url().as_str(), "http://example.test/api?a=1&b=");
        assert_eq!(req.tag(), Some(&Tag::from("job-42")));
        assert_eq!(*req.method(), Method::POST);
        assert_eq!(req.body().content_type(), Some(content_types::JSON));
    }

    #[test]
    fn test_build_headers() {
        let h = params(&[("X-Trace", Some("abc")), ("X-Empty", None)]);
        let map = build_headers(Some(&h)).unwrap();
        assert_eq!(map.get("x-trace").unwrap(), "abc");
        assert_eq!(map.get("x-empty").unwrap(), "");
    }

    #[test]
    fn test_build_headers_invalid_name() {
        let h = params(&[("bad header", Some("v"))]);
        assert!(matches!(build_headers(Some(&h)), Err(HttpError::InvalidArgument(_))));
    }

    #[test]
    fn test_multipart_missing_file_fails_first() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.txt");
        std::fs::write(&present, "data").unwrap();
        let missing = dir.path().join("missing.txt");

        let err = build_multipart_body(&[present, missing.clone()], None).unwrap_err();
        match err {
            HttpError::FileNotFound { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_multipart_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_multipart_body(&[dir.path().to_path_buf()], None).unwrap_err();
        match err {
            HttpError::FileNotFound { reason, .. } => assert!(reason.contains("regular file")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_multipart_keeps_absent_fields() {
        let p = params(&[("a", Some("1")), ("b", None)]);
        let RequestBody::Multipart(body) = build_multipart_body(&[], Some(&p)).unwrap() else {
            panic!("expected multipart body");
        };
        let fields: Vec<_> = body.fields().collect();
        assert_eq!(fields, vec![("a", Some("1")), ("b", None)]);
        assert!(body.files().is_empty());
    }

    #[tokio::test]
    async fn test_into_engine_sets_form_content_type() {
        let engine = reqwest::Client::new();
        let req = build_request(
            Method::POST,
            "http://example.test/form",
            build_form_body(Some(&params(&[("a", Some("1"))]))),
            HeaderMap::new(),
            None,
        )
        .unwrap();

        let built = req.into_engine(&engine).await.unwrap();
        assert_eq!(built.headers().get(CONTENT_TYPE).unwrap(), content_types::FORM);
        assert_eq!(built.body().and_then(|b| b.as_bytes()), Some(&b"a=1"[..]));
    }

    #[tokio::test]
    async fn test_upload_file_read_in_chunks() {
        use futures_util::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let content: Vec<u8> = (0..UPLOAD_CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let chunks: Vec<Bytes> = file_chunks(file).map(|c| c.unwrap()).collect().await;

        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= UPLOAD_CHUNK_SIZE));
        assert_eq!(chunks.concat(), content);
    }

    proptest! {
        #[test]
        fn prop_get_url_separators(
            keys in proptest::collection::btree_set("[a-z]{1,6}", 1..8),
            value in "[a-z0-9]{0,4}",
        ) {
            let p: Params = keys.iter().map(|k| (k.clone(), Some(value.clone()))).collect();
            let url = build_get_url("http://example.test/api", Some(&p));
            prop_assert_eq!(url.matches('?').count(), 1);
            prop_assert_eq!(url.matches('&').count(), keys.len() - 1);

            let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
            let order: Vec<&str> = query.split('&').map(|kv| kv.split('=').next().unwrap_or("")).collect();
            let expected: Vec<&str> = keys.iter().map(String::as_str).collect();
            prop_assert_eq!(order, expected);
        }

        #[test]
        fn prop_form_body_skips_absent(
            present in proptest::collection::btree_set("[a-m]{1,5}", 0..5),
            absent in proptest::collection::btree_set("[n-z]{1,5}", 1..5),
        ) {
            let mut p = Params::new();
            for k in &absent {
                p.insert(k.clone(), None);
            }
            for k in &present {
                p.insert(k.clone(), Some("v".to_string()));
            }
            let RequestBody::Form(encoded) = build_form_body(Some(&p)) else {
                unreachable!("form builder returns a form body");
            };
            let pairs: Vec<_> = url::form_urlencoded::parse(encoded.as_bytes()).collect();
            prop_assert_eq!(pairs.len(), present.len());
            for (k, _) in &pairs {
                prop_assert!(!absent.contains(&k.to_string()));
            }
        }
    }
}
