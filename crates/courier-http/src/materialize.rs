//! Accessors for a response that may never have arrived.
//!
//! Each function mirrors a [`Response`] accessor but takes an
//! `Option<Response>`. `None` yields `Ok(None)`; a present response behaves
//! exactly like the method of the same name.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::response::{BodyStream, Response};

pub fn response_code(response: Option<&Response>) -> Option<u16> {
    response.map(Response::code)
}

pub async fn as_string(response: Option<Response>) -> Result<Option<String>> {
    match response {
        Some(r) => r.text().await.map(Some),
        None => Ok(None),
    }
}

pub async fn as_string_force(response: Option<Response>) -> Result<Option<String>> {
    match response {
        Some(r) => r.text_force().await.map(Some),
        None => Ok(None),
    }
}

pub async fn as_map(response: Option<Response>) -> Result<Option<Map<String, Value>>> {
    match response {
        Some(r) => r.map().await.map(Some),
        None => Ok(None),
    }
}

pub async fn as_map_force(response: Option<Response>) -> Result<Option<Map<String, Value>>> {
    match response {
        Some(r) => r.map_force().await.map(Some),
        None => Ok(None),
    }
}

pub async fn as_object<T: DeserializeOwned>(response: Option<Response>) -> Result<Option<T>> {
    match response {
        Some(r) => r.object().await.map(Some),
        None => Ok(None),
    }
}

pub async fn as_object_force<T: DeserializeOwned>(
    response: Option<Response>,
) -> Result<Option<T>> {
    match response {
        Some(r) => r.object_force().await.map(Some),
        None => Ok(None),
    }
}

pub fn as_stream(response: Option<Response>) -> Result<Option<BodyStream>> {
    response.map(Response::stream).transpose()
}

pub fn as_stream_force(response: Option<Response>) -> Option<BodyStream> {
    response.map(Response::stream_force)
}

pub async fn as_file(response: Option<Response>, path: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    match response {
        Some(r) => r.file(path).await,
        None => Ok(None),
    }
}

pub async fn as_file_force(
    response: Option<Response>,
    path: impl AsRef<Path>,
) -> Result<Option<PathBuf>> {
    match response {
        Some(r) => r.file_force(path).await,
        None => Ok(None),
    }
}
