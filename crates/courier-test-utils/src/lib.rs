//! Test utilities for Courier crates.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Install a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    static INIT: Lazy<()> = Lazy::new(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,courier_http=debug"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });

    Lazy::force(&INIT);
}

/// Creates a temporary directory that is cleaned up on drop.
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Creates a temporary file with given content.
pub fn temp_file(content: &str) -> (TempDir, PathBuf) {
    let dir = temp_dir();
    let path = dir.path().join("test_file");
    std::fs::write(&path, content).expect("Failed to write temp file");
    (dir, path)
}

/// Creates one file per `(name, content)` pair in a shared temp directory.
pub fn temp_files(files: &[(&str, &[u8])]) -> (TempDir, Vec<PathBuf>) {
    let dir = temp_dir();
    let paths = files
        .iter()
        .map(|(name, content)| {
            let path = dir.path().join(name);
            std::fs::write(&path, content).expect("Failed to write temp file");
            path
        })
        .collect();
    (dir, paths)
}

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
}

/// Assert that a Result is Err and return the error.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
            Err(e) => e,
        }
    };
}

/// Mock HTTP server with shortcuts for the endpoints Courier tests need.
pub struct TestHttpServer {
    server: MockServer,
}

impl TestHttpServer {
    pub async fn start() -> Self {
        init_tracing();
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn url(&self) -> String {
        self.server.uri()
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    pub fn inner(&self) -> &MockServer {
        &self.server
    }

    /// Register a GET endpoint that returns JSON.
    pub async fn get_json<T: Serialize>(&self, endpoint: &str, response: &T) {
        Mock::given(method("GET"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .mount(&self.server)
            .await;
    }

    /// Register a POST endpoint that returns JSON.
    pub async fn post_json<T: Serialize>(&self, endpoint: &str, response: &T) {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .mount(&self.server)
            .await;
    }

    /// Register an endpoint answering any method with a plain body.
    pub async fn text(&self, endpoint: &str, status: u16, body: impl Into<Vec<u8>>) {
        Mock::given(path(endpoint))
            .respond_with(ResponseTemplate::new(status).set_body_bytes(body.into()))
            .mount(&self.server)
            .await;
    }

    /// Register an endpoint that returns a JSON error body.
    pub async fn error(&self, endpoint: &str, status: u16, message: &str) {
        Mock::given(path(endpoint))
            .respond_with(
                ResponseTemplate::new(status)
                    .set_body_json(serde_json::json!({ "error": message })),
            )
            .mount(&self.server)
            .await;
    }

    /// Register an endpoint that answers after `latency`.
    pub async fn with_latency<T: Serialize>(&self, endpoint: &str, response: &T, latency: Duration) {
        Mock::given(path(endpoint))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(response)
                    .set_delay(latency),
            )
            .mount(&self.server)
            .await;
    }

    pub async fn received_requests(&self) -> Vec<Request> {
        self.server.received_requests().await.unwrap_or_default()
    }

    /// Requests received on `endpoint`, oldest first.
    pub async fn requests_to(&self, endpoint: &str) -> Vec<Request> {
        self.received_requests()
            .await
            .into_iter()
            .filter(|r| r.url.path() == endpoint)
            .collect()
    }

    pub async fn verify_received(&self, endpoint: &str, times: usize) {
        let count = self.requests_to(endpoint).await.len();
        assert_eq!(
            count, times,
            "Expected {} requests to {}, got {}",
            times, endpoint, count
        );
    }
}
