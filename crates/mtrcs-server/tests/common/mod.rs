#![allow(dead_code)]

use std::io::{Read, Write};
use std::sync::Arc;

use axum::body::{to_bytes, Body, Bytes};
use axum::http::{header, HeaderMap, Request, StatusCode};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use mtrcs_common::crypto::PayloadDecryptor;
use mtrcs_server::app;
use mtrcs_server::config::ServerConfig;
use mtrcs_server::state::AppState;
use mtrcs_storage::{MemStorage, Storage};
use rsa::RsaPrivateKey;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub struct TestContext {
    pub temp_dir: TempDir,
    pub state: AppState,
    pub app: axum::Router,
}

impl TestContext {
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.state.storage
    }
}

pub fn build_test_context() -> TestContext {
    build_test_context_with(ServerConfig::default())
}

/// In-memory server state built from `config`; the snapshot path points into
/// a temporary directory.
pub fn build_test_context_with(mut config: ServerConfig) -> TestContext {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    config.file_storage_path = temp_dir.path().join("metrics.json");
    let state = AppState::new(Arc::new(MemStorage::new()), config).expect("app state");
    context_from_state(temp_dir, state)
}

pub fn context_from_state(temp_dir: TempDir, state: AppState) -> TestContext {
    let app = app::build_http_app(state.clone());
    TestContext {
        temp_dir,
        state,
        app,
    }
}

/// Adds a freshly generated RSA key pair to the context's state and returns it.
pub fn with_decryptor(ctx: TestContext) -> (TestContext, Arc<PayloadDecryptor>) {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa key");
    let decryptor = Arc::new(PayloadDecryptor::new(key));
    let mut state = ctx.state;
    state.decryptor = Some(decryptor.clone());
    (context_from_state(ctx.temp_dir, state), decryptor)
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response body should be JSON")
    }
}

pub async fn send(app: &axum::Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.expect("request should succeed");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn post_plain(app: &axum::Router, uri: &str) -> TestResponse {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::empty())
        .expect("request");
    send(app, request).await
}

pub async fn get(app: &axum::Router, uri: &str) -> TestResponse {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    send(app, request).await
}

/// Posts a JSON body with an explicit `Content-Length`, as a real client would.
pub async fn post_json(app: &axum::Router, uri: &str, body: Value) -> TestResponse {
    let body = body.to_string();
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .expect("request");
    send(app, request).await
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).expect("gunzip");
    out
}
