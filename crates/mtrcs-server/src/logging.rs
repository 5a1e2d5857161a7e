use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::Rng;
use std::fmt::Write;
use std::time::Instant;

pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// Trace id of the current request, stored in request extensions.
#[derive(Clone)]
pub struct TraceId(pub String);

impl std::ops::Deref for TraceId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a 16-character hex trace ID (8 random bytes).
fn generate_trace_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let mut s = String::with_capacity(16);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Maximum number of characters to log from request/response body.
const MAX_BODY_LOG_CHARS: usize = 200;

/// Request bodies are only buffered for logging when their declared
/// `Content-Length` is at most this; anything else is passed through untouched.
const MAX_BODY_LOG_BUFFER: usize = 1024 * 1024;

/// Truncate a UTF-8 string to at most `max` bytes, snapping to the nearest
/// char boundary so we never split a multi-byte character.
fn truncate_body(bytes: &[u8], max: usize) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.len() > max => {
            let mut end = max;
            while end > 0 && !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        }
        Ok(s) => s.to_string(),
        Err(_) => "<non-utf8 body>".to_string(),
    }
}

/// Format elapsed time as a human-readable string.
fn format_elapsed(elapsed_us: u128) -> String {
    if elapsed_us < 1000 {
        format!("{elapsed_us}µs")
    } else if elapsed_us < 1_000_000 {
        format!("{}ms", elapsed_us / 1000)
    } else {
        format!("{:.1}s", elapsed_us as f64 / 1_000_000.0)
    }
}

/// Only plain, readable payloads are worth a log line; gzip or encrypted
/// bodies are skipped.
fn is_loggable(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json") || ct.starts_with("text/plain"))
}

/// Whether the declared request body is small enough to buffer for logging.
/// Chunked bodies without a `Content-Length` are never buffered.
fn fits_log_buffer(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_some_and(|len| len <= MAX_BODY_LOG_BUFFER)
}

/// Request/response logging middleware.
pub async fn request_logging(mut req: Request, next: Next) -> Response {
    let trace_id = generate_trace_id();
    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let source = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let buffer_body =
        method == "POST" && is_loggable(req.headers()) && fits_log_buffer(req.headers());
    let (req, req_body_snippet) = if buffer_body {
        let (parts, body) = req.into_parts();
        match axum::body::to_bytes(body, MAX_BODY_LOG_BUFFER).await {
            Ok(body_bytes) => {
                let snippet = truncate_body(&body_bytes, MAX_BODY_LOG_CHARS);
                (Request::from_parts(parts, Body::from(body_bytes)), snippet)
            }
            Err(e) => {
                tracing::warn!(trace_id = %trace_id, error = %e, "Failed to read request body");
                return (
                    StatusCode::BAD_REQUEST,
                    [(TRACE_ID_HEADER, trace_id)],
                    "failed to read request body",
                )
                    .into_response();
            }
        }
    } else {
        (req, String::new())
    };

    if req_body_snippet.is_empty() {
        tracing::info!(
            trace_id = %trace_id,
            method = %method,
            path = %path,
            source = %source,
            "--> request"
        );
    } else {
        tracing::info!(
            trace_id = %trace_id,
            method = %method,
            path = %path,
            source = %source,
            body = %req_body_snippet,
            "--> request"
        );
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = format_elapsed(start.elapsed().as_micros());
    let status = response.status();

    let (parts, body) = response.into_parts();
    let (body, body_snippet) = if is_loggable(&parts.headers) {
        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .unwrap_or_default();
        let snippet = truncate_body(&body_bytes, MAX_BODY_LOG_CHARS);
        (Body::from(body_bytes), snippet)
    } else {
        (body, String::new())
    };

    let status_code = status.as_u16();
    if status.is_server_error() {
        tracing::error!(
            trace_id = %trace_id,
            status = status_code,
            elapsed = %elapsed,
            body = %body_snippet,
            "<-- response"
        );
    } else if status.is_client_error() {
        tracing::warn!(
            trace_id = %trace_id,
            status = status_code,
            elapsed = %elapsed,
            body = %body_snippet,
            "<-- response"
        );
    } else {
        tracing::info!(
            trace_id = %trace_id,
            status = status_code,
            elapsed = %elapsed,
            "<-- response"
        );
    }

    let mut response = Response::from_parts(parts, body);
    if let Ok(val) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, val);
    }
    response
}
