use axum::body::{to_bytes, Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use mtrcs_common::crypto::{ENCRYPTION_HEADER, ENCRYPTION_VALUE};
use mtrcs_common::sign::SIGNATURE_HEADER;

use crate::logging::TraceId;
use crate::state::AppState;

pub const REAL_IP_HEADER: &str = "X-Real-IP";

/// Upper bound on bodies buffered for verification or decryption.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

fn trace_id<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default()
}

async fn read_body(body: Body) -> Result<Bytes, Response> {
    to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("unreadable body: {e}")).into_response())
}

/// Rejects requests whose `X-Real-IP` is missing or outside the trusted
/// subnet with 403. Passes everything through when no subnet is configured.
pub async fn trusted_subnet(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let source = req
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok());
    if state.is_trusted(source) {
        return next.run(req).await;
    }
    tracing::warn!(
        trace_id = %trace_id(&req),
        source = source.unwrap_or("-"),
        "Request rejected: source outside trusted subnet"
    );
    (StatusCode::FORBIDDEN, "source address is not trusted").into_response()
}

/// Verifies the `HashSHA256` signature over the raw (still compressed) body
/// and signs the response body the same way.
///
/// Requests without the header pass unsigned, and their responses are not
/// signed either.
pub async fn verify_signature(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(signer) = state.signer.clone() else {
        return next.run(req).await;
    };
    let Some(signature) = req
        .headers()
        .get(SIGNATURE_HEADER)
        .map(|v| v.to_str().map(str::to_string))
    else {
        return next.run(req).await;
    };
    let trace_id = trace_id(&req);
    let Ok(signature) = signature else {
        return (StatusCode::BAD_REQUEST, "malformed signature header").into_response();
    };

    let (parts, body) = req.into_parts();
    let body = match read_body(body).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    if !signer.verify_hex(&body, &signature) {
        tracing::warn!(trace_id = %trace_id, "Request rejected: signature mismatch");
        return (StatusCode::BAD_REQUEST, "signature mismatch").into_response();
    }

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    let (mut parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(trace_id = %trace_id, error = %e, "Failed to buffer response for signing");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Ok(value) = HeaderValue::from_str(&signer.sign_hex(&body)) {
        parts.headers.insert(SIGNATURE_HEADER, value);
    }
    Response::from_parts(parts, Body::from(body))
}

/// Decrypts bodies sent with `Encryption: crypto-key`. Runs after gzip
/// decompression. Undecryptable payloads are rejected with 400.
pub async fn decrypt_payload(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let encrypted = req
        .headers()
        .get(ENCRYPTION_HEADER)
        .is_some_and(|v| v.as_bytes() == ENCRYPTION_VALUE.as_bytes());
    if !encrypted {
        return next.run(req).await;
    }
    let trace_id = trace_id(&req);
    let Some(decryptor) = state.decryptor.clone() else {
        tracing::warn!(trace_id = %trace_id, "Encrypted payload received but no private key is configured");
        return (StatusCode::BAD_REQUEST, "encryption is not configured").into_response();
    };

    let (mut parts, body) = req.into_parts();
    let cipher = match read_body(body).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let plain = match decryptor.decrypt(&cipher) {
        Ok(plain) => plain,
        Err(e) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "Request rejected: payload decryption failed");
            return (StatusCode::BAD_REQUEST, "payload decryption failed").into_response();
        }
    };
    parts.headers.remove(ENCRYPTION_HEADER);
    parts.headers.remove(header::CONTENT_LENGTH);
    next.run(Request::from_parts(parts, Body::from(plain))).await
}
