use crate::state::AppState;
use crate::{api, logging};
use axum::middleware;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;

/// Builds the HTTP router.
///
/// Requests pass, outermost first: request logging, trusted-subnet check,
/// signature check (over the body as sent), gzip handling, payload
/// decryption, then the handler.
pub fn build_http_app(state: AppState) -> Router {
    api::routes()
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::decrypt_payload,
        ))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::verify_signature,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::trusted_subnet,
        ))
        .layer(middleware::from_fn(logging::request_logging))
        .with_state(state)
}
