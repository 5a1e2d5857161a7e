//! HTTP handlers.
//!
//! The plain-text routes (`/update/{kind}/{name}/{value}`, `/value/{kind}/{name}`)
//! answer with text bodies; the JSON routes answer with either a
//! [`MetricRecord`] or an [`ApiResponse`] envelope.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use mtrcs_common::types::{ApiResponse, MetricKind, MetricRecord};
use mtrcs_storage::StorageError;
use serde::de::DeserializeOwned;

use crate::logging::TraceId;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/update/{kind}/{name}/{value}", post(update_plain))
        .route("/update/", post(update_json))
        .route("/updates/", post(update_batch))
        .route("/value/{kind}/{name}", get(value_plain))
        .route("/value/", post(value_json))
        .route("/ping", get(ping))
}

/// Status code for a storage failure; unexpected failures are logged.
fn storage_status(trace_id: &str, err: &StorageError) -> StatusCode {
    if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_invalid_input() {
        StatusCode::BAD_REQUEST
    } else {
        tracing::error!(trace_id = %trace_id, error = %err, "Storage operation failed");
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn text_error(trace_id: &str, err: StorageError) -> Response {
    (storage_status(trace_id, &err), err.to_string()).into_response()
}

fn json_error(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(ApiResponse::failed(detail))).into_response()
}

/// Parses a JSON body regardless of its content type; agents are not
/// required to send one.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))
}

/// Writes one record and returns it as stored (counters carry the new total).
async fn apply(state: &AppState, record: MetricRecord) -> Result<MetricRecord, StorageError> {
    record.validate()?;
    match record.kind {
        MetricKind::Gauge => {
            let value = record.value.unwrap_or_default();
            state.storage.update_gauge(&record.name, value).await?;
            Ok(MetricRecord::gauge(record.name, value))
        }
        MetricKind::Counter => {
            let total = state
                .storage
                .update_counter(&record.name, record.delta.unwrap_or_default())
                .await?;
            Ok(MetricRecord::counter(record.name, total))
        }
    }
}

/// Looks up the current value of `(kind, name)` as a record.
async fn lookup(state: &AppState, kind: MetricKind, name: &str) -> Result<MetricRecord, StorageError> {
    Ok(match kind {
        MetricKind::Gauge => state.storage.get_gauge(name).await?.into(),
        MetricKind::Counter => state.storage.get_counter(name).await?.into(),
    })
}

/// `POST /update/{kind}/{name}/{value}`
async fn update_plain(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Response {
    let record = match MetricRecord::parse(&kind, &name, &value) {
        Ok(record) => record,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match apply(&state, record).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => text_error(&trace_id, e),
    }
}

/// `POST /update/` with a single JSON record.
async fn update_json(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    body: Bytes,
) -> Response {
    let record: MetricRecord = match parse_json(&body) {
        Ok(record) => record,
        Err(resp) => return resp,
    };
    match apply(&state, record).await {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => json_error(storage_status(&trace_id, &e), e.to_string()),
    }
}

/// `POST /updates/` with a JSON array, applied all or nothing.
async fn update_batch(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    body: Bytes,
) -> Response {
    let records: Vec<MetricRecord> = match parse_json(&body) {
        Ok(records) => records,
        Err(resp) => return resp,
    };
    match state.storage.update_batch(&records).await {
        Ok(stored) => {
            tracing::debug!(trace_id = %trace_id, records = stored.len(), "Batch stored");
            Json(ApiResponse::ok()).into_response()
        }
        Err(e) => json_error(storage_status(&trace_id, &e), e.to_string()),
    }
}

/// `GET /value/{kind}/{name}`
async fn value_plain(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let kind: MetricKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match lookup(&state, kind, &name).await {
        Ok(record) => format_value(&record).into_response(),
        Err(e) => text_error(&trace_id, e),
    }
}

/// `POST /value/` with `{"id": .., "type": ..}`.
async fn value_json(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    body: Bytes,
) -> Response {
    let query: MetricRecord = match parse_json(&body) {
        Ok(query) => query,
        Err(resp) => return resp,
    };
    if query.name.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "metric id must not be empty");
    }
    match lookup(&state, query.kind, &query.name).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => json_error(storage_status(&trace_id, &e), e.to_string()),
    }
}

/// `GET /ping`: 200 when the backend answers.
async fn ping(State(state): State<AppState>, Extension(trace_id): Extension<TraceId>) -> Response {
    match state.storage.ping().await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            tracing::error!(trace_id = %trace_id, error = %e, "Storage ping failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Plain-text rendering of a stored value: shortest round-trip form for
/// gauges, decimal for counters.
fn format_value(record: &MetricRecord) -> String {
    match (record.value, record.delta) {
        (Some(v), _) => v.to_string(),
        (None, Some(d)) => d.to_string(),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_values_use_shortest_form() {
        assert_eq!(format_value(&MetricRecord::gauge("a", 2.0)), "2");
        assert_eq!(format_value(&MetricRecord::gauge("a", 0.1)), "0.1");
        assert_eq!(format_value(&MetricRecord::gauge("a", -1234.5678)), "-1234.5678");
        assert_eq!(format_value(&MetricRecord::counter("c", 42)), "42");
    }

    #[test]
    fn storage_errors_map_to_status() {
        let not_found = StorageError::NoSuchMetric {
            kind: MetricKind::Gauge,
            name: "x".to_string(),
        };
        assert_eq!(storage_status("t", &not_found), StatusCode::NOT_FOUND);
        let overflow = StorageError::CounterOverflow {
            name: "x".to_string(),
        };
        assert_eq!(storage_status("t", &overflow), StatusCode::BAD_REQUEST);
    }
}
