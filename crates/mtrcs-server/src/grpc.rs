use crate::state::AppState;
use mtrcs_common::proto::metrics_collector_server::MetricsCollector;
use mtrcs_common::proto::{UpdateMetricsRequest, UpdateResponse};
use mtrcs_common::types::MetricRecord;
use tonic::{Request, Response, Status};

/// Metadata key carrying the agent's source address.
pub const REAL_IP_METADATA: &str = "x-real-ip";

pub struct MetricsCollectorServiceImpl {
    state: AppState,
}

impl MetricsCollectorServiceImpl {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

fn reply(ok: bool, detail: impl Into<String>) -> Response<UpdateResponse> {
    Response::new(UpdateResponse {
        ok,
        detail: detail.into(),
    })
}

#[tonic::async_trait]
impl MetricsCollector for MetricsCollectorServiceImpl {
    async fn update(
        &self,
        request: Request<UpdateMetricsRequest>,
    ) -> Result<Response<UpdateResponse>, Status> {
        let source = request
            .metadata()
            .get(REAL_IP_METADATA)
            .and_then(|v| v.to_str().ok());
        if !self.state.is_trusted(source) {
            tracing::warn!(source = source.unwrap_or("-"), "gRPC update rejected: untrusted source");
            return Err(Status::unauthenticated("source address is not trusted"));
        }

        let records = match request
            .into_inner()
            .metrics
            .into_iter()
            .map(MetricRecord::try_from)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "gRPC update rejected: invalid record");
                return Ok(reply(false, e.to_string()));
            }
        };

        match self.state.storage.update_batch(&records).await {
            Ok(stored) => {
                tracing::debug!(records = stored.len(), "gRPC batch stored");
                Ok(reply(true, ""))
            }
            Err(e) => {
                if !e.is_invalid_input() {
                    tracing::error!(error = %e, "gRPC batch failed");
                }
                Ok(reply(false, e.to_string()))
            }
        }
    }
}
