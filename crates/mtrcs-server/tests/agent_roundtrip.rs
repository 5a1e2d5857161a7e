//! Agent transports talking to a real server instance.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{build_test_context_with, with_decryptor, TestContext};
use mtrcs_agent::dispatcher::{Dispatcher, DispatcherOptions};
use mtrcs_agent::transport::{GrpcTransport, HttpTransport, Transport};
use mtrcs_common::proto::metrics_collector_server::MetricsCollectorServer;
use mtrcs_common::sign::Signer;
use mtrcs_common::types::MetricRecord;
use mtrcs_server::config::ServerConfig;
use mtrcs_server::grpc::MetricsCollectorServiceImpl;
use mtrcs_storage::{MemStorage, MetricGetter, MetricUpdater, Storage};

async fn serve_http(ctx: &TestContext) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let app = ctx.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn secured_config() -> ServerConfig {
    ServerConfig {
        key: Some("shared-secret".to_string()),
        trusted_subnet: Some("127.0.0.0/8".parse().unwrap()),
        ..Default::default()
    }
}

#[tokio::test]
async fn http_transport_with_signing_and_encryption() {
    let (ctx, decryptor) = with_decryptor(build_test_context_with(secured_config()));
    let addr = serve_http(&ctx).await;

    let transport = HttpTransport::new(
        &addr,
        Duration::from_secs(5),
        Some(Signer::new("shared-secret").unwrap()),
        Some(decryptor.encryptor()),
        Some("127.0.0.1".to_string()),
    )
    .unwrap();

    // large enough to need several RSA blocks
    let records: Vec<MetricRecord> = (0..40)
        .map(|i| MetricRecord::gauge(format!("Gauge{i}"), i as f64 * 0.5))
        .chain([MetricRecord::counter("PollCount", 12)])
        .collect();
    transport.send(&records).await.unwrap();

    assert_eq!(ctx.storage().get_all_gauges().await.unwrap().len(), 40);
    assert_eq!(ctx.storage().get_gauge("Gauge39").await.unwrap().value, 19.5);
    assert_eq!(ctx.storage().get_counter("PollCount").await.unwrap().value, 12);
}

#[tokio::test]
async fn http_transport_with_wrong_key_is_rejected() {
    let ctx = build_test_context_with(secured_config());
    let addr = serve_http(&ctx).await;

    let transport = HttpTransport::new(
        &addr,
        Duration::from_secs(5),
        Some(Signer::new("guessed").unwrap()),
        None,
        Some("127.0.0.1".to_string()),
    )
    .unwrap();
    assert!(transport.send(&[MetricRecord::gauge("Alloc", 1.0)]).await.is_err());

    let untrusted = HttpTransport::new(
        &addr,
        Duration::from_secs(5),
        Some(Signer::new("shared-secret").unwrap()),
        None,
        Some("203.0.113.9".to_string()),
    )
    .unwrap();
    assert!(untrusted.send(&[MetricRecord::gauge("Alloc", 1.0)]).await.is_err());
    assert!(ctx.storage().get_gauge("Alloc").await.is_err());
}

#[tokio::test]
async fn dispatcher_reports_counter_deltas() {
    let ctx = build_test_context_with(ServerConfig::default());
    let addr = serve_http(&ctx).await;

    let agent_storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
    let transport = Arc::new(
        HttpTransport::new(&addr, Duration::from_secs(5), None, None, None).unwrap(),
    );
    let dispatcher = Dispatcher::start(
        agent_storage.clone(),
        transport,
        DispatcherOptions {
            rate_limit: 2,
            request_timeout: Duration::from_secs(5),
        },
    );

    agent_storage.update_counter("PollCount", 3).await.unwrap();
    agent_storage.update_gauge("RandomValue", 0.25).await.unwrap();
    dispatcher.report().await.unwrap();

    agent_storage.update_counter("PollCount", 4).await.unwrap();
    dispatcher.report().await.unwrap();
    dispatcher.shutdown(Duration::from_secs(5)).await;

    assert_eq!(dispatcher.delivered(), 2);
    // the server accumulates the deltas back into the agent's running total
    assert_eq!(ctx.storage().get_counter("PollCount").await.unwrap().value, 7);
    assert_eq!(ctx.storage().get_gauge("RandomValue").await.unwrap().value, 0.25);
    assert!(ctx.storage().get_gauge("LastPollCount").await.is_err());
}

#[tokio::test]
async fn grpc_transport_round_trip() {
    let ctx = build_test_context_with(ServerConfig {
        trusted_subnet: Some("127.0.0.0/8".parse().unwrap()),
        ..Default::default()
    });

    // reserve a free port, then hand it to tonic
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let service = MetricsCollectorServer::new(MetricsCollectorServiceImpl::new(ctx.state.clone()));
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve(addr)
            .await
            .unwrap();
    });

    for _ in 0..50 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let transport = GrpcTransport::new(
        &addr.to_string(),
        Duration::from_secs(5),
        Some("127.0.0.1".to_string()),
    )
    .unwrap();
    transport
        .send(&[MetricRecord::gauge("Alloc", 8.0), MetricRecord::counter("PollCount", 2)])
        .await
        .unwrap();

    assert_eq!(ctx.storage().get_gauge("Alloc").await.unwrap().value, 8.0);
    assert_eq!(ctx.storage().get_counter("PollCount").await.unwrap().value, 2);
}
