use anyhow::Result;
use mtrcs_common::proto::metrics_collector_server::MetricsCollectorServer;
use mtrcs_common::shutdown::shutdown_signal;
use mtrcs_server::backend::Backend;
use mtrcs_server::config::ServerConfig;
use mtrcs_server::state::AppState;
use mtrcs_server::{app, grpc};
use tokio::sync::watch;
use tonic::transport::Server as TonicServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mtrcs=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/server.toml".to_string());
    let config = ServerConfig::load(&config_path)?;

    let backend = Backend::open(&config).await?;
    tracing::info!(
        http = %config.http_addr,
        grpc = ?config.grpc_addr,
        backend = backend.name(),
        signed = config.key.is_some(),
        encrypted = config.crypto_key.is_some(),
        trusted_subnet = ?config.trusted_subnet,
        "mtrcs-server starting"
    );

    let http_addr = config.http_addr;
    let grpc_addr = config.grpc_addr;
    let state = AppState::new(backend.storage(), config)?;
    let snapshotter = backend.spawn_snapshotter();

    let shutdown = shutdown_signal()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // gRPC server
    let grpc_handle = grpc_addr.map(|addr| {
        let service = MetricsCollectorServer::new(grpc::MetricsCollectorServiceImpl::new(state.clone()));
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = TonicServer::builder()
                .add_service(service)
                .serve_with_shutdown(addr, async move {
                    let _ = rx.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "gRPC server error");
            }
        })
    });

    // HTTP server
    let app = app::build_http_app(state);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let mut rx = shutdown_rx.clone();
    let http_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("Server started");
    let signal = shutdown.await;
    tracing::info!(signal, "Shutting down gracefully");

    let _ = shutdown_tx.send(true);
    let _ = http_handle.await;
    if let Some(handle) = grpc_handle {
        let _ = handle.await;
    }
    if let Some(handle) = snapshotter {
        handle.abort();
    }
    if let Err(e) = backend.final_save().await {
        tracing::error!(error = %e, "Final snapshot failed");
    }
    tracing::info!("Server stopped");

    Ok(())
}
