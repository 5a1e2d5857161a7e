use std::sync::Arc;

use anyhow::Result;
use mtrcs_agent::config::AgentConfig;
use mtrcs_agent::dispatcher::{Dispatcher, DispatcherOptions};
use mtrcs_agent::{poller, transport};
use mtrcs_common::shutdown::shutdown_signal;
use mtrcs_storage::{MemStorage, Storage};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mtrcs=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());

    let config = AgentConfig::load(&config_path)?;
    tracing::info!(
        server = %config.server_addr,
        transport = ?config.transport,
        rate_limit = config.rate_limit,
        "mtrcs-agent starting"
    );

    let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
    let transport = transport::from_config(&config)?;
    let dispatcher = Arc::new(Dispatcher::start(
        storage.clone(),
        transport,
        DispatcherOptions {
            rate_limit: config.rate_limit,
            request_timeout: config.request_timeout(),
        },
    ));

    let mut collectors = mtrcs_collector::default_collectors();
    let mut poll_tick = interval(config.poll_interval());
    let mut report_tick = interval(config.report_interval());
    report_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick fires immediately; nothing has been collected yet
    report_tick.tick().await;

    let mut pending: Option<JoinHandle<()>> = None;
    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = poll_tick.tick() => {
                poller::poll_once(&mut collectors, storage.as_ref()).await;
            }
            _ = report_tick.tick() => {
                if pending.as_ref().is_some_and(|h| !h.is_finished()) {
                    tracing::warn!("Previous report is still waiting for a worker, skipping this cycle");
                    continue;
                }
                let dispatcher = dispatcher.clone();
                pending = Some(tokio::spawn(async move {
                    if let Err(e) = dispatcher.report().await {
                        tracing::warn!(error = %e, "Report failed");
                    }
                }));
            }
            signal = &mut shutdown => {
                tracing::info!(signal, "Shutting down gracefully");
                break;
            }
        }
    }

    // One last report so the final interval's deltas are not lost.
    let shutdown_timeout = config.shutdown_timeout();
    let final_report = async {
        if let Some(handle) = pending.take() {
            let _ = handle.await;
        }
        dispatcher.report().await
    };
    match tokio::time::timeout(shutdown_timeout, final_report).await {
        Ok(Ok(records)) => tracing::info!(records, "Final report queued"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Final report failed"),
        Err(_) => tracing::warn!("Final report timed out"),
    }
    dispatcher.shutdown(shutdown_timeout).await;

    Ok(())
}
