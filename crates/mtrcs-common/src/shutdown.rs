//! Termination signals shared by the agent and server binaries.

use std::future::Future;
use std::io;

/// Installs the termination handlers and returns a future resolving to the
/// name of the first signal received. On Unix that is SIGINT, SIGTERM or
/// SIGQUIT; elsewhere only Ctrl-C.
///
/// Handlers are registered before this returns, so a signal that arrives
/// before the future is first polled is not lost. Must be called from within
/// a Tokio runtime.
pub fn shutdown_signal() -> io::Result<impl Future<Output = &'static str>> {
    #[cfg(unix)]
    let (mut interrupt, mut terminate, mut quit) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::quit())?,
        )
    };

    Ok(async move {
        #[cfg(unix)]
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
        };

        #[cfg(not(unix))]
        let name = match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl-C",
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending().await
            }
        };

        tracing::info!(signal = name, "Received shutdown signal");
        name
    })
}
