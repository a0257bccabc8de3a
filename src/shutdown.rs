use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The first signal cancels the returned shutdown token: the node stops
/// taking work and defers exit until any local render finishes. A second
/// signal cancels the force token, abandoning the render immediately.
pub fn install_shutdown_handler() -> (CancellationToken, CancellationToken) {
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let force_clone = force.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, initiating graceful shutdown");
            }
        }
        shutdown_clone.cancel();

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("received second SIGTERM, forcing exit");
            }
            _ = sigint.recv() => {
                tracing::warn!("received second SIGINT, forcing exit");
            }
        }
        force_clone.cancel();
    });

    (shutdown, force)
}
