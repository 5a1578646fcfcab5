use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The run is raced against this token; dropping the run tears
/// down every live worker.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, tearing down workers");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, tearing down workers");
            }
        }

        token_clone.cancel();

        // A second signal skips the teardown
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        error!("Second interrupt received, exiting immediately");
        std::process::exit(130);
    });

    Ok(token)
}
