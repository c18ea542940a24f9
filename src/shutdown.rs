use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. Workers should be stopped gracefully once it fires.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| CronError::Internal(format!("failed to install SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| CronError::Internal(format!("failed to install SIGINT handler: {}", e)))?;

    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping worker");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping worker");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
