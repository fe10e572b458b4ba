use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::orchestrator::Orchestrator;

/// Periodically purge old terminal jobs and their cache entries.
///
/// Runs `purge_older_than(config.purge_after)` every `interval` until the
/// shutdown token fires. Errors are logged and the loop keeps going; a
/// failed sweep only means the next one has more to do.
pub fn spawn_maintenance(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would sweep on startup; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let max_age = orchestrator.config().purge_after;
                    match orchestrator.purge_older_than(max_age).await {
                        Ok(purged) => {
                            tracing::debug!(purged, "Maintenance sweep finished");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Maintenance sweep failed");
                        }
                    }
                }
            }
        }

        tracing::info!("Maintenance loop stopped");
    });
}
