//! Snapshots and shutdown coordination.

use std::sync::PoisonError;

use crate::error::Result;

use super::MediaFetcher;

impl MediaFetcher {
    /// Write the recovery snapshot now
    ///
    /// Returns the number of tasks written, or zero when no snapshot path is
    /// configured.
    pub async fn save_snapshot(&self) -> Result<usize> {
        match &self.config.persistence.snapshot_path {
            Some(path) => self.registry.snapshot_pending(path).await,
            None => Ok(0),
        }
    }

    /// Gracefully shut down the fetcher
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting submissions and starts
    /// 2. Interrupts every running fetch; interrupted tasks go back to QUEUED
    /// 3. Stops the scheduler and the autosave loop
    /// 4. Waits up to `workers.shutdown_timeout` for the pools to drain
    /// 5. Writes a final snapshot
    /// 6. Stops the event relay after delivering what is left
    ///
    /// Every step runs even if an earlier one failed; failures are logged.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new work
        self.orchestrator.stop_accepting();

        // 2. Interrupt every running fetch
        let interrupted = self.orchestrator.interrupt_all();
        tracing::info!(interrupted, "Signaled interruption to running fetches");

        // 3. Stop background loops
        self.orchestrator.stop_scheduler().await;
        self.services.cancel.cancel();
        let handles: Vec<_> = self
            .services
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(service = name, error = %e, "Background task ended abnormally");
            }
        }

        // 4. Drain the pools
        let timeout = self.config.workers.shutdown_timeout;
        if self.pools.shutdown(timeout).await {
            tracing::info!("All fetch jobs finished");
        } else {
            tracing::warn!(
                active = self.orchestrator.active_count(),
                "Timeout waiting for fetch jobs, proceeding with shutdown"
            );
        }

        // 5. Persist pending tasks
        match self.save_snapshot().await {
            Ok(saved) => tracing::info!(saved, "Final snapshot written"),
            Err(e) => tracing::error!(error = %e, "Failed to write final snapshot"),
        }

        // 6. Flush events
        let delivered = self.relay.stop().await;
        tracing::info!(delivered, "Graceful shutdown complete");
        Ok(())
    }
}
