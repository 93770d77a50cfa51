//! Background service starters: scheduler, event tick and snapshot autosave.

use std::sync::PoisonError;

use super::MediaFetcher;

impl MediaFetcher {
    /// Start the background loops
    ///
    /// Spawns the scheduling loop, the event tick (unless `events.auto_drain` is
    /// off) and, when a snapshot path is configured, the autosave loop. Calling
    /// it again has no effect on loops that are already running.
    pub fn start(&self) {
        let _enter = self.runtime.enter();

        if self
            .orchestrator
            .spawn_scheduler(self.config.scheduler.poll_interval)
        {
            tracing::info!("Scheduler background task started");
        }

        if self.config.events.auto_drain {
            self.relay.spawn_tick_loop(
                self.config.events.tick_interval,
                self.config.events.max_batch,
            );
        } else {
            tracing::info!("Automatic event draining disabled, consumer drains the relay");
        }

        self.start_autosave();
    }

    fn start_autosave(&self) {
        let Some(path) = self.config.persistence.snapshot_path.clone() else {
            tracing::info!("No snapshot path configured, skipping autosave");
            return;
        };

        let mut handles = self
            .services
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handles.iter().any(|(name, _)| *name == "autosave") {
            return;
        }

        let registry = self.registry.clone();
        let cancel = self.services.cancel.clone();
        let interval = self.config.persistence.autosave_interval;

        let handle = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the snapshot was just loaded
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.snapshot_pending(&path).await {
                            tracing::warn!(path = %path.display(), error = %e, "Autosave failed");
                        }
                    }
                }
            }
        });

        handles.push(("autosave", handle));
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Snapshot autosave started"
        );
    }
}
