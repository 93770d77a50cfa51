//! Runtime configuration updates.

use std::sync::PoisonError;

use crate::config::{ConfigUpdate, validate_progress_step};
use crate::error::Result;
use crate::types::Event;

use super::MediaFetcher;

impl MediaFetcher {
    /// Apply runtime-changeable settings
    ///
    /// Every setting is validated before any is applied. Each changed setting
    /// publishes a CONFIG_CHANGED event.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        if let Some(step) = update.progress_step {
            validate_progress_step(step)?;
        }

        if let Some(step) = update.progress_step {
            self.orchestrator.set_progress_step(step)?;
            tracing::info!(progress_step = step, "Progress step changed");
            self.relay.publish(Event::config_changed(
                "scheduler.progress_step",
                f64::from(step),
            ));
        }

        if let Some(dir) = update.download_dir {
            let shown = dir.display().to_string();
            *self
                .settings
                .download_dir
                .write()
                .unwrap_or_else(PoisonError::into_inner) = dir;
            tracing::info!(download_dir = %shown, "Download directory changed");
            self.relay
                .publish(Event::config_changed("download.download_dir", shown));
        }

        Ok(())
    }

    /// Current progress reporting step
    pub fn progress_step(&self) -> f32 {
        self.orchestrator.progress_step()
    }
}
