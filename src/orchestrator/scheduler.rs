//! Background loop promoting QUEUED tasks into free slots.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Orchestrator;

pub(super) struct SchedulerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Orchestrator {
    /// Spawn the scheduling loop on the current runtime
    ///
    /// The loop calls [`Orchestrator::start_all`] every `poll_interval` and as
    /// soon as a running fetch frees its slot. A zero interval is raised to one
    /// millisecond. Returns `false` if a loop is already running.
    pub fn spawn_scheduler(self: &Arc<Self>, poll_interval: Duration) -> bool {
        let mut slot = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let orchestrator = Arc::clone(self);
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let shutdown = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                poll_interval_ms = poll_interval.as_millis() as u64,
                capacity = orchestrator.capacity(),
                "Scheduler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = orchestrator.slot_freed.notified() => {}
                }

                if !orchestrator.is_accepting() {
                    break;
                }

                let started = orchestrator.start_all();
                if started > 0 {
                    tracing::debug!(started, "Scheduler promoted queued tasks");
                }
            }

            tracing::info!("Scheduler stopped");
        });

        *slot = Some(SchedulerHandle { cancel, handle });
        true
    }

    /// Stop the scheduling loop and wait for it to exit
    pub async fn stop_scheduler(&self) {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(SchedulerHandle { cancel, handle }) = scheduler {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler task ended abnormally");
            }
        }
    }

    /// Whether the scheduling loop is running
    pub fn scheduler_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }
}
