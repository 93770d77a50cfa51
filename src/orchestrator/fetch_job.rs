//! Fetch job: one task through the engine on a blocking worker.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::engine::{FetchEngine, ProgressSignal};
use crate::error::{FailureKind, FetchError};
use crate::events::{EventRelay, panic_message};
use crate::registry::TaskRegistry;
use crate::types::{Event, ProgressUpdate, Status, Task};

use super::ActiveTokens;

/// Everything a single fetch needs, moved into the pool job
pub(super) struct FetchJob {
    /// Task as it was when claimed
    pub(super) task: Task,
    pub(super) registry: Arc<TaskRegistry>,
    pub(super) relay: Arc<EventRelay>,
    pub(super) engine: Arc<dyn FetchEngine>,
    pub(super) active: ActiveTokens,
    pub(super) slot_freed: Arc<Notify>,
    pub(super) progress_step: Arc<AtomicU32>,
    pub(super) cancel_token: CancellationToken,
    /// Orchestrator-wide shutdown signal
    pub(super) interrupt: CancellationToken,
}

/// How a fetch that was asked to stop should be recorded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopCause {
    User,
    Shutdown,
}

fn stop_cause(
    cancel_token: &CancellationToken,
    interrupt: &CancellationToken,
) -> Option<StopCause> {
    if cancel_token.is_cancelled() {
        Some(StopCause::User)
    } else if interrupt.is_cancelled() {
        Some(StopCause::Shutdown)
    } else {
        None
    }
}

/// Releases the task's slot when the job ends, including by panic
struct SlotGuard {
    task: Task,
    active: ActiveTokens,
    slot_freed: Arc<Notify>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task.id);
        self.slot_freed.notify_one();
        tracing::debug!(task_id = %self.task.id, "Fetch slot released");
    }
}

impl FetchJob {
    /// Run the fetch and publish exactly one terminal event
    ///
    /// A fetch interrupted by shutdown is not terminal: its task goes back to
    /// QUEUED.
    pub(super) async fn run(self) {
        let FetchJob {
            task,
            registry,
            relay,
            engine,
            active,
            slot_freed,
            progress_step,
            cancel_token,
            interrupt,
        } = self;

        let _slot = SlotGuard {
            task: task.clone(),
            active,
            slot_freed,
        };
        let id = task.id;
        tracing::info!(task_id = %id, source_ref = %task.source_ref, "Fetch started");

        let outcome = {
            let registry = Arc::clone(&registry);
            let relay = Arc::clone(&relay);
            let cancel_token = cancel_token.clone();
            let interrupt = interrupt.clone();
            let task = task.clone();
            tokio::task::spawn_blocking(move || {
                let stop_requested = || stop_cause(&cancel_token, &interrupt).is_some();
                execute(&task, &*engine, &registry, &relay, &progress_step, &stop_requested)
            })
            .await
        };

        let cause = stop_cause(&cancel_token, &interrupt);
        let outcome = match outcome {
            // A fetch that errors after being asked to stop counts as stopped
            Ok(Err(e)) if cause.is_some() && !e.is_stop() => {
                tracing::debug!(task_id = %id, error = %e, "Fetch errored after cancellation");
                Ok(Err(FetchError::Stopped))
            }
            other => other,
        };

        finish(&task, outcome, cause, &registry, &relay);
        registry.finish_removal(id);
    }
}

/// Blocking part: extract, then fetch with a cancellation-aware progress callback
fn execute(
    task: &Task,
    engine: &dyn FetchEngine,
    registry: &TaskRegistry,
    relay: &EventRelay,
    progress_step: &AtomicU32,
    stop_requested: &(dyn Fn() -> bool + Sync),
) -> Result<PathBuf, FetchError> {
    let id = task.id;
    if stop_requested() {
        return Err(FetchError::Stopped);
    }

    let metadata = engine.extract(&task.source_ref)?;
    registry.set_title(id, metadata.title.clone());
    if !metadata.extra.is_empty() {
        registry.merge_metadata(id, metadata.extra.clone());
    }

    if stop_requested() {
        return Err(FetchError::Stopped);
    }

    let mut last_bucket: i64 = 0;
    let mut on_progress = |update: &ProgressUpdate| {
        if stop_requested() {
            return ProgressSignal::Stop;
        }
        if let Some(percent) = update.percent() {
            registry.update_status(id, Status::Downloading, Some(percent), None);

            let step = f32::from_bits(progress_step.load(Ordering::Relaxed));
            let bucket = (percent / step).floor() as i64;
            if bucket > last_bucket {
                last_bucket = bucket;
                relay.publish(Event::progress(id, percent));
            }
        }
        ProgressSignal::Continue
    };

    engine.fetch(&metadata, &task.destination, &mut on_progress)
}

fn finish(
    claimed: &Task,
    outcome: Result<Result<PathBuf, FetchError>, JoinError>,
    cause: Option<StopCause>,
    registry: &TaskRegistry,
    relay: &EventRelay,
) {
    let id = claimed.id;
    let current = || registry.get(id).unwrap_or_else(|| claimed.clone());

    match outcome {
        Ok(Ok(path)) => {
            registry.set_output_path(id, path.clone());
            registry.update_status(id, Status::Completed, Some(100.0), None);
            tracing::info!(task_id = %id, path = %path.display(), "Fetch completed");
            relay.publish(Event::complete(&current(), &path));
        }
        Ok(Err(FetchError::Stopped)) if cause == Some(StopCause::Shutdown) => {
            registry.interrupt(id);
            tracing::info!(task_id = %id, "Fetch interrupted by shutdown, task re-queued");
        }
        Ok(Err(FetchError::Stopped)) => {
            registry.update_status(id, Status::Stopped, None, None);
            tracing::info!(task_id = %id, "Fetch stopped");
            relay.publish(Event::stopped(&current(), true));
        }
        Ok(Err(e)) => {
            let kind = e.kind();
            let message = e.user_message();
            registry.update_status(id, Status::Failed, None, Some(message.clone()));
            tracing::error!(task_id = %id, kind = %kind, error = %e, "Fetch failed");
            relay.publish(Event::failed(&current(), kind, &message));
        }
        Err(join_error) => {
            let message = if join_error.is_panic() {
                let panic = join_error.into_panic();
                format!("fetch engine panicked: {}", panic_message(panic.as_ref()))
            } else {
                "fetch worker was cancelled".to_string()
            };
            let message = format!("{}: {message}", FailureKind::Generic.user_hint());
            registry.update_status(id, Status::Failed, None, Some(message.clone()));
            tracing::error!(task_id = %id, error = %message, "Fetch worker died");
            relay.publish(Event::failed(&current(), FailureKind::Generic, &message));
        }
    }
}
