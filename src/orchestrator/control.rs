//! Start, cancel and retry.

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{Event, Status, Task, TaskId, WorkloadClass};

use super::Orchestrator;
use super::fetch_job::FetchJob;

impl Orchestrator {
    /// Start fetching a QUEUED task
    ///
    /// Returns `false` if the task is unknown or not QUEUED, already has a
    /// token, the cap is reached, or the orchestrator stopped accepting work.
    /// Registering the token is atomic, so concurrent calls for one id start at
    /// most one fetch.
    pub fn start(&self, id: TaskId) -> bool {
        if !self.is_accepting() {
            return false;
        }
        let Some(task) = self.registry.get(id) else {
            return false;
        };
        if task.status != Status::Queued {
            return false;
        }

        let token = CancellationToken::new();
        {
            let mut active = self.lock_active();
            if active.contains_key(&id) || active.len() >= self.capacity {
                return false;
            }
            active.insert(id, token.clone());
        }

        if !self.registry.claim(id) {
            // Cancelled or removed between the status check and the claim
            self.lock_active().remove(&id);
            return false;
        }

        let job = FetchJob {
            task,
            registry: self.registry.clone(),
            relay: self.relay.clone(),
            engine: self.engine.clone(),
            active: self.active.clone(),
            slot_freed: self.slot_freed.clone(),
            progress_step: self.progress_step.clone(),
            cancel_token: token,
            interrupt: self.interrupt.clone(),
        };

        let submitted = self
            .pools
            .pool(WorkloadClass::Fetch)
            .and_then(|pool| pool.submit(job.run()));
        match submitted {
            Ok(_) => {
                tracing::debug!(task_id = %id, "Fetch job submitted");
                true
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Could not submit fetch job");
                self.registry.unclaim(id);
                self.lock_active().remove(&id);
                false
            }
        }
    }

    /// Start QUEUED tasks oldest first until the cap is reached
    ///
    /// Returns the number of fetches started; tasks that cannot start stay QUEUED.
    pub fn start_all(&self) -> usize {
        let mut started = 0;
        for id in self.registry.queued_ids() {
            if !self.is_accepting() || self.active_count() >= self.capacity {
                break;
            }
            if self.start(id) {
                started += 1;
            } else {
                tracing::debug!(task_id = %id, "Task not started");
            }
        }
        started
    }

    /// Stop a task
    ///
    /// A running fetch has its token cancelled and ends as STOPPED once the
    /// engine next reports progress. A QUEUED task becomes STOPPED immediately.
    /// Returns `false` if there was nothing to stop.
    pub fn cancel(&self, id: TaskId) -> bool {
        if self.cancel_token(id) {
            return true;
        }

        if let Some(task) = self.registry.stop_if_queued(id) {
            tracing::info!(task_id = %id, "Queued task stopped");
            self.relay.publish(Event::stopped(&task, false));
            return true;
        }

        // The task may have been claimed between the two checks
        self.cancel_token(id)
    }

    /// Cancel every running fetch; returns how many tokens were flipped
    pub fn cancel_all(&self) -> usize {
        let active = self.lock_active();
        for (id, token) in active.iter() {
            tracing::debug!(task_id = %id, "Cancelling fetch");
            token.cancel();
        }
        active.len()
    }

    /// Put a STOPPED or FAILED task back in the queue with a fresh lifecycle
    pub fn retry(&self, id: TaskId) -> Result<Task> {
        let task = self.registry.requeue(id)?;
        self.slot_freed.notify_one();
        Ok(task)
    }

    fn cancel_token(&self, id: TaskId) -> bool {
        match self.lock_active().get(&id) {
            Some(token) => {
                tracing::info!(task_id = %id, "Cancelling running fetch");
                token.cancel();
                true
            }
            None => false,
        }
    }
}
