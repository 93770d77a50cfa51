//! In-memory task store with admission control.
//!
//! Every task lives in one map guarded by a single mutex, so admission
//! (check-then-insert) and status updates are atomic per call and serialized
//! per id. Registry-change notifications are published after the lock is
//! released.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::events::EventRelay;
use crate::types::{Event, QueueStats, Status, Task, TaskId, clamp_progress};

mod snapshot;

pub use snapshot::load_pending;


#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// Ids in creation order
    order: Vec<TaskId>,
    /// DOWNLOADING tasks to delete once their fetch ends
    removing: HashSet<TaskId>,
}

impl Inner {
    fn active_holder(&self, source_ref: &str) -> Option<TaskId> {
        self.order.iter().copied().find(|id| {
            self.tasks
                .get(id)
                .is_some_and(|t| t.status.is_active() && t.source_ref == source_ref)
        })
    }

    fn delete(&mut self, id: TaskId) -> bool {
        self.removing.remove(&id);
        let removed = self.tasks.remove(&id).is_some();
        if removed {
            self.order.retain(|other| *other != id);
        }
        removed
    }

    fn ordered(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }
}

/// Thread-safe store of every known [`Task`]
pub struct TaskRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicI64,
    relay: Option<Arc<EventRelay>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("len", &self.len())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TaskRegistry {
    /// Create an empty registry; with a relay, changes publish REGISTRY_CHANGED
    pub fn new(relay: Option<Arc<EventRelay>>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicI64::new(1),
            relay,
        }
    }

    /// Admit a new QUEUED task
    ///
    /// Fails with [`Error::InvalidSource`] for a blank source reference and with
    /// [`Error::Duplicate`] while another task with the same source is queued
    /// or downloading.
    pub fn submit(
        &self,
        source_ref: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Result<Task> {
        let source_ref = source_ref.into().trim().to_string();
        if source_ref.is_empty() {
            return Err(Error::InvalidSource(source_ref));
        }

        let task = {
            let mut inner = self.lock();
            if let Some(existing) = inner.active_holder(&source_ref) {
                tracing::warn!(
                    source_ref = %source_ref,
                    existing = %existing,
                    "Rejected duplicate submission"
                );
                return Err(Error::Duplicate {
                    source_ref,
                    existing,
                });
            }

            let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
            let task = Task::new(id, source_ref, destination);
            inner.tasks.insert(id, task.clone());
            inner.order.push(id);
            task
        };

        tracing::info!(task_id = %task.id, source_ref = %task.source_ref, "Task admitted");
        self.notify("submit", Some(task.id));
        Ok(task)
    }

    /// Move a task to `status`, optionally setting progress and error message
    ///
    /// Returns `false` if the id is unknown or the state machine forbids the
    /// transition. Progress is clamped into `[0, 100]`.
    pub fn update_status(
        &self,
        id: TaskId,
        status: Status,
        progress: Option<f32>,
        error_message: Option<String>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return false;
        };
        if !task.status.can_transition_to(status) {
            tracing::debug!(
                task_id = %id,
                from = %task.status,
                to = %status,
                "Rejected illegal status transition"
            );
            return false;
        }

        task.status = status;
        if let Some(progress) = progress {
            task.progress = clamp_progress(progress);
        }
        if let Some(message) = error_message {
            task.error_message = Some(message);
        }
        if status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        true
    }

    /// Atomically move a QUEUED task to DOWNLOADING
    pub fn claim(&self, id: TaskId) -> bool {
        self.transition_if(id, Status::Queued, Status::Downloading)
    }

    /// Undo a [`TaskRegistry::claim`] whose job never started
    pub(crate) fn unclaim(&self, id: TaskId) -> bool {
        self.transition_if(id, Status::Downloading, Status::Queued)
    }

    /// Put a DOWNLOADING task whose fetch was interrupted back in the queue
    ///
    /// Progress restarts from zero, the same as a task restored from a snapshot.
    pub(crate) fn interrupt(&self, id: TaskId) -> bool {
        let interrupted = {
            let mut inner = self.lock();
            match inner.tasks.get_mut(&id) {
                Some(task) if task.status == Status::Downloading => {
                    task.status = Status::Queued;
                    task.progress = 0.0;
                    true
                }
                _ => false,
            }
        };

        if interrupted {
            self.notify("interrupt", Some(id));
        }
        interrupted
    }

    /// Atomically move a QUEUED task to STOPPED, returning the stopped task
    pub fn stop_if_queued(&self, id: TaskId) -> Option<Task> {
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(&id)?;
        if task.status != Status::Queued {
            return None;
        }
        task.status = Status::Stopped;
        task.completed_at = Some(Utc::now());
        Some(task.clone())
    }

    /// Start a fresh QUEUED lifecycle for a STOPPED or FAILED task
    pub fn requeue(&self, id: TaskId) -> Result<Task> {
        let task = {
            let mut inner = self.lock();
            let (status, source_ref) = match inner.tasks.get(&id) {
                Some(task) => (task.status, task.source_ref.clone()),
                None => return Err(Error::NotFound(id)),
            };
            if !matches!(status, Status::Stopped | Status::Failed) {
                return Err(Error::InvalidState {
                    id,
                    operation: "retry".to_string(),
                    current_state: status.to_string(),
                });
            }
            if let Some(existing) = inner.active_holder(&source_ref) {
                return Err(Error::Duplicate {
                    source_ref,
                    existing,
                });
            }

            let task = inner.tasks.get_mut(&id).ok_or(Error::NotFound(id))?;
            task.reset_lifecycle();
            task.clone()
        };

        tracing::info!(task_id = %id, "Task re-queued");
        self.notify("retry", Some(id));
        Ok(task)
    }

    /// Record the title reported by the fetch engine
    pub fn set_title(&self, id: TaskId, title: Option<String>) -> bool {
        self.modify(id, |task| task.title = title)
    }

    /// Merge engine metadata into the task's domain metadata
    ///
    /// Keys named like a snapshot record field (`id`, `title`, ...) are stored
    /// with an `extra_` prefix.
    pub fn merge_metadata(
        &self,
        id: TaskId,
        metadata: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> bool {
        self.modify(id, |task| task.merge_metadata(metadata))
    }

    /// Record where the fetched file ended up
    pub fn set_output_path(&self, id: TaskId, path: PathBuf) -> bool {
        self.modify(id, |task| task.output_path = Some(path))
    }

    /// Copy of a single task
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    /// Current status of a task
    pub fn status(&self, id: TaskId) -> Option<Status> {
        self.lock().tasks.get(&id).map(|t| t.status)
    }

    /// Copy of every task, in creation order
    pub fn list(&self) -> Vec<Task> {
        self.lock().ordered().cloned().collect()
    }

    /// Copy of every task in `status`, in creation order
    pub fn list_by_status(&self, status: Status) -> Vec<Task> {
        self.lock()
            .ordered()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Ids of QUEUED tasks, oldest first
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.lock()
            .ordered()
            .filter(|t| t.status == Status::Queued)
            .map(|t| t.id)
            .collect()
    }

    /// Delete a task; `false` if unknown
    pub fn remove(&self, id: TaskId) -> bool {
        let removed = {
            let mut inner = self.lock();
            inner.delete(id)
        };

        if removed {
            self.notify("remove", Some(id));
        }
        removed
    }

    /// Delete a task, or mark it for deletion while its fetch is still running
    ///
    /// A DOWNLOADING task stays in the registry, and keeps its source reference
    /// reserved, until [`TaskRegistry::finish_removal`] runs for it. Returns
    /// `false` if the id is unknown.
    pub fn remove_after_fetch(&self, id: TaskId) -> bool {
        let removed = {
            let mut inner = self.lock();
            match inner.tasks.get(&id).map(|t| t.status) {
                None => return false,
                Some(Status::Downloading) => {
                    inner.removing.insert(id);
                    false
                }
                Some(_) => inner.delete(id),
            }
        };

        if removed {
            self.notify("remove", Some(id));
        } else {
            tracing::debug!(task_id = %id, "Removal deferred until the fetch ends");
        }
        true
    }

    /// Delete every task, deferring DOWNLOADING ones like [`TaskRegistry::remove_after_fetch`]
    pub fn clear_after_fetch(&self) {
        let (cleared, deferred) = {
            let mut inner = self.lock();
            let running: Vec<TaskId> = inner
                .ordered()
                .filter(|t| t.status == Status::Downloading)
                .map(|t| t.id)
                .collect();
            let count = inner.order.len() - running.len();
            inner.tasks.retain(|id, _| running.contains(id));
            inner.order.retain(|id| running.contains(id));
            inner.removing = running.iter().copied().collect();
            (count, running.len())
        };

        tracing::debug!(cleared, deferred, "Registry cleared");
        self.notify("clear", None);
    }

    /// Complete a deferred removal once the task's fetch has ended
    pub(crate) fn finish_removal(&self, id: TaskId) -> bool {
        let removed = {
            let mut inner = self.lock();
            inner.removing.contains(&id) && inner.delete(id)
        };

        if removed {
            self.notify("remove", Some(id));
        }
        removed
    }

    /// Delete every task
    pub fn clear(&self) {
        let cleared = {
            let mut inner = self.lock();
            let count = inner.order.len();
            inner.tasks.clear();
            inner.order.clear();
            inner.removing.clear();
            count
        };

        tracing::debug!(cleared, "Registry cleared");
        self.notify("clear", None);
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    /// Whether the registry holds no task
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Task counts per status
    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        for task in inner.tasks.values() {
            match task.status {
                Status::Queued => stats.queued += 1,
                Status::Downloading => stats.downloading += 1,
                Status::Completed => stats.completed += 1,
                Status::Failed => stats.failed += 1,
                Status::Stopped => stats.stopped += 1,
            }
        }
        stats
    }

    /// Insert previously snapshotted tasks
    ///
    /// Records whose source reference is already active are skipped. Ids of zero
    /// or ids already in use are replaced with fresh ones. Returns the number of
    /// tasks restored.
    pub fn restore(&self, tasks: Vec<Task>) -> usize {
        let restored = {
            let mut inner = self.lock();
            let mut restored = 0;
            for mut task in tasks {
                if task.status.is_active()
                    && let Some(existing) = inner.active_holder(&task.source_ref)
                {
                    tracing::warn!(
                        source_ref = %task.source_ref,
                        existing = %existing,
                        "Skipping restored task with an active duplicate"
                    );
                    continue;
                }

                if task.id.0 <= 0 || inner.tasks.contains_key(&task.id) {
                    task.id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
                } else {
                    self.next_id.fetch_max(task.id.0 + 1, Ordering::SeqCst);
                }
                task.progress = clamp_progress(task.progress);

                inner.order.push(task.id);
                inner.tasks.insert(task.id, task);
                restored += 1;
            }
            restored
        };

        if restored > 0 {
            tracing::info!(restored, "Restored pending tasks");
            self.notify("restore", None);
        }
        restored
    }

    /// Clones of tasks that belong in the recovery snapshot
    pub(crate) fn pending(&self) -> Vec<Task> {
        let inner = self.lock();
        inner
            .ordered()
            .filter(|t| t.status.is_pending() && !inner.removing.contains(&t.id))
            .map(Task::to_record)
            .collect()
    }

    fn transition_if(&self, id: TaskId, from: Status, to: Status) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == from => {
                task.status = to;
                true
            }
            _ => false,
        }
    }

    fn modify(&self, id: TaskId, f: impl FnOnce(&mut Task)) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    fn notify(&self, reason: &str, id: Option<TaskId>) {
        if let Some(relay) = &self.relay {
            relay.publish(Event::registry_changed(reason, id));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
