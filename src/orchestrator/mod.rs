//! Scheduling of queued tasks onto the fetch pool.
//!
//! The orchestrator is split into focused submodules:
//! - [`control`] - start, cancel and retry operations
//! - [`scheduler`] - background loop promoting queued tasks
//! - [`fetch_job`] - execution of a single fetch on a blocking worker
//!
//! Every in-flight task owns one [`CancellationToken`] in the active map. The
//! map never holds more tokens than the fetch pool has workers, which is what
//! bounds the number of DOWNLOADING tasks.

mod control;
mod fetch_job;
mod scheduler;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::validate_progress_step;
use crate::engine::FetchEngine;
use crate::error::Result;
use crate::events::EventRelay;
use crate::pool::WorkerPoolManager;
use crate::registry::TaskRegistry;
use crate::types::{TaskId, WorkloadClass};

pub(crate) type ActiveTokens = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

/// Runs queued tasks through the fetch engine under a concurrency cap
pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    pools: Arc<WorkerPoolManager>,
    relay: Arc<EventRelay>,
    engine: Arc<dyn FetchEngine>,
    active: ActiveTokens,
    capacity: usize,
    /// Woken whenever a job releases its slot
    slot_freed: Arc<Notify>,
    accepting: AtomicBool,
    /// Cancelled by shutdown; fetches it stops go back to QUEUED
    interrupt: CancellationToken,
    /// Progress step as `f32` bits
    progress_step: Arc<AtomicU32>,
    scheduler: Mutex<Option<scheduler::SchedulerHandle>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("capacity", &self.capacity)
            .field("active", &self.active_count())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator; the cap equals the fetch pool's worker count
    pub fn new(
        registry: Arc<TaskRegistry>,
        pools: Arc<WorkerPoolManager>,
        relay: Arc<EventRelay>,
        engine: Arc<dyn FetchEngine>,
        progress_step: f32,
    ) -> Result<Self> {
        validate_progress_step(progress_step)?;
        let capacity = pools.capacity(WorkloadClass::Fetch);

        Ok(Self {
            registry,
            pools,
            relay,
            engine,
            active: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            slot_freed: Arc::new(Notify::new()),
            accepting: AtomicBool::new(true),
            interrupt: CancellationToken::new(),
            progress_step: Arc::new(AtomicU32::new(progress_step.to_bits())),
            scheduler: Mutex::new(None),
        })
    }

    /// Maximum number of simultaneously running fetches
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks currently holding a cancellation token
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    /// Whether a fetch for `id` is in flight
    pub fn is_active(&self, id: TaskId) -> bool {
        self.lock_active().contains_key(&id)
    }

    /// Whether new starts are accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuse every later start; running fetches are unaffected
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Stop every running fetch without marking it STOPPED
    ///
    /// Interrupted tasks return to QUEUED with zero progress, so a snapshot
    /// taken afterwards resumes them on the next start. A fetch the user
    /// already cancelled still ends STOPPED. Later starts are refused. Returns
    /// the number of fetches in flight.
    pub fn interrupt_all(&self) -> usize {
        self.stop_accepting();
        self.interrupt.cancel();
        self.active_count()
    }

    /// Percentage points between PROGRESS events
    pub fn progress_step(&self) -> f32 {
        f32::from_bits(self.progress_step.load(Ordering::SeqCst))
    }

    /// Change the progress step; running fetches pick it up on their next report
    pub fn set_progress_step(&self, step: f32) -> Result<()> {
        validate_progress_step(step)?;
        self.progress_step.store(step.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
