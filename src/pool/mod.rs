//! Worker pools, one per workload class.
//!
//! A [`WorkerPool`] bounds how many of its jobs run at once with a semaphore and
//! tracks every submitted job so shutdown can wait for them. Jobs beyond the
//! worker count wait inside the pool for a permit. [`WorkerPoolManager`] creates
//! pools lazily and shuts all of them down together.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::task::TaskTracker;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::types::WorkloadClass;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

/// Lifecycle of a created pool (an uncreated pool simply has no instance)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting jobs
    Active,
    /// No new jobs; queued and running jobs drain
    ShuttingDown,
    /// Every job finished after shutdown
    Terminated,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Active,
            1 => PoolState::ShuttingDown,
            _ => PoolState::Terminated,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            PoolState::Active => 0,
            PoolState::ShuttingDown => 1,
            PoolState::Terminated => 2,
        }
    }
}

/// Bounded pool of workers for one workload class
pub struct WorkerPool {
    class: WorkloadClass,
    max_workers: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    runtime: Handle,
    state: AtomicU8,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("class", &self.class)
            .field("max_workers", &self.max_workers)
            .field("running", &self.running())
            .field("state", &self.state())
            .finish()
    }
}

impl WorkerPool {
    fn new(class: WorkloadClass, max_workers: usize, runtime: Handle) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            class,
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            tracker: TaskTracker::new(),
            runtime,
            state: AtomicU8::new(PoolState::Active.to_u8()),
        }
    }

    /// Workload class this pool serves
    pub fn class(&self) -> WorkloadClass {
        self.class
    }

    /// Maximum number of jobs running at once
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Jobs currently holding a worker
    pub fn running(&self) -> usize {
        self.max_workers
            .saturating_sub(self.permits.available_permits())
    }

    /// Jobs submitted and not yet finished (running or waiting for a worker)
    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    /// Submit an async job
    ///
    /// The job starts once a worker is free. Callable from any thread, inside
    /// the runtime or not. Fails if the pool is shutting down.
    pub fn submit<F>(&self, job: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.state() != PoolState::Active {
            return Err(Error::PoolShutDown(self.class));
        }

        let permits = Arc::clone(&self.permits);
        Ok(self.tracker.spawn_on(
            async move {
                // The semaphore is never closed, so acquiring only waits
                let _permit = permits.acquire_owned().await.ok();
                job.await
            },
            &self.runtime,
        ))
    }

    /// Submit a blocking job; it runs on a dedicated blocking thread while holding a worker
    pub fn submit_blocking<F, R>(
        &self,
        job: F,
    ) -> Result<JoinHandle<std::result::Result<R, JoinError>>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(async move { tokio::task::spawn_blocking(job).await })
    }

    /// Stop accepting jobs; already submitted jobs keep running
    fn begin_shutdown(&self) {
        let _ = self.state.compare_exchange(
            PoolState::Active.to_u8(),
            PoolState::ShuttingDown.to_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.tracker.close();
    }

    /// Wait until every submitted job finished (after [`WorkerPool::begin_shutdown`])
    async fn wait_drained(&self) {
        self.tracker.wait().await;
        self.state
            .store(PoolState::Terminated.to_u8(), Ordering::SeqCst);
    }
}

/// Owns one [`WorkerPool`] per workload class
pub struct WorkerPoolManager {
    config: WorkerConfig,
    runtime: Handle,
    pools: RwLock<HashMap<WorkloadClass, Arc<WorkerPool>>>,
    shutdown_started: AtomicBool,
    terminated: AtomicBool,
}

impl std::fmt::Debug for WorkerPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolManager")
            .field("config", &self.config)
            .field("shutdown_started", &self.shutdown_started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WorkerPoolManager {
    /// Create a manager whose pools run on `runtime`; no pool exists until first requested
    pub fn new(config: WorkerConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            pools: RwLock::new(HashMap::new()),
            shutdown_started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Pool for a workload class, created on first access
    ///
    /// Returns the same instance on every call. After shutdown has begun, pools
    /// that were never created cannot be created anymore.
    pub fn pool(&self, class: WorkloadClass) -> Result<Arc<WorkerPool>> {
        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&class)
        {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(&class) {
            return Ok(Arc::clone(pool));
        }
        if self.shutdown_started.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let workers = self.config.workers_for(class);
        tracing::debug!(class = %class, workers, "Creating worker pool");
        let pool = Arc::new(WorkerPool::new(class, workers, self.runtime.clone()));
        pools.insert(class, Arc::clone(&pool));
        Ok(pool)
    }

    /// Worker count a class's pool has (or will have once created)
    pub fn capacity(&self, class: WorkloadClass) -> usize {
        self.config.workers_for(class).max(1)
    }

    /// Pools created so far
    pub fn created_pools(&self) -> Vec<Arc<WorkerPool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Shut down every created pool and wait up to `timeout` for jobs to drain
    ///
    /// Returns whether everything drained in time. Once a shutdown has fully
    /// drained, later calls return `true` immediately.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return true;
        }

        self.shutdown_started.store(true, Ordering::SeqCst);
        let pools = self.created_pools();
        for pool in &pools {
            pool.begin_shutdown();
        }

        tracing::info!(
            pools = pools.len(),
            outstanding = pools.iter().map(|p| p.outstanding()).sum::<usize>(),
            timeout_ms = timeout.as_millis() as u64,
            "Shutting down worker pools"
        );

        let drain = futures::future::join_all(pools.iter().map(|p| p.wait_drained()));
        match tokio::time::timeout(timeout, drain).await {
            Ok(_) => {
                self.terminated.store(true, Ordering::SeqCst);
                tracing::info!("All worker pools drained");
                true
            }
            Err(_) => {
                for pool in pools.iter().filter(|p| p.outstanding() > 0) {
                    tracing::warn!(
                        class = %pool.class(),
                        outstanding = pool.outstanding(),
                        "Worker pool did not drain before the deadline"
                    );
                }
                false
            }
        }
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }
}
