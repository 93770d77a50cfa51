//! Composition root wiring the core together.
//!
//! The `MediaFetcher` struct and its methods are organized by concern:
//! - this module - construction and the control surface
//! - [`config_ops`] - runtime configuration updates
//! - [`services`] - background loops (scheduler, event tick, autosave)
//! - [`lifecycle`] - snapshots and shutdown coordination

mod config_ops;
mod lifecycle;
mod services;


use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::FetchEngine;
use crate::error::{Error, Result};
use crate::events::{EventRelay, HandlerResult, SubscriptionId};
use crate::guard::CallbackGuard;
use crate::orchestrator::Orchestrator;
use crate::pool::WorkerPoolManager;
use crate::registry::{TaskRegistry, load_pending};
use crate::types::{Event, EventType, QueueStats, Status, Task, TaskId};

/// Settings that can change while running
pub(crate) struct RuntimeSettings {
    pub(crate) download_dir: RwLock<PathBuf>,
}

/// Background loops owned by the fetcher
#[derive(Default)]
pub(crate) struct Services {
    pub(crate) cancel: CancellationToken,
    pub(crate) handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

/// Download-orchestration core (cloneable - all fields are Arc-wrapped)
///
/// Owns the event relay, the worker pools, the task registry and the
/// orchestrator. Every method is callable from any thread.
#[derive(Clone)]
pub struct MediaFetcher {
    pub(crate) config: Arc<Config>,
    pub(crate) settings: Arc<RuntimeSettings>,
    pub(crate) relay: Arc<EventRelay>,
    pub(crate) pools: Arc<WorkerPoolManager>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) services: Arc<Services>,
    pub(crate) runtime: Handle,
}

impl std::fmt::Debug for MediaFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFetcher")
            .field("registry", &self.registry)
            .field("orchestrator", &self.orchestrator)
            .field("relay", &self.relay)
            .finish_non_exhaustive()
    }
}

impl MediaFetcher {
    /// Create a new MediaFetcher
    ///
    /// Validates the configuration, builds every component and restores the
    /// pending tasks of the last snapshot (best effort). Nothing runs until
    /// [`MediaFetcher::start`] is called. Must be called inside a tokio runtime.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use mediafetch::{Config, FetchEngine, MediaFetcher};
    /// # use std::sync::Arc;
    /// # async fn example(engine: Arc<dyn FetchEngine>) -> mediafetch::Result<()> {
    /// let fetcher = MediaFetcher::new(Config::default(), engine).await?;
    /// fetcher.start();
    /// let task = fetcher.submit("https://example.com/watch?v=1")?;
    /// println!("queued task {}", task.id);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: Config, engine: Arc<dyn FetchEngine>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::current();

        let relay = Arc::new(EventRelay::new(config.events.queue_capacity));
        let pools = Arc::new(WorkerPoolManager::new(
            config.workers.clone(),
            runtime.clone(),
        ));
        let registry = Arc::new(TaskRegistry::new(Some(Arc::clone(&relay))));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&pools),
            Arc::clone(&relay),
            engine,
            config.scheduler.progress_step,
        )?);

        if let Some(path) = &config.persistence.snapshot_path {
            let restored = registry.restore(load_pending(path).await);
            tracing::info!(path = %path.display(), restored, "Snapshot loaded");
        }

        let settings = Arc::new(RuntimeSettings {
            download_dir: RwLock::new(config.download.download_dir.clone()),
        });

        tracing::info!(
            fetch_workers = config.workers.fetch_workers,
            query_workers = config.workers.query_workers,
            "MediaFetcher initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            settings,
            relay,
            pools,
            registry,
            orchestrator,
            services: Arc::new(Services::default()),
            runtime,
        })
    }

    /// Admit a task into the default download directory
    pub fn submit(&self, source_ref: impl Into<String>) -> Result<Task> {
        let destination = self.download_dir();
        self.submit_to(source_ref, destination)
    }

    /// Admit a task with an explicit destination directory
    ///
    /// Fails with [`Error::Duplicate`] while the same source is queued or
    /// downloading, and with [`Error::ShuttingDown`] once shutdown began.
    pub fn submit_to(
        &self,
        source_ref: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Result<Task> {
        if !self.orchestrator.is_accepting() {
            return Err(Error::ShuttingDown);
        }
        self.registry.submit(source_ref, destination)
    }

    /// Start a QUEUED task now; see [`Orchestrator::start`]
    pub fn start_task(&self, id: TaskId) -> bool {
        self.orchestrator.start(id)
    }

    /// Start QUEUED tasks until the cap is reached
    pub fn start_all(&self) -> usize {
        self.orchestrator.start_all()
    }

    /// Stop a queued or running task
    pub fn cancel(&self, id: TaskId) -> bool {
        self.orchestrator.cancel(id)
    }

    /// Cancel every running fetch
    pub fn cancel_all(&self) -> usize {
        self.orchestrator.cancel_all()
    }

    /// Re-queue a STOPPED or FAILED task
    pub fn retry(&self, id: TaskId) -> Result<Task> {
        self.orchestrator.retry(id)
    }

    /// Number of fetches in flight
    pub fn active_count(&self) -> usize {
        self.orchestrator.active_count()
    }

    /// Copy of a task
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.registry.get(id)
    }

    /// Every task, in creation order
    pub fn list(&self) -> Vec<Task> {
        self.registry.list()
    }

    /// Tasks in one status, in creation order
    pub fn list_by_status(&self, status: Status) -> Vec<Task> {
        self.registry.list_by_status(status)
    }

    /// Delete a task, cancelling its fetch if one is running
    ///
    /// A running task is deleted once its fetch has stopped. Until then its
    /// source reference is still taken and resubmitting it fails with
    /// [`Error::Duplicate`](crate::Error::Duplicate).
    pub fn remove(&self, id: TaskId) -> bool {
        self.orchestrator.cancel(id);
        self.registry.remove_after_fetch(id)
    }

    /// Cancel every fetch and delete every task
    ///
    /// Running tasks are deleted as their fetches stop, as with [`MediaFetcher::remove`].
    pub fn clear(&self) {
        self.orchestrator.cancel_all();
        self.registry.clear_after_fetch();
    }

    /// Task counts per status
    pub fn stats(&self) -> QueueStats {
        self.registry.stats()
    }

    /// Register an event handler; it runs on whichever side drains the relay
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.relay.subscribe(event_type, handler)
    }

    /// Remove an event handler
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.relay.unsubscribe(id)
    }

    /// Deliver one batch of queued events (for consumers that drain themselves)
    pub fn drain_events(&self) -> usize {
        self.relay.drain(self.config.events.max_batch)
    }

    /// Event relay shared by every component
    pub fn relay(&self) -> &Arc<EventRelay> {
        &self.relay
    }

    /// Task registry
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Worker pools
    pub fn pools(&self) -> &Arc<WorkerPoolManager> {
        &self.pools
    }

    /// New guard for the consumer's deferred callbacks
    pub fn callback_guard(&self) -> CallbackGuard {
        CallbackGuard::new(self.runtime.clone())
    }

    /// Static configuration the fetcher was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current default download directory
    pub fn download_dir(&self) -> PathBuf {
        self.settings
            .download_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
