//! # mediafetch
//!
//! Download-orchestration core for media-fetching tools.
//!
//! ## Design Philosophy
//!
//! mediafetch is designed to be:
//! - **Bounded** - a fixed number of fetches run at once, the rest wait in FIFO order
//! - **Cancellable** - every running fetch can be stopped cooperatively
//! - **Consumer-safe** - background work never touches consumer state; events are
//!   queued and delivered on the consumer's tick
//! - **Engine-agnostic** - content retrieval is delegated to a [`FetchEngine`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use mediafetch::{Config, EventType, FetchEngine, MediaFetcher};
//! use std::sync::Arc;
//!
//! # async fn example(engine: Arc<dyn FetchEngine>) -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = MediaFetcher::new(Config::default(), engine).await?;
//!
//! fetcher.subscribe(EventType::Complete, |event| {
//!     println!("finished: {:?}", event.get("title"));
//!     Ok(())
//! });
//!
//! fetcher.start();
//! fetcher.submit("https://example.com/watch?v=1")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Fetch engine boundary
pub mod engine;
/// Error types
pub mod error;
/// Event relay between workers and the consumer
pub mod events;
/// Composition root
pub mod fetcher;
/// Deferred callbacks bound to a consumer's lifetime
pub mod guard;
/// Task scheduling and cancellation
pub mod orchestrator;
/// Worker pools per workload class
pub mod pool;
/// Task store and recovery snapshots
pub mod registry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigUpdate};
pub use engine::{FetchEngine, ProgressCallback, ProgressSignal};
pub use error::{Error, FailureKind, FetchError, Result};
pub use events::{EventRelay, HandlerResult, SubscriptionId};
pub use fetcher::MediaFetcher;
pub use guard::{CallbackGuard, CallbackId};
pub use orchestrator::Orchestrator;
pub use pool::{PoolState, WorkerPool, WorkerPoolManager};
pub use registry::TaskRegistry;
pub use types::{
    Event, EventType, Metadata, ProgressUpdate, QueueStats, Status, Task, TaskId, WorkloadClass,
};

/// Helper function to run the fetcher with graceful signal handling.
///
/// Waits for a termination signal and then calls the fetcher's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use mediafetch::{Config, FetchEngine, MediaFetcher, run_with_shutdown};
/// use std::sync::Arc;
///
/// # async fn example(engine: Arc<dyn FetchEngine>) -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = MediaFetcher::new(Config::default(), engine).await?;
/// fetcher.start();
///
/// // Run with automatic signal handling
/// run_with_shutdown(fetcher).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_with_shutdown(fetcher: MediaFetcher) -> Result<()> {
    wait_for_signal().await;
    fetcher.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
