//! Common test utilities for mediafetch integration tests

#[allow(dead_code)]
pub mod assertions;
#[allow(dead_code)]
pub mod engine;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use engine::*;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use mediafetch::{Config, MediaFetcher};

/// Config tuned for fast tests: short ticks, snapshot inside `temp_dir`
#[allow(dead_code)]
pub fn test_config(temp_dir: &TempDir, fetch_workers: usize) -> Config {
    let mut config = Config::default();
    config.workers.fetch_workers = fetch_workers;
    config.workers.shutdown_timeout = Duration::from_secs(5);
    config.events.tick_interval = Duration::from_millis(10);
    config.scheduler.poll_interval = Duration::from_millis(25);
    config.persistence.snapshot_path = Some(temp_dir.path().join("pending.json"));
    config.download.download_dir = temp_dir.path().join("downloads");
    config
}

/// Create a fetcher backed by `engine`; the temp dir must be kept alive
#[allow(dead_code)]
pub async fn create_test_fetcher(
    engine: Arc<ScriptedEngine>,
    fetch_workers: usize,
) -> (MediaFetcher, TempDir) {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = test_config(&temp_dir, fetch_workers);
    let fetcher = MediaFetcher::new(config, engine)
        .await
        .expect("failed to create fetcher");
    (fetcher, temp_dir)
}
