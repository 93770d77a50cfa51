//! Configuration types for mediafetch

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::{Error, Result};
use crate::types::WorkloadClass;

/// Worker pool sizing and shutdown behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workers in the fetch pool; also the cap on simultaneous downloads (default: 3)
    #[serde(default = "default_workers")]
    pub fetch_workers: usize,

    /// Workers in the query pool (default: 3)
    #[serde(default = "default_workers")]
    pub query_workers: usize,

    /// How long shutdown waits for running jobs to drain (default: 10 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    /// Worker count for a workload class
    pub fn workers_for(&self, class: WorkloadClass) -> usize {
        match class {
            WorkloadClass::Fetch => self.fetch_workers,
            WorkloadClass::Query => self.query_workers,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_workers: default_workers(),
            query_workers: default_workers(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Event relay settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventConfig {
    /// Events buffered before publishing starts dropping (default: 1000)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Consumer drain tick (default: 100ms)
    #[serde(default = "default_tick_interval", with = "duration_ms_serde")]
    pub tick_interval: Duration,

    /// Events delivered per tick at most (default: 100)
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Drain on a background tick; when false the consumer drains itself (default: true)
    #[serde(default = "default_true")]
    pub auto_drain: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            tick_interval: default_tick_interval(),
            max_batch: default_max_batch(),
            auto_drain: true,
        }
    }
}

/// Scheduling loop settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between looks at the queue (default: 500ms)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Progress percentage points between PROGRESS events (default: 5)
    #[serde(default = "default_progress_step")]
    pub progress_step: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            progress_step: default_progress_step(),
        }
    }
}

/// Recovery snapshot settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Where pending tasks are snapshotted (None = no snapshots)
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    /// Interval between automatic snapshots (default: 30 seconds)
    #[serde(default = "default_autosave_interval", with = "duration_serde")]
    pub autosave_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            autosave_interval: default_autosave_interval(),
        }
    }
}

/// Download defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Destination used when a submit does not name one (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

/// Main configuration for MediaFetcher
///
/// Fields are organized into sub-configs:
/// - [`workers`](WorkerConfig) - pool sizes and shutdown deadline
/// - [`events`](EventConfig) - relay capacity and drain tick
/// - [`scheduler`](SchedulerConfig) - polling and progress throttling
/// - [`persistence`](PersistenceConfig) - recovery snapshots
/// - [`download`](DownloadConfig) - default destination
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker pools
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Event relay
    #[serde(default)]
    pub events: EventConfig,

    /// Scheduling loop
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Recovery snapshots
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Download defaults
    #[serde(default)]
    pub download: DownloadConfig,
}

impl Config {
    /// Check values that would make the core unusable
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("workers.fetch_workers", self.workers.fetch_workers),
            ("workers.query_workers", self.workers.query_workers),
            ("events.queue_capacity", self.events.queue_capacity),
            ("events.max_batch", self.events.max_batch),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(config_error(key, "must be greater than zero"));
            }
        }

        let intervals = [
            ("events.tick_interval", self.events.tick_interval),
            ("scheduler.poll_interval", self.scheduler.poll_interval),
            ("persistence.autosave_interval", self.persistence.autosave_interval),
        ];
        for (key, value) in intervals {
            if value.is_zero() {
                return Err(config_error(key, "must be a non-zero duration"));
            }
        }

        validate_progress_step(self.scheduler.progress_step)
    }
}

/// Runtime-mutable settings; `None` leaves a setting unchanged
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    /// New progress reporting step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_step: Option<f32>,

    /// New default destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
}

pub(crate) fn validate_progress_step(step: f32) -> Result<()> {
    if step.is_finite() && step > 0.0 && step <= 100.0 {
        Ok(())
    } else {
        Err(config_error(
            "scheduler.progress_step",
            "must be within (0, 100]",
        ))
    }
}

fn config_error(key: &str, message: &str) -> Error {
    Error::Config {
        message: format!("{key} {message}"),
        key: Some(key.to_string()),
    }
}

fn default_workers() -> usize {
    3
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_batch() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_progress_step() -> f32 {
    5.0
}

fn default_autosave_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for sub-second ticks)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
