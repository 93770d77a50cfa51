//! Core types for mediafetch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::FailureKind;

/// Unique identifier for a task
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for i64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Task status
///
/// ```text
/// Queued --schedule--> Downloading --success--> Completed
///   |                      |--cancel--> Stopped
///   |                      `--error---> Failed
///   `--user stop--> Stopped
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Admitted and waiting for a worker slot
    #[default]
    Queued,
    /// A fetch job is running for this task
    Downloading,
    /// Fetched successfully
    Completed,
    /// The fetch engine reported an error
    Failed,
    /// Stopped by the user, either before or during the fetch
    Stopped,
}

impl Status {
    /// All statuses, in lifecycle order
    pub const ALL: [Status; 5] = [
        Status::Queued,
        Status::Downloading,
        Status::Completed,
        Status::Failed,
        Status::Stopped,
    ];

    /// Whether the task holds its source reference (admission is blocked for duplicates)
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Queued | Status::Downloading)
    }

    /// Whether the lifecycle has ended
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether a task in this status belongs in the recovery snapshot
    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Queued | Status::Downloading | Status::Stopped)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in `Downloading` is allowed so progress can be updated. Leaving a
    /// terminal state is only possible through a re-queue, which is not a transition.
    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Queued, Status::Downloading)
                | (Status::Queued, Status::Stopped)
                | (Status::Queued, Status::Queued)
                | (Status::Downloading, Status::Downloading)
                | (Status::Downloading, Status::Completed)
                | (Status::Downloading, Status::Failed)
                | (Status::Downloading, Status::Stopped)
        )
    }

    /// Lowercase name as used in snapshots and event payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Downloading => "downloading",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single fetch request and its lifecycle
///
/// Serialized as one record of the recovery snapshot. Missing fields take their
/// defaults and unknown fields are kept in [`Task::metadata`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task identifier
    #[serde(default)]
    pub id: TaskId,
    /// What to fetch (usually a URL)
    #[serde(default)]
    pub source_ref: String,
    /// Title reported by the fetch engine, if extracted yet
    #[serde(default)]
    pub title: Option<String>,
    /// Destination directory
    #[serde(default, rename = "destinationDir")]
    pub destination: PathBuf,
    /// Current status
    #[serde(default)]
    pub status: Status,
    /// Progress percentage (0.0 to 100.0)
    #[serde(default)]
    pub progress: f32,
    /// When the task was submitted
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When the task reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Path of the fetched file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Domain metadata (uploader, duration, format ...)
    #[serde(flatten)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// Create a freshly admitted task
    pub fn new(id: TaskId, source_ref: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            id,
            source_ref: source_ref.into(),
            title: None,
            destination: destination.into(),
            status: Status::Queued,
            progress: 0.0,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
            output_path: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Name to show for the task: the title if known, otherwise derived from the source
    pub fn display_name(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }

        match url::Url::parse(&self.source_ref) {
            Ok(url) => url
                .path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
                .map(str::to_string)
                .or_else(|| url.host_str().map(str::to_string))
                .unwrap_or_else(|| self.source_ref.clone()),
            Err(_) => self.source_ref.clone(),
        }
    }

    /// Record names of the snapshot format; metadata keys must not shadow them
    pub const RECORD_FIELDS: [&'static str; 10] = [
        "id",
        "sourceRef",
        "title",
        "destinationDir",
        "status",
        "progress",
        "createdAt",
        "completedAt",
        "errorMessage",
        "outputPath",
    ];

    /// Merge engine metadata, moving keys that clash with a record field under `extra_`
    pub(crate) fn merge_metadata(
        &mut self,
        entries: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) {
        for (key, value) in entries {
            self.metadata.insert(metadata_key(key), value);
        }
    }

    /// Copy safe to flatten into a snapshot record
    pub(crate) fn to_record(&self) -> Task {
        let mut record = self.clone();
        if record.metadata.keys().any(|k| is_record_field(k)) {
            let metadata = std::mem::take(&mut record.metadata);
            record.merge_metadata(metadata);
        }
        record
    }

    /// Reset to a fresh queued lifecycle (progress and outcome cleared)
    pub(crate) fn reset_lifecycle(&mut self) {
        self.status = Status::Queued;
        self.progress = 0.0;
        self.completed_at = None;
        self.error_message = None;
        self.output_path = None;
    }
}

fn is_record_field(key: &str) -> bool {
    Task::RECORD_FIELDS.contains(&key)
}

fn metadata_key(key: String) -> String {
    if is_record_field(&key) {
        format!("extra_{key}")
    } else {
        key
    }
}

/// Clamp a progress value into `[0, 100]` (NaN becomes 0)
pub(crate) fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

/// Kind of event published through the relay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Fetch progress crossed a new reporting step
    Progress,
    /// Fetch finished successfully
    Complete,
    /// Fetch failed
    Failed,
    /// Task stopped by the user
    Stopped,
    /// Tasks were added, removed or re-queued
    RegistryChanged,
    /// Runtime configuration changed
    ConfigChanged,
}

/// Immutable notification published by background work for the consumer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    payload: BTreeMap<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Start building an event of the given type, timestamped now
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            payload: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a payload entry
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Throttled progress report for a task
    pub fn progress(id: TaskId, percent: f32) -> Self {
        Self::new(EventType::Progress)
            .with("task_id", id.0)
            .with("progress", f64::from(percent))
    }

    /// Successful completion of a task
    pub fn complete(task: &Task, path: &std::path::Path) -> Self {
        Self::new(EventType::Complete)
            .with("task_id", task.id.0)
            .with("source_ref", task.source_ref.clone())
            .with("title", task.display_name())
            .with("path", path.display().to_string())
    }

    /// Failure of a task, with its classified kind
    pub fn failed(task: &Task, kind: FailureKind, error: &str) -> Self {
        Self::new(EventType::Failed)
            .with("task_id", task.id.0)
            .with("source_ref", task.source_ref.clone())
            .with("title", task.display_name())
            .with("kind", kind.as_str())
            .with("error", error.to_string())
    }

    /// A task stopped by the user; `started` tells whether a fetch was running
    pub fn stopped(task: &Task, started: bool) -> Self {
        Self::new(EventType::Stopped)
            .with("task_id", task.id.0)
            .with("source_ref", task.source_ref.clone())
            .with("started", started)
    }

    /// Registry contents changed
    pub fn registry_changed(reason: &str, id: Option<TaskId>) -> Self {
        let event = Self::new(EventType::RegistryChanged).with("reason", reason.to_string());
        match id {
            Some(id) => event.with("task_id", id.0),
            None => event,
        }
    }

    /// A runtime setting changed
    pub fn config_changed(key: &str, value: impl Into<serde_json::Value>) -> Self {
        Self::new(EventType::ConfigChanged)
            .with("key", key.to_string())
            .with("value", value)
    }

    /// Event type
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Payload entries
    pub fn payload(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.payload
    }

    /// Single payload entry
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    /// Task the event refers to, if any
    pub fn task_id(&self) -> Option<TaskId> {
        self.payload
            .get("task_id")
            .and_then(serde_json::Value::as_i64)
            .map(TaskId)
    }

    /// Creation time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Workload class; each class gets its own isolated worker pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadClass {
    /// Content fetch jobs
    Fetch,
    /// Metadata / search queries
    Query,
}

impl std::fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadClass::Fetch => f.write_str("fetch"),
            WorkloadClass::Query => f.write_str("query"),
        }
    }
}

/// Metadata returned by the fetch engine's extraction step
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Source reference the metadata was extracted from
    pub source_ref: String,
    /// Media title
    pub title: Option<String>,
    /// Engine-specific fields
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Raw progress report from the fetch engine
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
    /// Engine status text ("downloading", "merging", ...)
    pub status: String,
    /// Bytes fetched so far
    pub bytes_done: u64,
    /// Total bytes, when known
    pub bytes_total: Option<u64>,
}

impl ProgressUpdate {
    /// Progress percentage, if the total is known
    pub fn percent(&self) -> Option<f32> {
        match self.bytes_total {
            Some(total) if total > 0 => {
                Some(clamp_progress(self.bytes_done as f32 / total as f32 * 100.0))
            }
            _ => None,
        }
    }
}

/// Task counts per status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks waiting for a slot
    pub queued: usize,
    /// Tasks being fetched
    pub downloading: usize,
    /// Tasks fetched successfully
    pub completed: usize,
    /// Failed tasks
    pub failed: usize,
    /// Stopped tasks
    pub stopped: usize,
}

impl QueueStats {
    /// Total number of tasks
    pub fn total(&self) -> usize {
        self.queued + self.downloading + self.completed + self.failed + self.stopped
    }
}
