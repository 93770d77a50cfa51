//! Error types for mediafetch
//!
//! Two layers:
//! - [`Error`] for control-surface operations (admission, re-queue, pools, snapshots)
//! - [`FetchError`] for failures reported by the fetch engine from inside a job.
//!   These never cross into the consumer as errors; they end up as a `Failed`
//!   status plus an event payload, or as `Stopped` for [`FetchError::Stopped`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{TaskId, WorkloadClass};

/// Result type alias for mediafetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mediafetch
#[derive(Debug, Error)]
pub enum Error {
    /// The source reference already belongs to a queued or downloading task
    #[error("duplicate source: {source_ref} is already active as task {existing}")]
    Duplicate {
        /// The rejected source reference
        source_ref: String,
        /// The task currently holding it
        existing: TaskId,
    },

    /// The source reference cannot be admitted
    #[error("invalid source reference: {0:?}")]
    InvalidSource(String),

    /// Task not found
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Cannot perform operation in current state
    #[error("cannot {operation} task {id} in state {current_state}")]
    InvalidState {
        /// The task that is in an invalid state for the operation
        id: TaskId,
        /// The operation that was attempted (e.g. "retry")
        operation: String,
        /// The state that prevents it
        current_state: String,
    },

    /// The worker pool no longer accepts jobs
    #[error("worker pool '{0}' is shut down")]
    PoolShutDown(WorkloadClass),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g. "events.queue_capacity")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Diagnostic category of a fetch failure
///
/// Used for log fields and user messages only; it never changes control flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Connection, DNS, timeout or HTTP transport failure
    Network,
    /// Login required, private or age-restricted content
    Authentication,
    /// Requested format unavailable or conversion failed
    Format,
    /// The engine could not extract media information
    Extraction,
    /// Anything else
    Generic,
}

impl FailureKind {
    /// Lowercase name used in event payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Authentication => "authentication",
            FailureKind::Format => "format",
            FailureKind::Extraction => "extraction",
            FailureKind::Generic => "generic",
        }
    }

    /// Infer a kind from an engine error message
    pub fn classify(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        let any = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

        if any(&[
            "sign in",
            "login",
            "log in",
            "authentication",
            "unauthorized",
            "401",
            "403",
            "private video",
            "members-only",
            "age-restricted",
        ]) {
            FailureKind::Authentication
        } else if any(&[
            "timed out",
            "timeout",
            "connection",
            "network",
            "unreachable",
            "dns",
            "resolve host",
            "ssl",
        ]) {
            FailureKind::Network
        } else if any(&[
            "requested format",
            "format not available",
            "no video formats",
            "ffmpeg",
            "postprocessing",
            "codec",
        ]) {
            FailureKind::Format
        } else if any(&["unable to extract", "unsupported url", "extractor", "no media"]) {
            FailureKind::Extraction
        } else {
            FailureKind::Generic
        }
    }

    /// Short user-facing explanation prefix
    pub fn user_hint(&self) -> &'static str {
        match self {
            FailureKind::Network => "Network error",
            FailureKind::Authentication => "Authentication required",
            FailureKind::Format => "Format unavailable",
            FailureKind::Extraction => "Could not read media information",
            FailureKind::Generic => "Download failed",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a fetch engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The progress callback asked the engine to stop
    #[error("stopped by user")]
    Stopped,

    /// Transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Credentials or access rights missing
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Requested format unavailable or post-processing failed
    #[error("format error: {0}")]
    Format(String),

    /// Media information could not be extracted
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Unclassified engine failure
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether this is a cooperative stop rather than a failure
    pub fn is_stop(&self) -> bool {
        matches!(self, FetchError::Stopped)
    }

    /// Diagnostic category; unclassified errors are classified from their message
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Network(_) => FailureKind::Network,
            FetchError::Authentication(_) => FailureKind::Authentication,
            FetchError::Format(_) => FailureKind::Format,
            FetchError::Extraction(_) => FailureKind::Extraction,
            FetchError::Other(msg) => FailureKind::classify(msg),
            FetchError::Stopped => FailureKind::Generic,
        }
    }

    /// Message stored on the failed task
    pub fn user_message(&self) -> String {
        format!("{}: {}", self.kind().user_hint(), self)
    }
}
