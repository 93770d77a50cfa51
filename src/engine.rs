//! Boundary to the external fetch engine

use std::path::{Path, PathBuf};

use crate::error::FetchError;
use crate::types::{Metadata, ProgressUpdate};

/// Answer of a progress callback
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressSignal {
    /// Keep fetching
    Continue,
    /// Abort as soon as possible and return [`FetchError::Stopped`]
    Stop,
}

impl ProgressSignal {
    /// Whether the engine should abort
    pub fn is_stop(&self) -> bool {
        matches!(self, ProgressSignal::Stop)
    }
}

/// Callback the engine invokes as bytes arrive
pub type ProgressCallback<'a> = dyn FnMut(&ProgressUpdate) -> ProgressSignal + Send + 'a;

/// Retrieves content for a source reference
///
/// Both calls block and are only ever made from a blocking worker thread. An
/// engine must call the progress callback regularly during [`FetchEngine::fetch`]
/// and give up with [`FetchError::Stopped`] once it answers
/// [`ProgressSignal::Stop`]; that is the only way a running fetch is cancelled.
///
/// # Examples
///
/// ```no_run
/// use mediafetch::{FetchEngine, FetchError, Metadata, ProgressCallback, ProgressUpdate};
/// use std::path::{Path, PathBuf};
///
/// struct Instant;
///
/// impl FetchEngine for Instant {
///     fn extract(&self, source_ref: &str) -> Result<Metadata, FetchError> {
///         Ok(Metadata {
///             source_ref: source_ref.to_string(),
///             title: Some("clip".to_string()),
///             ..Default::default()
///         })
///     }
///
///     fn fetch(
///         &self,
///         metadata: &Metadata,
///         destination: &Path,
///         progress: &mut ProgressCallback<'_>,
///     ) -> Result<PathBuf, FetchError> {
///         let update = ProgressUpdate {
///             status: "downloading".to_string(),
///             bytes_done: 1,
///             bytes_total: Some(1),
///         };
///         if progress(&update).is_stop() {
///             return Err(FetchError::Stopped);
///         }
///         Ok(destination.join(metadata.title.as_deref().unwrap_or("out")))
///     }
/// }
/// ```
pub trait FetchEngine: Send + Sync {
    /// Resolve metadata (title, formats, ...) for a source reference
    fn extract(&self, source_ref: &str) -> Result<Metadata, FetchError>;

    /// Fetch the content into `destination`, returning the written file's path
    fn fetch(
        &self,
        metadata: &Metadata,
        destination: &Path,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<PathBuf, FetchError>;
}
