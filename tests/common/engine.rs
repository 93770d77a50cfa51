//! Scripted fetch engine for integration tests
//!
//! Fetches report progress in 5% steps. A held source pauses at 50% and keeps
//! reporting (so cancellation is observed) until it is released.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mediafetch::{FetchEngine, FetchError, Metadata, ProgressCallback, ProgressUpdate};
use serde_json::json;

/// What a fetch of a given source ends with
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Write `<destination>/<title>.bin`
    Complete,
    /// Return this error after reporting progress
    Fail(FetchError),
    /// Panic inside the engine
    Panic,
}

/// Engine whose behavior is scripted per source reference
#[derive(Default)]
pub struct ScriptedEngine {
    hold_all: AtomicBool,
    held: Mutex<HashSet<String>>,
    outcomes: Mutex<HashMap<String, Outcome>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedEngine {
    /// Engine that completes everything immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that pauses every fetch at 50% until [`ScriptedEngine::release_all`]
    pub fn holding() -> Self {
        let engine = Self::default();
        engine.hold_all.store(true, Ordering::SeqCst);
        engine
    }

    /// Pause fetches of `source` at 50%
    pub fn hold(&self, source: &str) {
        self.held.lock().unwrap().insert(source.to_string());
    }

    /// Let fetches of `source` continue
    pub fn release(&self, source: &str) {
        self.held.lock().unwrap().remove(source);
    }

    /// Let every fetch continue
    pub fn release_all(&self) {
        self.hold_all.store(false, Ordering::SeqCst);
        self.held.lock().unwrap().clear();
    }

    /// Script the outcome for `source`
    pub fn script(&self, source: &str, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(source.to_string(), outcome);
    }

    /// Fetches running right now
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous fetches seen
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Fetch calls so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn is_held(&self, source: &str) -> bool {
        self.hold_all.load(Ordering::SeqCst) || self.held.lock().unwrap().contains(source)
    }

    fn outcome(&self, source: &str) -> Outcome {
        self.outcomes
            .lock()
            .unwrap()
            .get(source)
            .cloned()
            .unwrap_or(Outcome::Complete)
    }

    fn transfer(
        &self,
        metadata: &Metadata,
        destination: &Path,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<PathBuf, FetchError> {
        for step in 1..=20u64 {
            loop {
                let update = ProgressUpdate {
                    status: "downloading".to_string(),
                    bytes_done: step * 5,
                    bytes_total: Some(100),
                };
                if progress(&update).is_stop() {
                    return Err(FetchError::Stopped);
                }
                if step != 10 || !self.is_held(&metadata.source_ref) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        match self.outcome(&metadata.source_ref) {
            Outcome::Complete => {
                let title = metadata.title.as_deref().unwrap_or("media");
                Ok(destination.join(format!("{title}.bin")))
            }
            Outcome::Fail(e) => Err(e),
            Outcome::Panic => panic!("scripted engine panic"),
        }
    }
}

/// Decrements the running counter however the fetch ends
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FetchEngine for ScriptedEngine {
    fn extract(&self, source_ref: &str) -> Result<Metadata, FetchError> {
        if source_ref.contains("unsupported") {
            return Err(FetchError::Other(
                "ERROR: Unsupported URL: unable to extract".to_string(),
            ));
        }
        let title = source_ref
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        // Shaped like extractor output: its own `id` and `title` next to extra fields
        let mut extra = BTreeMap::new();
        extra.insert("id".to_string(), json!(title.clone().unwrap_or_default()));
        extra.insert("title".to_string(), json!(title.clone()));
        extra.insert("uploader".to_string(), json!("scripted"));
        Ok(Metadata {
            source_ref: source_ref.to_string(),
            title,
            extra,
        })
    }

    fn fetch(
        &self,
        metadata: &Metadata,
        destination: &Path,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<PathBuf, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        self.transfer(metadata, destination, progress)
    }
}
