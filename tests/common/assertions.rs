//! Waiting helpers and an event recorder

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediafetch::{Event, EventType, MediaFetcher, Status, TaskId};

/// Default deadline for waits in tests
pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for a task to reach `status`
pub async fn wait_for_status(fetcher: &MediaFetcher, id: TaskId, status: Status) -> bool {
    wait_until(WAIT, || fetcher.get(id).map(|t| t.status) == Some(status)).await
}

/// Wait until every task is terminal and no fetch holds a slot
pub async fn wait_for_idle(fetcher: &MediaFetcher) -> bool {
    wait_until(WAIT, || {
        let stats = fetcher.stats();
        stats.queued == 0 && stats.downloading == 0 && fetcher.active_count() == 0
    })
    .await
}

/// Records every event delivered by the relay, in delivery order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    /// Subscribe to every event type of `fetcher`
    pub fn attach(fetcher: &MediaFetcher) -> Self {
        let log = Self::default();
        for event_type in [
            EventType::Progress,
            EventType::Complete,
            EventType::Failed,
            EventType::Stopped,
            EventType::RegistryChanged,
            EventType::ConfigChanged,
        ] {
            let sink = Arc::clone(&log.events);
            fetcher.subscribe(event_type, move |event| {
                sink.lock().unwrap().push(event.clone());
                Ok(())
            });
        }
        log
    }

    /// Copy of everything recorded
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Recorded events of one type
    pub fn of_type(&self, event_type: EventType) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    /// Recorded events about one task
    pub fn for_task(&self, id: TaskId) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.task_id() == Some(id))
            .collect()
    }

    /// Number of recorded events of one type
    pub fn count(&self, event_type: EventType) -> usize {
        self.of_type(event_type).len()
    }
}
