//! Event relay between background work and the single consumer.
//!
//! Producers (fetch jobs, the scheduler, the registry) call [`EventRelay::publish`],
//! which never blocks: events go into a bounded channel and are dropped when it is
//! full. The consumer drains the channel on a fixed tick, either by calling
//! [`EventRelay::drain`] from its own loop or by letting
//! [`EventRelay::spawn_tick_loop`] do it, and handlers run synchronously on the
//! draining side in publish order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{Event, EventType};


/// Outcome of a handler invocation; errors are logged by the relay
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

/// Identifier returned by [`EventRelay::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

struct Subscription {
    id: SubscriptionId,
    event_type: EventType,
    handler: Handler,
}

/// Many-producer, single-consumer event queue with a subscriber registry
pub struct EventRelay {
    tx: mpsc::Sender<Event>,
    rx: Mutex<mpsc::Receiver<Event>>,
    subscribers: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    stopped: AtomicBool,
    dropped: AtomicU64,
    tick_cancel: CancellationToken,
    tick_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRelay")
            .field("capacity", &self.capacity())
            .field("pending", &self.pending())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl EventRelay {
    /// Create a relay buffering at most `capacity` undelivered events
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            tick_cancel: CancellationToken::new(),
            tick_handle: Mutex::new(None),
        }
    }

    /// Queue an event for the consumer without blocking
    ///
    /// Returns `false` (and drops the event) if the queue is full or the relay
    /// has been stopped.
    pub fn publish(&self, event: Event) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            tracing::debug!(event_type = ?event.event_type(), "Relay stopped, dropping event");
            return false;
        }

        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    event_type = ?event.event_type(),
                    task_id = ?event.task_id(),
                    dropped_total = dropped,
                    "Event queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Register a handler for one event type
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock_subscribers().push(Subscription {
            id,
            event_type,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a handler; `false` if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() < before
    }

    /// Deliver up to `max_batch` queued events to their handlers
    ///
    /// Must only be called from the consumer side. Returns the number of events
    /// dequeued.
    pub fn drain(&self, max_batch: usize) -> usize {
        let batch: Vec<Event> = {
            let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
            let mut batch = Vec::with_capacity(max_batch.min(64));
            while batch.len() < max_batch {
                match rx.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }
            batch
        };

        for event in &batch {
            self.dispatch(event);
        }

        batch.len()
    }

    /// Deliver everything currently queued
    pub fn drain_all(&self) -> usize {
        let mut total = 0;
        loop {
            let delivered = self.drain(usize::MAX);
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }

    /// Drain on a fixed tick from a background task until [`EventRelay::stop`]
    ///
    /// Calling this again while a loop is running has no effect. A zero
    /// interval is raised to one millisecond.
    pub fn spawn_tick_loop(self: &Arc<Self>, interval: Duration, max_batch: usize) {
        let mut handle = self
            .tick_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() || self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let relay = Arc::clone(self);
        let cancel = self.tick_cancel.clone();
        let interval = interval.max(Duration::from_millis(1));
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        relay.drain(max_batch);
                    }
                    _ = cancel.cancelled() => {
                        break;
                    }
                }
            }
        }));
    }

    /// Halt the tick loop and deliver every remaining event
    ///
    /// Later publishes are rejected. Returns the number of events delivered by
    /// the final drain. Calling it again only drains.
    pub async fn stop(&self) -> usize {
        self.stopped.store(true, Ordering::SeqCst);
        self.tick_cancel.cancel();

        let handle = self
            .tick_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Event tick loop ended abnormally");
        }

        // Publishes racing the stop flag fail on the closed channel
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        let delivered = self.drain_all();
        tracing::debug!(delivered, "Event relay stopped");
        delivered
    }

    /// Whether [`EventRelay::stop`] was called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Events waiting for the consumer
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Events dropped because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn dispatch(&self, event: &Event) {
        // Snapshot handlers so they can (un)subscribe without deadlocking
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .lock_subscribers()
            .iter()
            .filter(|s| s.event_type == event.event_type())
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        subscription = id.0,
                        event_type = ?event.event_type(),
                        error = %e,
                        "Event handler failed"
                    );
                }
                Err(panic) => {
                    tracing::error!(
                        subscription = id.0,
                        event_type = ?event.event_type(),
                        panic = panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
