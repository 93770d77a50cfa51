//! Deferred callbacks that never outlive their consumer.
//!
//! [`CallbackGuard::defer`] arms a timer on the runtime. When it fires, the
//! callback is handed to the consumer side through a channel and runs the next
//! time the consumer calls [`CallbackGuard::run_due`]. Every callback holds a
//! child of the guard's cancellation scope; [`CallbackGuard::teardown`] cancels
//! the scope, so nothing registered through the guard runs afterwards.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::panic_message;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a deferred callback
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

/// Owner of every deferred callback a consumer registers
pub struct CallbackGuard {
    scope: CancellationToken,
    torn_down: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<HashMap<CallbackId, CancellationToken>>,
    fired_tx: mpsc::UnboundedSender<(CallbackId, Callback)>,
    fired_rx: Mutex<mpsc::UnboundedReceiver<(CallbackId, Callback)>>,
    runtime: Handle,
}

impl std::fmt::Debug for CallbackGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackGuard")
            .field("torn_down", &self.is_torn_down())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl CallbackGuard {
    /// Create a guard whose timers run on `runtime`
    pub fn new(runtime: Handle) -> Self {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        Self {
            scope: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            fired_tx,
            fired_rx: Mutex::new(fired_rx),
            runtime,
        }
    }

    /// Run `callback` on the consumer side once `delay` has elapsed
    ///
    /// Returns `None` after [`CallbackGuard::teardown`]. Callable from any thread.
    pub fn defer<F>(&self, delay: Duration, callback: F) -> Option<CallbackId>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_torn_down() {
            return None;
        }

        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.scope.child_token();
        self.lock_pending().insert(id, token.clone());

        let fired = self.fired_tx.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        let _ = fired.send((id, Box::new(callback)));
                    }
                }
            }
        });

        Some(id)
    }

    /// Hand `callback` to the consumer's next [`CallbackGuard::run_due`]
    pub fn post<F>(&self, callback: F) -> Option<CallbackId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.defer(Duration::ZERO, callback)
    }

    /// Drop a pending callback; `false` if it already ran or was cancelled
    pub fn cancel(&self, id: CallbackId) -> bool {
        match self.lock_pending().remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run every callback whose timer fired; consumer side only
    ///
    /// Returns the number of callbacks run. A panicking callback is logged and
    /// does not stop the others.
    pub fn run_due(&self) -> usize {
        let fired: Vec<(CallbackId, Callback)> = {
            let mut rx = self.fired_rx.lock().unwrap_or_else(PoisonError::into_inner);
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };

        let mut ran = 0;
        for (id, callback) in fired {
            if self.is_torn_down() {
                break;
            }
            let Some(token) = self.lock_pending().remove(&id) else {
                continue;
            };
            if token.is_cancelled() {
                continue;
            }

            if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
                tracing::error!(
                    callback = id.0,
                    panic = panic_message(panic.as_ref()),
                    "Deferred callback panicked"
                );
            }
            ran += 1;
        }
        ran
    }

    /// Cancel every pending callback and refuse new ones; idempotent
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.scope.cancel();
        let dropped = {
            let mut pending = self.lock_pending();
            let count = pending.len();
            pending.clear();
            count
        };

        let mut rx = self.fired_rx.lock().unwrap_or_else(PoisonError::into_inner);
        while rx.try_recv().is_ok() {}

        tracing::debug!(dropped, "Callback guard torn down");
    }

    /// Whether [`CallbackGuard::teardown`] was called
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Callbacks registered and not yet run or cancelled
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CallbackId, CancellationToken>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        self.teardown();
    }
}
