//! Re-armable expiry gate backing read and write deadlines
//!
//! A [`Deadline`] can be armed with an absolute instant, cleared, or observed
//! through a single-fire [`Signal`] suitable for racing in a `select!`.
//! Re-arming before expiry fully neutralizes the previous timer; a stale
//! timer can never fire after its gate has been re-armed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A one-shot event: becomes observably set exactly once and stays set.
pub(crate) struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Signal {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Fire the signal, waking all current waiters. Later calls are no-ops.
    pub(crate) fn set(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolve once the signal fires, immediately if it already has.
    pub(crate) async fn wait(&self) {
        loop {
            // Register before checking the flag so a concurrent set() cannot
            // slip between the check and the await.
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

struct GateState {
    /// Bumped on every re-arm; a timer fires only if its generation is
    /// still the current one.
    generation: u64,
    signal: Arc<Signal>,
    timer: Option<JoinHandle<()>>,
}

/// A mutable, thread-safe expiration gate for one direction of a stream.
pub(crate) struct Deadline {
    state: Arc<Mutex<GateState>>,
}

fn lock(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Deadline {
    pub(crate) fn new() -> Self {
        Deadline {
            state: Arc::new(Mutex::new(GateState {
                generation: 0,
                signal: Arc::new(Signal::new()),
                timer: None,
            })),
        }
    }

    /// Arm the gate. `None` clears any deadline; a past or current instant
    /// expires the gate immediately; a future instant schedules expiry,
    /// replacing any previously scheduled one.
    pub(crate) fn set(&self, deadline: Option<Instant>) {
        let mut state = lock(&self.state);

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;

        let deadline = match deadline {
            Some(deadline) => deadline,
            None => {
                // No deadline. If the previous one already fired, waiters of
                // the old signal have been released; new waits start fresh.
                if state.signal.is_set() {
                    state.signal = Arc::new(Signal::new());
                }
                return;
            }
        };

        if deadline <= Instant::now() {
            state.signal.set();
            return;
        }

        if state.signal.is_set() {
            state.signal = Arc::new(Signal::new());
        }

        // Keep the same signal that blocked waiters are already holding, so
        // extending a pending deadline moves their expiry rather than
        // orphaning them.
        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut state = lock(&shared);
            if state.generation == generation {
                state.signal.set();
                state.timer = None;
            }
        }));
    }

    /// Snapshot the current expiry signal for use in a multi-way wait.
    pub(crate) fn expired(&self) -> Arc<Signal> {
        lock(&self.state).signal.clone()
    }
}
