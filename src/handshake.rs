//! Coordination between the collection thread and the polling consumer.
//!
//! Three signals (request-active, data-ready, stop-requested) plus the run
//! state share one mutex and one condition variable. The mutex is only held
//! for flag updates, never across device calls or buffer drains, so neither
//! side can stall the other by holding it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle of the collection thread.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunState {
    /// No thread has been started yet.
    #[default]
    Idle,
    /// Thread alive, waiting for request-active.
    AwaitingRequest,
    /// Thread appending packets to the buffer.
    Streaming,
    /// Streaming phase over, device being torn down.
    Draining,
    /// Thread exited after a stop request.
    Stopped,
    /// Thread exited on a device error.
    Aborted(String),
}

impl RunState {
    /// The thread has exited (or never existed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Stopped | RunState::Aborted(_))
    }
}

#[derive(Debug, Default)]
struct Signals {
    request: bool,
    ready: bool,
    stop: bool,
    state: RunState,
}

/// Result of waiting for request-active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Request,
    Stop,
    Timeout,
}

#[derive(Debug, Default)]
pub struct Handshake {
    signals: Mutex<Signals>,
    changed: Condvar,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Signals)) {
        let mut signals = self.lock();
        f(&mut signals);
        drop(signals);
        self.changed.notify_all();
    }

    // ------------------------------------------------------------------------
    // request-active
    // ------------------------------------------------------------------------

    pub fn raise_request(&self) {
        self.update(|s| s.request = true);
    }

    /// Consumer asks for the next window. An unpolled window is withdrawn in
    /// the same step, so a later poll can only see the window this request
    /// produces.
    pub fn request_window(&self) {
        self.update(|s| {
            s.ready = false;
            s.request = true;
        });
    }

    pub fn clear_request(&self) {
        self.update(|s| s.request = false);
    }

    pub fn is_request(&self) -> bool {
        self.lock().request
    }

    /// Blocks until request-active or stop-requested is raised. Stop wins.
    pub fn wait_request(&self, timeout: Duration) -> Wake {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| !s.request && !s.stop)
            .unwrap_or_else(PoisonError::into_inner);
        if guard.stop {
            Wake::Stop
        } else if guard.request {
            Wake::Request
        } else {
            Wake::Timeout
        }
    }

    // ------------------------------------------------------------------------
    // data-ready
    // ------------------------------------------------------------------------

    pub fn raise_ready(&self) {
        self.update(|s| s.ready = true);
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Waits for data-ready and clears it in the same critical section.
    /// Returns `false` on timeout.
    pub fn take_ready(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (mut guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| !s.ready)
            .unwrap_or_else(PoisonError::into_inner);
        if !guard.ready {
            return false;
        }
        guard.ready = false;
        drop(guard);
        self.changed.notify_all();
        true
    }

    // ------------------------------------------------------------------------
    // stop-requested
    // ------------------------------------------------------------------------

    pub fn raise_stop(&self) {
        self.update(|s| s.stop = true);
    }

    pub fn is_stop(&self) -> bool {
        self.lock().stop
    }

    // ------------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------------

    pub fn state(&self) -> RunState {
        self.lock().state.clone()
    }

    pub fn set_state(&self, state: RunState) {
        self.update(|s| s.state = state);
    }

    /// Resets every signal for a freshly spawned thread.
    pub fn rearm(&self) {
        self.update(|s| {
            s.request = false;
            s.ready = false;
            s.stop = false;
            s.state = RunState::AwaitingRequest;
        });
    }

    /// Top of a cycle: hide any stale window from the consumer and enter
    /// `Streaming`. Returns `false` if stop was raised in the meantime.
    pub fn begin_cycle(&self) -> bool {
        let mut started = false;
        self.update(|s| {
            if s.stop {
                return;
            }
            s.ready = false;
            s.state = RunState::Streaming;
            started = true;
        });
        started
    }

    /// End of a cycle. Clears request-active, then publishes the window
    /// unless stop was raised. Returns whether data-ready was raised.
    pub fn finish_cycle(&self) -> bool {
        let mut published = false;
        self.update(|s| {
            s.request = false;
            if !s.stop {
                s.ready = true;
                s.state = RunState::AwaitingRequest;
                published = true;
            }
        });
        published
    }

    /// Device failure mid-cycle: publish whatever was buffered and record the
    /// terminal state in one step.
    pub fn abort(&self, reason: String) {
        self.update(|s| {
            s.request = false;
            s.ready = true;
            s.state = RunState::Aborted(reason);
        });
    }

    /// Blocks until the thread reaches a terminal state.
    pub fn wait_terminal(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| !s.state.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        guard.state.is_terminal()
    }
}
