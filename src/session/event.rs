//! Level-triggered signalling events.
//!
//! The session threads coordinate through a handful of named events
//! (`idle`, `send`, `process`, `terminate`, ...). An [`Event`] is a
//! level-triggered one-shot: the setter sets it, any number of waiters
//! observe it, and the consumer clears it explicitly before the next
//! expected signal.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A boolean flag threads can block on.
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        // A poisoned lock only means a panicking thread held it; the bool
        // inside is still valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the flag and wake all waiters.
    pub fn set(&self) {
        *self.state() = true;
        self.cond.notify_all();
    }

    /// Clear the flag.
    pub fn clear(&self) {
        *self.state() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state()
    }

    /// Block until the flag is set. The flag is left set; waiting does not
    /// consume the signal.
    pub fn wait(&self) {
        let mut state = self.state();
        while !*state {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the flag is set or `timeout` elapses. Returns whether
    /// the flag was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while !*state {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, remaining)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        true
    }
}
