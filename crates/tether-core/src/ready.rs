//! One-shot readiness gate shared between a connection and its cache
//!
//! Distinguishes "connected" from "consistent": low-volume channels set the
//! signal as soon as their socket opens, identifier-stream channels leave it
//! to the owning cache's first full resolution pass.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A clearable one-shot gate
///
/// Transitions unset -> set at most once per connection lifetime and is
/// cleared again on reconnect.
#[derive(Debug, Default)]
pub struct ReadySignal {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl ReadySignal {
    /// Create a new, unset signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal, waking all waiters; idempotent
    pub fn set(&self) {
        let mut ready = self.state.lock();
        if !*ready {
            *ready = true;
            self.condvar.notify_all();
        }
    }

    /// Clear the signal (reconnect path)
    pub fn clear(&self) {
        *self.state.lock() = false;
    }

    /// Whether the signal is currently set
    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Block until the signal is set
    pub fn wait(&self) {
        let mut ready = self.state.lock();
        while !*ready {
            self.condvar.wait(&mut ready);
        }
    }

    /// Block until the signal is set or the timeout elapses
    ///
    /// Returns `true` if the signal was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut ready = self.state.lock();
        while !*ready {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            if self
                .condvar
                .wait_for(&mut ready, deadline - now)
                .timed_out()
                && !*ready
            {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_is_idempotent() {
        let signal = ReadySignal::new();
        assert!(!signal.is_set());
        signal.set();
        signal.set();
        assert!(signal.is_set());
    }

    #[test]
    fn test_clear_resets() {
        let signal = ReadySignal::new();
        signal.set();
        signal.clear();
        assert!(!signal.is_set());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_wakes_on_set() {
        let signal = Arc::new(ReadySignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        thread::sleep(Duration::from_millis(20));
        signal.set();
        waiter.join().unwrap();
        assert!(signal.is_set());
    }

    #[test]
    fn test_wait_timeout_when_never_set() {
        let signal = ReadySignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(30)));
    }
}
