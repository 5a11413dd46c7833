//! Small synchronization primitives shared across pipeline stages.
//!
//! - `Signal`: a resettable, waitable boolean flag. Used as the process-wide
//!   stop signal and as the per-connection "detections ready" signal.
//! - `AtomicF64`: lock-free `f64` cell for metrics read by health checks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Waitable flag with `set`/`clear` semantics.
///
/// `wait` returns as soon as the flag is set, or `false` after the timeout.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = self.lock();
        *state = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Block until the flag is set or `timeout` elapses. Returns the flag state.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !*state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        // A poisoned flag still holds a meaningful bool.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `f64` stored as raw bits in an `AtomicU64`.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}
