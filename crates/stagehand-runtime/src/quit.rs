#![forbid(unsafe_code)]

//! Harness-wide quitting flag.
//!
//! Once a test starts tearing down (or a failure is reported) the harness
//! is *quiescing*: the scheduler drops new work and poll sessions abort at
//! their next tick. Cancellation is cooperative and checked at tick
//! boundaries; nothing already running is interrupted.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Shared quitting flag.
///
/// Clones observe the same flag. Waiters blocked in
/// [`wait_timeout`](Self::wait_timeout) wake as soon as [`quit`](Self::quit)
/// is called.
#[derive(Clone, Default)]
pub struct QuitSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl QuitSignal {
    /// Create a signal in the "running" state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether quitting has been requested.
    pub fn is_quitting(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request quitting and wake every waiter.
    pub fn quit(&self) {
        let (lock, cvar) = &*self.inner;
        let mut quitting = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *quitting = true;
        cvar.notify_all();
    }

    /// Return to the running state. Used at test setup.
    pub fn reset(&self) {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Wait for either quitting or a timeout.
    ///
    /// Returns `true` if quitting was requested, `false` if the timeout
    /// elapsed first. Spurious wakeups are absorbed.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut quitting = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = Instant::now() + duration;
        loop {
            if *quitting {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(quitting, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            quitting = guard;
        }
    }
}

impl std::fmt::Debug for QuitSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuitSignal")
            .field("quitting", &self.is_quitting())
            .finish()
    }
}
