//! Cancellation Signal.
//!
//! One flag per session, shared by the bootstrap thread and the round
//! thread. It only ever goes from unset to set. Readers get a lock-free
//! snapshot; `wait` parks on a condition variable until the flag is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Set-once signal with a blocking wait.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal and wakes every waiter.
    ///
    /// Returns `true` only for the call that actually set it.
    pub fn set(&self) -> bool {
        // Take the lock so a waiter between its check and its wait cannot miss the notify.
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        let first = !self.inner.flag.swap(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
        first
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Blocks until the signal is set.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_set() {
            guard = self.inner.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Blocks until the signal is set or `timeout` elapses. Returns whether it is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_set() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.cond.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    /// Returns a guard that sets the signal when dropped, including during a panic.
    pub fn set_on_drop(&self) -> SetOnDrop {
        SetOnDrop(self.clone())
    }
}

impl core::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancelSignal").field("set", &self.is_set()).finish()
    }
}

/// Sets a `CancelSignal` on drop.
#[must_use = "the signal is set as soon as the guard is dropped"]
pub struct SetOnDrop(CancelSignal);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}
