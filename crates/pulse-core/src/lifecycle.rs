//! Run state of a bus and the gate in front of `publish` and `subscribe`.
//!
//! Callers enter the gate by bumping an active counter and then checking the
//! state. Shutdown flips the state first and then waits for the counter to
//! reach zero. Both sides use `SeqCst`, so either the caller sees the new
//! state and backs out, or shutdown sees the caller and waits for it. Once
//! shutdown observes zero, nothing can enqueue async work any more.

use crate::error::BusError;
use std::hint;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Spins before falling back to sleeping in [`Lifecycle::wait_idle`].
const SPIN_LIMIT: u32 = 64;

/// Bus run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Accepting publishes and subscriptions.
    Running,
    /// Shutdown requested, waiting for callers and workers.
    Stopping,
    /// Workers joined.
    Stopped,
}

#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    active: AtomicUsize,
}

/// Held by a caller inside the gate.
pub(crate) struct ActiveGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enter the gate.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ShutdownInProgress`] once shutdown has begun.
    pub(crate) fn enter(&self) -> Result<ActiveGuard<'_>, BusError> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard { lifecycle: self };
        if self.state.load(Ordering::SeqCst) != RUNNING {
            return Err(BusError::ShutdownInProgress);
        }
        Ok(guard)
    }

    /// Move from running to stopping. Returns `false` if shutdown already
    /// began.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Block until no caller is inside the gate.
    pub(crate) fn wait_idle(&self) {
        let mut spins = 0;
        while self.active.load(Ordering::SeqCst) != 0 {
            if spins < SPIN_LIMIT {
                hint::spin_loop();
                spins += 1;
            } else {
                thread::sleep(Duration::from_micros(50));
            }
        }
    }

    pub(crate) fn finish(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
    }

    pub(crate) fn state(&self) -> BusState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => BusState::Running,
            STOPPING => BusState::Stopping,
            _ => BusState::Stopped,
        }
    }
}
