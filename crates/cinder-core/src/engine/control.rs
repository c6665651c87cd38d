//! Run-state bookkeeping shared between the run loop, hooks and other threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Why a run finished successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ExitReason {
    /// The program counter reached the `until` address.
    Until,
    /// The instruction budget was used up.
    CountExhausted,
    /// The wall-clock budget elapsed.
    Timeout,
    /// A hook or another thread requested a stop.
    StopRequested,
    /// The guest executed a halting instruction.
    Halted,
}

/// Execution state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Never started.
    Idle,
    /// A run is in progress.
    Running,
    /// The last run finished successfully.
    Stopped(ExitReason),
    /// The last run ended on an error.
    Faulted(Error),
}

/// Atomic flags of one engine. The only state touched from other threads.
#[derive(Debug, Default)]
pub(crate) struct Control {
    stop_requested: AtomicBool,
    running: AtomicBool,
    closed: AtomicBool,
    timed_out: AtomicBool,
}

impl Control {
    /// Enters the running state and clears any stale stop request. A rejected
    /// call leaves the run in progress untouched.
    pub(crate) fn begin_run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.timed_out.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn end_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Stop request from outside the run loop.
    pub(crate) fn stop(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidHandle);
        }
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.request_stop();
        Ok(())
    }
}

/// Thread-safe handle that can stop a run of the engine it came from.
///
/// This is the only engine operation permitted from a thread other than the
/// one executing the guest. The request takes effect at the next instruction
/// boundary.
#[derive(Debug, Clone)]
pub struct StopHandle {
    control: Arc<Control>,
}

impl StopHandle {
    pub(crate) const fn new(control: Arc<Control>) -> Self {
        Self { control }
    }

    /// Requests that the current run stop.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] once the engine is closed and
    /// [`Error::NotRunning`] when no run is in progress.
    pub fn stop(&self) -> Result<()> {
        self.control.stop()
    }

    /// Returns `true` while the engine is executing guest code.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }
}
