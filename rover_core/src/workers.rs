//! Worker orchestration: cooperative cancellation and the pause/resume
//! handshake the command dispatcher uses to preempt workers.
//!
//! Each worker polls its gate at its loop boundary. Preemption is either
//! cancel-and-respawn (when the worker has declared itself cancel-safe) or
//! pause-at-boundary; there is no asynchronous thread cancellation.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
}

#[derive(Debug, Default)]
pub struct WorkerGate {
    cancel: AtomicBool,
    /// Worker-declared: a cancel at the next boundary is currently safe.
    cancelable: AtomicBool,
    /// A cancelled worker needs a respawn once the command is done.
    was_cancelled: AtomicBool,
    pause_requested: AtomicBool,
    state: Mutex<GateState>,
    cv: Condvar,
}

impl WorkerGate {
    /// Called by the worker at its loop boundary. Blocks while paused.
    /// Returns true when the worker must exit its loop (cancelled).
    pub fn yield_point(&self) -> bool {
        if self.cancel.swap(false, Ordering::AcqRel) {
            return true;
        }
        if self.pause_requested.load(Ordering::Acquire) {
            let mut state = self.state.lock();
            state.paused = true;
            self.cv.notify_all();
            while self.pause_requested.load(Ordering::Acquire) {
                self.cv.wait(&mut state);
            }
            state.paused = false;
            self.cv.notify_all();
            if self.cancel.swap(false, Ordering::AcqRel) {
                return true;
            }
        }
        false
    }

    /// Worker-side: mark whether a cancel is currently safe.
    pub fn set_cancelable(&self, on: bool) {
        self.cancelable.store(on, Ordering::Release);
    }

    /// Dispatcher-side: cancel if the worker allows it right now. Returns
    /// true when the cancel was issued (the worker thread will exit and
    /// must be respawned after the command).
    pub fn try_cancel(&self) -> bool {
        if self.cancelable.load(Ordering::Acquire) {
            self.cancel.store(true, Ordering::Release);
            self.was_cancelled.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Dispatcher-side: block until the worker parks at its loop boundary.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
        let mut state = self.state.lock();
        while !state.paused {
            self.cv.wait(&mut state);
        }
    }

    /// Dispatcher-side: let a paused worker continue.
    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::Release);
        self.cv.notify_all();
    }

    /// Dispatcher-side: consume the needs-respawn flag.
    pub fn take_cancelled(&self) -> bool {
        self.was_cancelled.swap(false, Ordering::AcqRel)
    }

    /// Worker-side sleep that still reacts promptly to pause requests.
    pub fn idle(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// One gate per preemptable worker.
#[derive(Debug, Default)]
pub struct WorkerGates {
    pub mapping: WorkerGate,
    pub routing: WorkerGate,
    pub navigation: WorkerGate,
}
