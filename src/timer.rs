//! Deferred-stop timer: a single-shot grace period armed after a detection.
//! A dedicated worker waits for a start signal, then up to the grace delay
//! for a cancel; if none arrives it commits the stop through the callback
//! supplied to [`DeferredStopTimer::run`].
//!
//! The timer lock is released before the stop callback runs, so the
//! callback may take the stream lock without ordering violations.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Grace period between a detection and the committed stop.
pub const DEFERRED_STOP_DELAY: Duration = Duration::from_millis(1000);

struct TimerFlags {
    /// Set when a delayed stop has been armed and not yet consumed.
    start_requested: bool,
    /// Set by cancel; a pending wait gives up without committing.
    stop_waiting: bool,
    exit: bool,
}

pub struct DeferredStopTimer {
    flags: Mutex<TimerFlags>,
    start_cond: Condvar,
    cancel_cond: Condvar,
}

impl Default for DeferredStopTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredStopTimer {
    pub fn new() -> Self {
        DeferredStopTimer {
            flags: Mutex::new(TimerFlags {
                start_requested: false,
                stop_waiting: false,
                exit: false,
            }),
            start_cond: Condvar::new(),
            cancel_cond: Condvar::new(),
        }
    }

    /// Arm the delayed stop. Idempotent.
    pub fn post(&self) {
        let mut flags = self.flags.lock();
        flags.start_requested = true;
        flags.stop_waiting = false;
        self.start_cond.notify_one();
    }

    /// Cancel a pending delayed stop. Idempotent; a no-op when nothing is
    /// armed.
    pub fn cancel(&self) {
        let mut flags = self.flags.lock();
        flags.start_requested = false;
        flags.stop_waiting = true;
        self.cancel_cond.notify_one();
    }

    /// Force the worker loop to return.
    pub fn shutdown(&self) {
        let mut flags = self.flags.lock();
        flags.exit = true;
        flags.stop_waiting = true;
        self.start_cond.notify_one();
        self.cancel_cond.notify_one();
    }

    /// Worker loop. `on_fire` commits the stop; it runs with the timer lock
    /// released and must itself check whether the stop is still pending.
    pub fn run(&self, mut on_fire: impl FnMut()) {
        let mut flags = self.flags.lock();
        loop {
            while !flags.start_requested && !flags.exit {
                self.start_cond.wait(&mut flags);
            }
            if flags.exit {
                break;
            }
            flags.start_requested = false;

            let timed_out = self
                .cancel_cond
                .wait_while_for(&mut flags, |f| !f.stop_waiting && !f.exit, DEFERRED_STOP_DELAY)
                .timed_out();

            if flags.exit {
                break;
            }
            if !flags.stop_waiting {
                debug!(timed_out, "deferred stop elapsed, committing");
                drop(flags);
                on_fire();
                flags = self.flags.lock();
            }
        }
        debug!("deferred-stop worker exiting");
    }
}
