//! Simulated BIOS.
//!
//! The distilled design treats the monotonic clock, per-core timer/alarm,
//! context switch and core halt/restart as services a real BIOS supplies
//! "for free". A hosted crate has no such hardware to lean on, so this
//! module stands in for it: a ticking monotonic clock driven by a
//! background thread, one alarm deadline per simulated core, and a
//! halt/restart rendezvous cores use to sleep when the run queues are
//! empty instead of spinning.
//!
//! Actual context switching is handled by [`crate::sched::tcb::RunPermit`]
//! rather than here, since on a hosted OS "switching" a simulated core to
//! a different thread of control means handing off a permit between two
//! real native threads, not swapping registers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::ids::NO_TIMEOUT;

/// Monotonic simulated time, plus per-core alarm deadlines and the
/// halt/restart rendezvous used by idle cores.
pub struct Bios {
    tick: AtomicU64,
    tick_lock: Mutex<()>,
    tick_cv: Condvar,
    alarms: Vec<AtomicU64>,
    halt_lock: Mutex<()>,
    halt_cv: Condvar,
    shutting_down: AtomicBool,
}

impl Bios {
    pub fn new(cores: usize) -> Self {
        Bios {
            tick: AtomicU64::new(0),
            tick_lock: Mutex::new(()),
            tick_cv: Condvar::new(),
            alarms: (0..cores).map(|_| AtomicU64::new(NO_TIMEOUT)).collect(),
            halt_lock: Mutex::new(()),
            halt_cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Current simulated tick count.
    pub fn now(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Advance the clock by one tick and wake anyone sleeping on an
    /// absolute deadline. Called only by the kernel's ticker thread.
    pub(crate) fn advance(&self) -> u64 {
        let now = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = self.tick_lock.lock();
        self.tick_cv.notify_all();
        now
    }

    /// Block the caller until the clock has advanced past `deadline`, or
    /// forever if `deadline` is [`NO_TIMEOUT`]. Used by code that wants to
    /// wait on wall-clock time directly rather than through the scheduler's
    /// timeout list (the ticker thread itself uses a plain sleep instead).
    #[allow(dead_code)]
    pub fn wait_until(&self, deadline: u64) {
        if deadline == NO_TIMEOUT {
            return;
        }
        let mut guard = self.tick_lock.lock();
        while self.now() < deadline {
            self.tick_cv.wait(&mut guard);
        }
    }

    /// Arm core `core`'s quantum alarm to expire `ticks_from_now` ticks in
    /// the future. A value of [`NO_TIMEOUT`] disarms it.
    pub fn arm(&self, core: usize, ticks_from_now: u64) {
        let deadline = if ticks_from_now == NO_TIMEOUT {
            NO_TIMEOUT
        } else {
            self.now().saturating_add(ticks_from_now)
        };
        self.alarms[core].store(deadline, Ordering::Release);
    }

    /// Whether core `core`'s armed quantum has expired.
    pub fn expired(&self, core: usize) -> bool {
        let deadline = self.alarms[core].load(Ordering::Acquire);
        deadline != NO_TIMEOUT && self.now() >= deadline
    }

    /// Park the calling (idle) thread until [`Bios::restart_all`] is
    /// called or the kernel is shutting down.
    pub fn halt(&self) {
        let mut guard = self.halt_lock.lock();
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        self.halt_cv.wait(&mut guard);
    }

    /// Wake every core parked in [`Bios::halt`]. Broadcast rather than
    /// targeted: any halted core re-checks the run queues itself and goes
    /// back to sleep if there is still nothing for it to do.
    pub fn restart_all(&self) {
        let _guard = self.halt_lock.lock();
        self.halt_cv.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.restart_all();
        let _guard = self.tick_lock.lock();
        self.tick_cv.notify_all();
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

pub(crate) const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_expires_after_arming() {
        let bios = Bios::new(1);
        bios.arm(0, 5);
        assert!(!bios.expired(0));
        for _ in 0..5 {
            bios.advance();
        }
        assert!(bios.expired(0));
    }

    #[test]
    fn no_timeout_never_expires() {
        let bios = Bios::new(1);
        bios.arm(0, NO_TIMEOUT);
        for _ in 0..1000 {
            bios.advance();
        }
        assert!(!bios.expired(0));
    }
}
