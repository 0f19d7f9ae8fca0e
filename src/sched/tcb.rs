//! Thread control block bookkeeping and the run-permit gate.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::ids::Pid;

/// Why a thread gave up the CPU. Drives the multilevel-feedback priority
/// adjustment in [`crate::sched::Scheduler::yield_now`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// Ran out its quantum: demoted one level (capped at the lowest).
    Quantum,
    /// Blocked waiting on a pipe or socket buffer: no adjustment.
    Io,
    /// Blocked waiting on a mutex/condition variable: demoted one level,
    /// same as `Quantum` (mirrors the original's treatment of the two
    /// causes identically).
    Mutex,
    /// Blocked inside pipe/socket plumbing with a predicate not yet true:
    /// no adjustment.
    Pipe,
    /// Voluntary yield or blocking syscall (wait, join, ...): no
    /// adjustment.
    User,
    /// The per-core idle thread running out of work: no adjustment.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Init,
    Ready,
    Running,
    Stopped,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Normal,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextPhase {
    /// Has never run; its trampoline has not yet been entered.
    Clean,
    /// Has run at least once.
    Dirty,
}

/// A one-shot-reusable gate between exactly one pair of (logical) threads:
/// whichever thread is about to start running blocks on `park`, and
/// whichever thread is handing the simulated core to it calls `release`.
///
/// This stands in for `cpu_swap_context`: instead of saving and restoring
/// register state, the outgoing thread's native OS thread parks here and
/// the incoming thread's native OS thread is released from its own
/// `RunPermit`. Each `Tcb` owns exactly one of these for its entire
/// lifetime.
pub struct RunPermit {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl RunPermit {
    pub fn new() -> Arc<Self> {
        Arc::new(RunPermit {
            granted: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// Block the calling native thread until this permit is released.
    pub fn park(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cv.wait(&mut granted);
        }
        *granted = false;
    }

    /// Grant the permit, waking whoever is (or will be) parked on it.
    pub fn release(&self) {
        let mut granted = self.granted.lock();
        *granted = true;
        self.cv.notify_one();
    }
}

/// Scheduling-relevant state the scheduler's own lock protects for every
/// spawned thread, simulated core or not.
pub(crate) struct TcbRecord {
    pub owner: Pid,
    pub kind: ThreadKind,
    pub state: ThreadState,
    pub phase: ContextPhase,
    pub priority: usize,
    /// Initial time slice, in ticks, granted each time this thread is
    /// dispatched.
    pub its: u64,
    /// Remaining time slice for the current dispatch.
    pub rts: u64,
    pub last_cause: Cause,
    pub curr_cause: Cause,
    /// Absolute tick at which a sleeping thread should be woken, or
    /// [`crate::ids::NO_TIMEOUT`].
    pub wakeup_time: u64,
    /// Which simulated core this thread is currently dispatched to, if
    /// any.
    pub core: Option<usize>,
    pub permit: Arc<RunPermit>,
}

impl TcbRecord {
    pub fn new(owner: Pid, kind: ThreadKind, quantum: u64) -> Self {
        TcbRecord {
            owner,
            kind,
            state: ThreadState::Init,
            phase: ContextPhase::Clean,
            priority: 0,
            its: quantum,
            rts: quantum,
            last_cause: Cause::User,
            curr_cause: Cause::User,
            wakeup_time: crate::ids::NO_TIMEOUT,
            core: None,
            permit: RunPermit::new(),
        }
    }
}
