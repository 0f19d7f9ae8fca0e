//! Kernel-level condition variables.
//!
//! These are not OS condition variables: they are plain waiter lists that
//! live inside whatever data structure they guard (a [`crate::ipc::pipe::Picb`]'s
//! buffer, a listening socket's pending-request queue, a thread's exit
//! flag). The data structure is itself protected by the kernel's single
//! giant lock, so "waiting" on one of these needs to cooperate with the
//! scheduler rather than block the native OS thread directly: see
//! [`crate::kernel::Kernel::park_caller`], which parks the waiter, and the
//! call sites that drain one of these and wake each id through
//! [`crate::sched::Scheduler::wakeup`].

use super::TcbId;

#[derive(Default)]
pub(crate) struct KCondVar {
    waiters: Vec<TcbId>,
}

impl KCondVar {
    pub(crate) fn new() -> Self {
        KCondVar { waiters: Vec::new() }
    }

    pub(crate) fn enqueue(&mut self, id: TcbId) {
        if !self.waiters.contains(&id) {
            self.waiters.push(id);
        }
    }

    /// Take every waiter off this list; the caller wakes each one via
    /// [`crate::sched::Scheduler::wakeup`].
    pub(crate) fn drain(&mut self) -> Vec<TcbId> {
        std::mem::take(&mut self.waiters)
    }
}
