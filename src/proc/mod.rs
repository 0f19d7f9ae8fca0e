//! Process and thread table bookkeeping.
//!
//! `Pcb` and `Ptcb` are plain data, identical in spirit to the original's
//! process/thread control blocks; the actual lifecycle operations
//! (`Exec`, `Exit`, `WaitChild`, `CreateThread`, `ThreadJoin`, ...) live on
//! [`crate::kernel::Kernel`] since they also need the scheduler and the
//! IPC tables. What lives here is the table structure itself: a
//! fixed-size process table with a free list (mirroring `PT[MAX_PROC]`),
//! and, per process, a growable thread table whose slots carry a
//! generation counter so a [`crate::ids::Tid`] naming a slot that has
//! since been recycled for a different thread is rejected rather than
//! silently resolved to the wrong thread.

use slab::Slab;

use crate::ids::Pid;
use crate::ipc::fd::FidTable;
use crate::sched::kcondvar::KCondVar;
use crate::sched::TcbId;

pub(crate) struct Ptcb {
    pub tcb: TcbId,
    pub generation: u32,
    pub exited: bool,
    pub detached: bool,
    pub exitval: i32,
    /// Number of `ThreadJoin` calls currently holding a reference to this
    /// slot, incremented at entry and decremented on the way out
    /// (regardless of outcome). A `Ptcb` that has both exited and been
    /// detached is only retired once this reaches zero, so that a second
    /// concurrent joiner still finds a live slot instead of a recycled
    /// generation.
    pub ref_count: u32,
    /// Threads parked in `ThreadJoin` waiting on this one.
    pub exit_waiters: KCondVar,
}

pub(crate) struct Pcb {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub exitval: i32,
    pub is_zombie: bool,
    pub fids: FidTable,
    threads: Slab<Ptcb>,
    thread_generations: Vec<u32>,
    /// Threads parked in `WaitChild` waiting for a child to become a
    /// zombie.
    pub child_exit: KCondVar,
}

impl Pcb {
    pub(crate) fn new(pid: Pid, parent: Option<Pid>, max_fileid: usize) -> Self {
        Pcb::with_fids(pid, parent, FidTable::new(max_fileid))
    }

    /// Build a process whose file-id table is inherited from a parent
    /// rather than starting empty: every slot the parent had open is
    /// shared (an `Arc` incref, not a copy) with the new process, mirroring
    /// `Exec`'s "duplicate the parent's FIDT" step.
    pub(crate) fn with_fids(pid: Pid, parent: Option<Pid>, fids: FidTable) -> Self {
        Pcb {
            pid,
            parent,
            children: Vec::new(),
            exitval: 0,
            is_zombie: false,
            fids,
            threads: Slab::new(),
            thread_generations: Vec::new(),
            child_exit: KCondVar::new(),
        }
    }

    pub(crate) fn spawn_thread(&mut self, tcb: TcbId) -> (u32, u32) {
        let slot = self.threads.vacant_key();
        if slot >= self.thread_generations.len() {
            self.thread_generations.resize(slot + 1, 0);
        }
        let generation = self.thread_generations[slot];
        let inserted = self.threads.insert(Ptcb {
            tcb,
            generation,
            exited: false,
            detached: false,
            exitval: 0,
            ref_count: 0,
            exit_waiters: KCondVar::new(),
        });
        debug_assert_eq!(inserted, slot);
        (slot as u32, generation)
    }

    pub(crate) fn thread(&self, slot: u32, generation: u32) -> Option<&Ptcb> {
        let ptcb = self.threads.get(slot as usize)?;
        (ptcb.generation == generation).then_some(ptcb)
    }

    pub(crate) fn thread_mut(&mut self, slot: u32, generation: u32) -> Option<&mut Ptcb> {
        let ptcb = self.threads.get_mut(slot as usize)?;
        (ptcb.generation == generation).then_some(ptcb)
    }

    pub(crate) fn retire_thread(&mut self, slot: u32) {
        self.threads.remove(slot as usize);
        self.thread_generations[slot as usize] =
            self.thread_generations[slot as usize].wrapping_add(1);
    }

    /// Record that the thread at `(slot, generation)` has called
    /// `ThreadExit`: mark it exited, stash its exit value, and wake
    /// whoever is joining it. A detached thread's `Ptcb` is retired right
    /// away, since nobody will ever join it to read the exit value back —
    /// unless a `ThreadJoin` is still concurrently holding a reference to
    /// it (`ref_count > 0`, e.g. a joiner parked between observing
    /// `detached` and decrementing on its way out), in which case that
    /// joiner retires it instead once it lets go. A non-detached thread
    /// stays on the list (still "not live", per `thread_count`) until some
    /// `ThreadJoin` reaps it.
    ///
    /// Returns the thread's own `TcbId`, whether it was detached, the
    /// joiners to wake, and the process's remaining live (not-yet-exited)
    /// thread count, the count `ThreadExit` uses to decide whether the
    /// whole process should terminate. Returns `None` if the handle is
    /// stale.
    pub(crate) fn finish_thread(
        &mut self,
        slot: u32,
        generation: u32,
        exitval: i32,
    ) -> Option<(TcbId, bool, Vec<TcbId>, usize)> {
        let tcb;
        let detached;
        let waiters;
        let retire;
        {
            let ptcb = self.thread_mut(slot, generation)?;
            tcb = ptcb.tcb;
            ptcb.exited = true;
            ptcb.exitval = exitval;
            detached = ptcb.detached;
            retire = detached && ptcb.ref_count == 0;
            waiters = ptcb.exit_waiters.drain();
        }
        if retire {
            self.retire_thread(slot);
        }
        Some((tcb, detached, waiters, self.thread_count()))
    }

    /// Count of threads that have not yet called `ThreadExit`. Distinct
    /// from the number of `Ptcb` slots still allocated: an exited thread
    /// whose join result nobody has collected yet still occupies a slot
    /// but no longer counts as "live".
    pub(crate) fn thread_count(&self) -> usize {
        self.threads.iter().filter(|(_, t)| !t.exited).count()
    }
}

/// The process table: `PT[MAX_PROC]` with a free list. Slot 0 is reserved
/// for the scheduler's own bookkeeping process (the owner of the per-core
/// idle threads) and is never handed out by `alloc`.
pub(crate) struct ProcessTable {
    slots: Vec<Option<Pcb>>,
    free: Vec<usize>,
}

impl ProcessTable {
    pub(crate) fn new(capacity: usize) -> Self {
        ProcessTable {
            slots: (0..capacity).map(|_| None).collect(),
            free: (1..capacity).rev().collect(),
        }
    }

    pub(crate) fn alloc(&mut self) -> Option<usize> {
        self.free.pop()
    }

    pub(crate) fn install(&mut self, idx: usize, pcb: Pcb) {
        self.slots[idx] = Some(pcb);
    }

    pub(crate) fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.get(pid.as_u32() as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots.get_mut(pid.as_u32() as usize)?.as_mut()
    }

    pub(crate) fn free(&mut self, pid: Pid) {
        let idx = pid.as_u32() as usize;
        self.slots[idx] = None;
        self.free.push(idx);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Scheduler, ThreadKind};

    #[test]
    fn thread_slot_generation_rejects_stale_handles() {
        let mut pcb = Pcb::new(Pid::new(1), None, 4);
        let sched = Scheduler::new(3, 3, 10);
        let (idle, _) = sched.spawn(Pid::new(0), ThreadKind::Idle);
        let (slot, gen0) = pcb.spawn_thread(idle);
        assert!(pcb.thread(slot, gen0).is_some());
        pcb.retire_thread(slot);
        let (slot2, gen1) = pcb.spawn_thread(idle);
        assert_eq!(slot, slot2);
        assert_ne!(gen0, gen1);
        assert!(pcb.thread(slot, gen0).is_none());
        assert!(pcb.thread(slot2, gen1).is_some());
    }

    #[test]
    fn process_table_reserves_slot_zero() {
        let mut pt = ProcessTable::new(4);
        let first = pt.alloc().unwrap();
        assert_eq!(first, 1);
    }
}
