//! The kernel itself: a single explicit context object gluing the
//! scheduler, the simulated BIOS, the process/thread tables, and the IPC
//! tables together behind one giant lock.
//!
//! Every operation a real kernel would expose as a syscall is a method
//! here taking an explicit `caller: Tid` identifying who is making the
//! call, rather than consulting ambient global state: the "global
//! mutable tables" the original kernel used (`PT[]`, `PORT_MAP[]`, the
//! current-thread-per-core pointer) all live inside one `Kernel` value
//! instead, and nothing about a call's behavior depends on which thread
//! happens to be running except through that parameter.
//!
//! A thread is never suspended and resumed by saving and restoring
//! registers; it is a real native OS thread gated by a
//! [`crate::sched::RunPermit`]. Blocking a thread means transferring that
//! permit to whichever thread the scheduler selects next, see
//! [`Kernel::park_caller`].

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::bios::Bios;
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::ids::{Fid, Pid, Port, Tid, NOFILE, NOPORT, NOPROC, NO_TIMEOUT};
use crate::ipc::fd::Fcb;
use crate::ipc::info::InfoStream;
use crate::ipc::pipe::{IoAttempt, Picb};
use crate::ipc::socket::{Listener, PortMap, RequestOutcome, Scb, Request};
use crate::proc::{Pcb, ProcessTable};
use crate::sched::{Cause, Scheduler, TcbId, ThreadKind, ThreadState};

/// A process or thread entry point: called with a handle back to the
/// kernel, the new thread's own identity, and its argument blob. Its
/// return value becomes the thread's exit value, exactly as if it had
/// called [`Kernel::thread_exit`] itself.
pub type Task = Arc<dyn Fn(&Arc<Kernel>, Tid, Arc<Vec<u8>>) -> i32 + Send + Sync>;

thread_local! {
    static CURRENT_TID: Cell<Option<Tid>> = const { Cell::new(None) };
}

struct KernelState {
    processes: ProcessTable,
    ports: PortMap,
}

pub struct Kernel {
    state: Mutex<KernelState>,
    scheduler: Scheduler,
    bios: Bios,
    config: KernelConfig,
    shutting_down: AtomicBool,
}

impl Kernel {
    /// Build a kernel, spawning one idle thread per simulated core. The
    /// returned value is an `Arc` because the ticker thread and every
    /// simulated thread's native OS thread hold a (strong, for the
    /// ticker's case weak) reference back to it.
    pub fn new(config: KernelConfig) -> Arc<Kernel> {
        let bios = Bios::new(config.max_cores);
        let scheduler = Scheduler::new(
            config.sched_max_level,
            config.sched_max_scheduled,
            config.quantum_ticks,
        );
        let mut processes = ProcessTable::new(config.max_proc);
        // Slot 0 is reserved for the scheduler's own bookkeeping process,
        // the nominal owner of every per-core idle thread.
        processes.install(0, Pcb::new(Pid::new(0), None, 1));
        let ports = PortMap::new(config.max_port);

        let kernel = Arc::new(Kernel {
            state: Mutex::new(KernelState { processes, ports }),
            scheduler,
            bios,
            config,
            shutting_down: AtomicBool::new(false),
        });

        for core in 0..kernel.config.max_cores {
            let (tcb, _permit) = kernel.scheduler.spawn(Pid::new(0), ThreadKind::Idle);
            let registered = kernel.scheduler.register_core(tcb);
            debug_assert_eq!(registered, core);
            let k = Arc::clone(&kernel);
            std::thread::Builder::new()
                .name(format!("tinykernel-idle{core}"))
                .spawn(move || idle_loop(k, tcb))
                .expect("failed to spawn idle thread");
        }

        let ticker_kernel = Arc::downgrade(&kernel);
        let tick_period = kernel.config.tick_period;
        std::thread::Builder::new()
            .name("tinykernel-ticker".into())
            .spawn(move || ticker_loop(ticker_kernel, tick_period))
            .expect("failed to spawn ticker thread");

        kernel
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The calling native OS thread's own `Tid`, if it is one the kernel
    /// spawned (set once, by the trampoline, before the thread's task
    /// function runs).
    pub fn thread_self() -> Option<Tid> {
        CURRENT_TID.with(|c| c.get())
    }

    fn bind_current(tid: Tid) {
        CURRENT_TID.with(|c| c.set(Some(tid)));
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop accepting new work and release every halted idle core so it
    /// can notice and exit. Threads genuinely blocked elsewhere (inside a
    /// pipe/socket wait, or already exited) are not forcibly woken, the
    /// same way killing a real process does not rewind threads blocked in
    /// the kernel.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.bios.shutdown();
    }

    fn lookup_tcb(&self, guard: &KernelState, tid: Tid) -> Result<TcbId> {
        guard
            .processes
            .get(tid.pid())
            .and_then(|pcb| pcb.thread(tid.slot, tid.generation))
            .map(|ptcb| ptcb.tcb)
            .ok_or(KernelError::StaleHandle)
    }

    /// Wake a thread and, if that actually changed anything, release any
    /// core halted in [`Bios::halt`] so it notices the new work.
    fn wake(&self, tcb: TcbId) {
        if self.scheduler.wakeup(tcb) {
            self.bios.restart_all();
        }
    }

    /// Park the calling thread (`current`) for `cause`, after running
    /// `unlock` to release whatever guard the caller was holding over the
    /// predicate it is waiting on. Returns a freshly reacquired lock on
    /// the kernel state once this thread has been dispatched again.
    fn park_caller<'k>(
        &'k self,
        guard: MutexGuard<'k, KernelState>,
        current: TcbId,
        cause: Cause,
        timeout: u64,
    ) -> MutexGuard<'k, KernelState> {
        self.scheduler.sleep_releasing(
            &self.bios,
            current,
            ThreadState::Stopped,
            cause,
            timeout,
            move || drop(guard),
        );
        self.state.lock()
    }

    /// Introspection hook: the calling thread's current scheduler
    /// priority band (0 = highest). Exists so tests can observe the
    /// multilevel-feedback queue's promotion/demotion behavior without
    /// reaching into the scheduler's own lock.
    pub fn thread_priority(&self, caller: Tid) -> Result<usize> {
        let guard = self.state.lock();
        let tcb = self.lookup_tcb(&guard, caller)?;
        Ok(self.scheduler.priority_of(tcb))
    }

    /// A CPU-bound task can call this periodically as a substitute for a
    /// hardware timer interrupt: if the calling thread's quantum has
    /// elapsed, it yields the simulated core right here instead of
    /// running to completion uninterrupted. A task that never calls this
    /// effectively has infinite priority on its core until it blocks or
    /// returns.
    pub fn cooperative_checkpoint(&self, caller: Tid) {
        let tcb = {
            let guard = self.state.lock();
            match self.lookup_tcb(&guard, caller) {
                Ok(t) => t,
                Err(_) => return,
            }
        };
        if let Some(core) = self.scheduler.core_of(tcb) {
            if self.bios.expired(core) {
                self.scheduler.yield_now(&self.bios, tcb, Cause::Quantum);
            }
        }
    }

    // ---- process and thread lifecycle -----------------------------

    fn spawn_process(
        self: &Arc<Self>,
        parent: Option<Pid>,
        task: Task,
        args: Vec<u8>,
    ) -> Result<Tid> {
        let idx;
        let tcb;
        let tid;
        let permit;
        {
            let mut guard = self.state.lock();
            idx = guard.processes.alloc().ok_or(KernelError::NoFreeProcess)?;
            let pid = Pid::new(idx as u32);
            // Pid 1 (the boot process) starts with a fresh, empty table;
            // every other process inherits its parent's open pipes and
            // sockets, the same way `Exec` hands a child its parent's FIDT.
            let mut pcb = match parent.and_then(|p| guard.processes.get(p)) {
                Some(parent_pcb) => Pcb::with_fids(pid, parent, parent_pcb.fids.fork()),
                None => Pcb::new(pid, parent, self.config.max_fileid),
            };
            let (t, run_permit) = self.scheduler.spawn(pid, ThreadKind::Normal);
            let (slot, generation) = pcb.spawn_thread(t);
            guard.processes.install(idx, pcb);
            if let Some(parent_pid) = parent {
                if let Some(parent_pcb) = guard.processes.get_mut(parent_pid) {
                    parent_pcb.children.push(pid);
                }
            }
            tcb = t;
            permit = run_permit;
            tid = Tid::new(pid, slot, generation);
        }

        let args = Arc::new(args);
        let kernel = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("tinykernel-pid{idx}"))
            .spawn(move || {
                permit.park();
                Kernel::bind_current(tid);
                let exitval = task(&kernel, tid, args);
                kernel.thread_exit(tid, exitval);
            })
            .expect("failed to spawn simulated thread");

        self.wake(tcb);
        info!("spawned pid {idx} (parent {parent:?})");
        Ok(tid)
    }

    /// Create the very first process (the "boot" process, pid 1), with no
    /// parent.
    pub fn spawn_init(self: &Arc<Self>, task: Task, args: Vec<u8>) -> Result<Tid> {
        self.spawn_process(None, task, args)
    }

    /// Create a new process as a child of `caller`'s process.
    pub fn exec(self: &Arc<Self>, caller: Tid, task: Task, args: Vec<u8>) -> Result<Tid> {
        self.spawn_process(Some(caller.pid()), task, args)
    }

    pub fn get_pid(&self, caller: Tid) -> Pid {
        caller.pid()
    }

    pub fn get_ppid(&self, caller: Tid) -> Pid {
        let guard = self.state.lock();
        guard
            .processes
            .get(caller.pid())
            .and_then(|p| p.parent)
            .unwrap_or(NOPROC)
    }

    pub fn create_thread(self: &Arc<Self>, caller: Tid, task: Task, args: Vec<u8>) -> Result<Tid> {
        let tid;
        let tcb;
        let permit;
        {
            let mut guard = self.state.lock();
            let pcb = guard
                .processes
                .get_mut(caller.pid())
                .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
            let (t, p) = self.scheduler.spawn(caller.pid(), ThreadKind::Normal);
            let (slot, generation) = pcb.spawn_thread(t);
            tcb = t;
            permit = p;
            tid = Tid::new(caller.pid(), slot, generation);
        }

        let args = Arc::new(args);
        let kernel = Arc::clone(self);
        std::thread::Builder::new()
            .spawn(move || {
                permit.park();
                Kernel::bind_current(tid);
                let exitval = task(&kernel, tid, args);
                kernel.thread_exit(tid, exitval);
            })
            .expect("failed to spawn simulated thread");

        self.wake(tcb);
        Ok(tid)
    }

    pub fn thread_join(self: &Arc<Self>, caller: Tid, target: Tid) -> Result<i32> {
        if caller == target {
            return Err(KernelError::JoinSelf);
        }
        if caller.pid() != target.pid() {
            return Err(KernelError::NoSuchThread);
        }
        let my_tcb = {
            let guard = self.state.lock();
            self.lookup_tcb(&guard, caller)?
        };

        // Hold a reference on the target's Ptcb for the duration of this
        // call, the same as the original's "increments target ref_count"
        // step: this keeps the slot alive even if the target is detached
        // and exits while we are still parked, so a second concurrent
        // joiner never sees its generation recycled out from under it.
        {
            let mut guard = self.state.lock();
            let pcb = guard
                .processes
                .get_mut(caller.pid())
                .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
            let ptcb = pcb
                .thread_mut(target.slot, target.generation)
                .ok_or(KernelError::StaleHandle)?;
            if ptcb.detached {
                return Err(KernelError::Detached);
            }
            ptcb.ref_count += 1;
        }

        let outcome = loop {
            let mut guard = self.state.lock();
            let pcb = guard
                .processes
                .get_mut(caller.pid())
                .expect("calling process cannot vanish while it is making this call");
            let ptcb = pcb
                .thread_mut(target.slot, target.generation)
                .expect("our ref_count keeps this slot alive for the call's duration");
            if ptcb.detached {
                break Err(KernelError::Detached);
            }
            if ptcb.exited {
                break Ok(ptcb.exitval);
            }
            ptcb.exit_waiters.enqueue(my_tcb);
            let _ = self.park_caller(guard, my_tcb, Cause::User, NO_TIMEOUT);
        };

        // Always decref the extra reference taken at entry; only the
        // joiner that brings it to zero (on an exited, detached thread)
        // retires the slot.
        let mut guard = self.state.lock();
        if let Some(pcb) = guard.processes.get_mut(caller.pid()) {
            if let Some(ptcb) = pcb.thread_mut(target.slot, target.generation) {
                ptcb.ref_count -= 1;
                if ptcb.exited && ptcb.ref_count == 0 {
                    pcb.retire_thread(target.slot);
                }
            }
        }
        outcome
    }

    pub fn thread_detach(&self, caller: Tid, target: Tid) -> Result<()> {
        if caller.pid() != target.pid() {
            return Err(KernelError::NoSuchThread);
        }
        let mut guard = self.state.lock();
        let pcb = guard
            .processes
            .get_mut(caller.pid())
            .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
        let (waiters, retire) = {
            let ptcb = pcb
                .thread_mut(target.slot, target.generation)
                .ok_or(KernelError::StaleHandle)?;
            ptcb.detached = true;
            if ptcb.exited {
                (Some(ptcb.exit_waiters.drain()), ptcb.ref_count == 0)
            } else {
                (None, false)
            }
        };
        if retire {
            pcb.retire_thread(target.slot);
        }
        drop(guard);
        if let Some(waiters) = waiters {
            for w in waiters {
                self.wake(w);
            }
        }
        Ok(())
    }

    /// Terminate the calling thread. Does not return: the thread's native
    /// OS thread ends up permanently parked on its own now-orphaned
    /// `RunPermit`, mirroring the fact that a real thread's stack is gone
    /// once it has exited.
    pub fn thread_exit(self: &Arc<Self>, tid: Tid, exitval: i32) -> ! {
        let tcb;
        let waiters;
        let finalize;
        {
            let mut guard = self.state.lock();
            let pcb = guard
                .processes
                .get_mut(tid.pid())
                .expect("thread_exit on a process that no longer exists");
            let (t, _detached, w, remaining) = pcb
                .finish_thread(tid.slot, tid.generation, exitval)
                .expect("thread_exit called with a stale tid");
            tcb = t;
            waiters = w;
            finalize = remaining == 0;
            for id in &waiters {
                self.scheduler.wakeup(*id);
            }
            if finalize {
                self.finalize_process_locked(&mut guard, tid.pid());
            }
        }
        if !waiters.is_empty() || finalize {
            self.bios.restart_all();
        }
        self.scheduler.sleep_releasing(
            &self.bios,
            tcb,
            ThreadState::Exited,
            Cause::User,
            NO_TIMEOUT,
            || {},
        );
        unreachable!("an exited thread is never dispatched again")
    }

    /// Reparent `pid`'s children to the boot process (pid 1), close out
    /// every file-id it still held open, mark `pid` a zombie, and wake its
    /// parent if one is blocked in `WaitChild`. A process's open pipes and
    /// sockets are torn down here, at the last thread's exit, rather than
    /// waiting for some parent to eventually reap the zombie: a peer
    /// reading from a pipe whose only writer was this process should see
    /// EOF right away, not only once somebody calls `WaitChild`.
    fn finalize_process_locked(&self, state: &mut KernelState, pid: Pid) {
        let init_pid = Pid::new(1);

        let fcbs = state
            .processes
            .get_mut(pid)
            .map(|p| p.fids.drain())
            .unwrap_or_default();
        let mut to_wake = Vec::new();
        for fcb in fcbs {
            self.close_fcb_locked(fcb, &mut state.ports, &mut to_wake);
        }
        for w in to_wake {
            self.scheduler.wakeup(w);
        }

        let children = state
            .processes
            .get(pid)
            .map(|p| p.children.clone())
            .unwrap_or_default();
        for child in &children {
            if let Some(child_pcb) = state.processes.get_mut(*child) {
                child_pcb.parent = Some(init_pid);
            }
            if pid != init_pid {
                if let Some(init_pcb) = state.processes.get_mut(init_pid) {
                    init_pcb.children.push(*child);
                }
            }
        }

        let parent = state.processes.get(pid).and_then(|p| p.parent);

        if let Some(pcb) = state.processes.get_mut(pid) {
            pcb.is_zombie = true;
            pcb.children.clear();
        }

        if let Some(parent_pid) = parent {
            if let Some(parent_pcb) = state.processes.get_mut(parent_pid) {
                let waiters = parent_pcb.child_exit.drain();
                for id in waiters {
                    self.scheduler.wakeup(id);
                }
            }
        }
    }

    /// Wait for a child to become a zombie and reap it, or wait for any
    /// child if `target` is `None`. Mirrors the boot process's special
    /// rule: pid 1 is expected to keep calling this until it sees
    /// [`KernelError::NoChildren`], reaping everything reparented to it.
    pub fn wait_child(self: &Arc<Self>, caller: Tid, target: Option<Pid>) -> Result<(Pid, i32)> {
        let my_tcb = {
            let guard = self.state.lock();
            self.lookup_tcb(&guard, caller)?
        };
        loop {
            let mut guard = self.state.lock();
            let has_target_child = {
                let pcb = guard
                    .processes
                    .get(caller.pid())
                    .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
                match target {
                    Some(t) => pcb.children.contains(&t),
                    None => !pcb.children.is_empty(),
                }
            };
            if !has_target_child {
                return Err(if target.is_some() {
                    KernelError::NotAChild
                } else {
                    KernelError::NoChildren
                });
            }

            let zombie = {
                let pcb = guard.processes.get(caller.pid()).unwrap();
                pcb.children
                    .iter()
                    .copied()
                    .find(|c| target.map_or(true, |t| *c == t))
                    .filter(|c| guard.processes.get(*c).is_some_and(|cp| cp.is_zombie))
            };

            if let Some(child) = zombie {
                let exitval = guard.processes.get(child).unwrap().exitval;
                if let Some(pcb) = guard.processes.get_mut(caller.pid()) {
                    pcb.children.retain(|c| *c != child);
                }
                guard.processes.free(child);
                return Ok((child, exitval));
            }

            if let Some(pcb) = guard.processes.get_mut(caller.pid()) {
                pcb.child_exit.enqueue(my_tcb);
            }
            let _ = self.park_caller(guard, my_tcb, Cause::User, NO_TIMEOUT);
        }
    }

    /// Terminate the calling process: every other thread in it is left to
    /// run to completion (the original does not forcibly cancel
    /// sibling threads either), but the boot process additionally loops
    /// reaping every child it was reparented before actually exiting, so
    /// it never leaves zombies behind when the whole kernel shuts down.
    pub fn exit(self: &Arc<Self>, caller: Tid, exitval: i32) -> ! {
        if caller.pid() == Pid::new(1) {
            loop {
                match self.wait_child(caller, None) {
                    Ok(_) => continue,
                    Err(KernelError::NoChildren) => break,
                    Err(_) => break,
                }
            }
        }
        {
            let mut guard = self.state.lock();
            if let Some(pcb) = guard.processes.get_mut(caller.pid()) {
                pcb.exitval = exitval;
            }
        }
        self.thread_exit(caller, exitval)
    }

    // ---- pipes ------------------------------------------------------

    /// Create a pipe, returning `(read_fid, write_fid)` in the calling
    /// process's file-id table.
    pub fn pipe(&self, caller: Tid) -> Result<(Fid, Fid)> {
        let picb = Arc::new(Mutex::new(Picb::new(self.config.pipe_buffer_size)));
        let mut guard = self.state.lock();
        let pcb = guard
            .processes
            .get_mut(caller.pid())
            .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
        let read_fid = pcb
            .fids
            .alloc(Fcb::PipeRead(picb.clone()))
            .ok_or(KernelError::NoFreeFile)?;
        let write_fid = match pcb.fids.alloc(Fcb::PipeWrite(picb)) {
            Some(w) => w,
            None => {
                pcb.fids.take(read_fid);
                return Err(KernelError::NoFreeFile);
            }
        };
        Ok((Fid::new(read_fid), Fid::new(write_fid)))
    }

    pub fn read(self: &Arc<Self>, caller: Tid, fid: Fid, buf: &mut [u8]) -> Result<usize> {
        let my_tcb = {
            let guard = self.state.lock();
            self.lookup_tcb(&guard, caller)?
        };
        loop {
            let mut guard = self.state.lock();
            let picb = {
                let pcb = guard
                    .processes
                    .get(caller.pid())
                    .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
                match pcb.fids.get(fid.as_i32()) {
                    Some(Fcb::PipeRead(p)) => p.clone(),
                    Some(Fcb::Socket(scb)) => match &*scb.lock() {
                        Scb::Peer { recv, .. } => recv.clone(),
                        _ => return Err(KernelError::WrongKind),
                    },
                    Some(Fcb::Info(stream)) => {
                        let n = stream.lock().read(buf);
                        return Ok(n);
                    }
                    _ => return Err(KernelError::BadFileId(fid)),
                }
            };

            if picb.lock().reader_done() {
                return Err(KernelError::ReadClosed);
            }

            let attempt = picb.lock().try_read(buf);
            match attempt {
                IoAttempt::Done(n) => {
                    let waiters = picb.lock().buffer_not_full.drain();
                    drop(guard);
                    for w in waiters {
                        self.wake(w);
                    }
                    return Ok(n);
                }
                IoAttempt::Eof => return Ok(0),
                IoAttempt::WouldBlock => {
                    picb.lock().buffer_not_empty.enqueue(my_tcb);
                    guard = self.park_caller(guard, my_tcb, Cause::Pipe, NO_TIMEOUT);
                    drop(guard);
                }
                IoAttempt::BrokenPipe => return Err(KernelError::PeerGone),
            }
        }
    }

    pub fn write(self: &Arc<Self>, caller: Tid, fid: Fid, data: &[u8]) -> Result<usize> {
        let my_tcb = {
            let guard = self.state.lock();
            self.lookup_tcb(&guard, caller)?
        };
        loop {
            let mut guard = self.state.lock();
            let picb = {
                let pcb = guard
                    .processes
                    .get(caller.pid())
                    .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
                match pcb.fids.get(fid.as_i32()) {
                    Some(Fcb::PipeWrite(p)) => p.clone(),
                    Some(Fcb::Socket(scb)) => match &*scb.lock() {
                        Scb::Peer { send, .. } => send.clone(),
                        _ => return Err(KernelError::WrongKind),
                    },
                    _ => return Err(KernelError::BadFileId(fid)),
                }
            };

            let attempt = picb.lock().try_write(data);
            match attempt {
                IoAttempt::Done(n) => {
                    let waiters = picb.lock().buffer_not_empty.drain();
                    drop(guard);
                    for w in waiters {
                        self.wake(w);
                    }
                    return Ok(n);
                }
                IoAttempt::BrokenPipe => return Err(KernelError::PeerGone),
                IoAttempt::WouldBlock => {
                    picb.lock().buffer_not_full.enqueue(my_tcb);
                    guard = self.park_caller(guard, my_tcb, Cause::Pipe, NO_TIMEOUT);
                    drop(guard);
                }
                IoAttempt::Eof => unreachable!("write never returns Eof"),
            }
        }
    }

    pub fn close(&self, caller: Tid, fid: Fid) -> Result<()> {
        let mut guard = self.state.lock();
        let fcb = {
            let pcb = guard
                .processes
                .get_mut(caller.pid())
                .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
            pcb.fids.take(fid.as_i32()).ok_or(KernelError::BadFileId(fid))?
        };
        let mut to_wake = Vec::new();
        self.close_fcb_locked(fcb, &mut guard.ports, &mut to_wake);
        drop(guard);
        for w in to_wake {
            self.wake(w);
        }
        Ok(())
    }

    /// The common teardown for one file-id's endpoint, shared by an
    /// explicit [`Kernel::close`] and by a process's implicit "decref every
    /// non-null FIDT slot" step at termination.
    ///
    /// `fcb` arrives as the `Arc` this fid's `FidTable` slot held; if
    /// another slot (this process's own, after a future `dup`, or a
    /// forked child's, after `Exec`) still references the same `Fcb`, this
    /// call is a pure decref: only the close that drops the very last
    /// reference actually tears down the underlying pipe or socket, same
    /// as the original's FCB refcount.
    fn close_fcb_locked(&self, fcb: Arc<Fcb>, ports: &mut PortMap, to_wake: &mut Vec<TcbId>) {
        if Arc::strong_count(&fcb) > 1 {
            return;
        }
        let fcb = Arc::try_unwrap(fcb).unwrap_or_else(|_| {
            unreachable!("strong_count was just observed to be 1 under the kernel lock")
        });
        match fcb {
            Fcb::PipeRead(p) => {
                let mut p = p.lock();
                p.close_read();
                to_wake.extend(p.buffer_not_full.drain());
            }
            Fcb::PipeWrite(p) => {
                let mut p = p.lock();
                p.close_write();
                to_wake.extend(p.buffer_not_empty.drain());
            }
            Fcb::Socket(scb) => {
                if let Some(port) = self.close_socket_locked(&scb, to_wake) {
                    ports.unbind(port);
                }
            }
            Fcb::Info(_) => {}
        }
    }

    /// Half-close: `read` closes the read end only, `write` the write
    /// end, `both` closes both.
    pub fn shutdown_fid(&self, caller: Tid, fid: Fid, how: ShutdownHow) -> Result<()> {
        let guard = self.state.lock();
        let pcb = guard
            .processes
            .get(caller.pid())
            .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
        let scb = match pcb.fids.get(fid.as_i32()) {
            Some(Fcb::Socket(scb)) => scb.clone(),
            Some(_) => return Err(KernelError::WrongKind),
            None => return Err(KernelError::BadFileId(fid)),
        };
        drop(guard);

        let (send, recv) = match &*scb.lock() {
            Scb::Peer { send, recv } => (send.clone(), recv.clone()),
            _ => return Err(KernelError::WrongKind),
        };
        let mut to_wake = Vec::new();
        if matches!(how, ShutdownHow::Read | ShutdownHow::Both) {
            let mut r = recv.lock();
            r.close_read();
            to_wake.extend(r.buffer_not_full.drain());
        }
        if matches!(how, ShutdownHow::Write | ShutdownHow::Both) {
            let mut s = send.lock();
            s.close_write();
            to_wake.extend(s.buffer_not_empty.drain());
        }
        for w in to_wake {
            self.wake(w);
        }
        Ok(())
    }

    fn close_socket_locked(
        &self,
        scb: &Arc<Mutex<Scb>>,
        to_wake: &mut Vec<TcbId>,
    ) -> Option<Port> {
        let mut s = scb.lock();
        match &mut *s {
            Scb::Unbound { .. } => None,
            Scb::Listener(listener) => {
                // Every request still in the queue has a connector parked
                // in `Connect`; mark it as never having been accepted and
                // wake it, the same as a timeout, rather than leaving it
                // blocked on a listener that is about to disappear.
                for request in listener.pending.drain(..) {
                    *request.outcome.lock() = RequestOutcome::TimedOut;
                    to_wake.extend(request.ready.drain());
                }
                to_wake.extend(listener.incoming.drain());
                let port = listener.port;
                // An `Accept` parked on this listener re-checks the SCB
                // after waking; leaving it tagged `Listener` with an empty
                // queue would spin it back to sleep forever. Replacing it
                // with `Unbound` makes a pending `Accept` observe "no
                // longer a listener" and return an error instead, per the
                // graceful-wake treatment of this race.
                *s = Scb::Unbound { port: NOPORT };
                Some(port)
            }
            Scb::Peer { send, recv } => {
                {
                    let mut send = send.lock();
                    send.close_write();
                    to_wake.extend(send.buffer_not_empty.drain());
                }
                {
                    let mut recv = recv.lock();
                    recv.close_read();
                    to_wake.extend(recv.buffer_not_full.drain());
                }
                None
            }
        }
    }

    // ---- stream sockets ----------------------------------------------

    /// Create an unbound socket endpoint carrying `port` for a later
    /// `Listen(fid)` to consume. `NOPORT` is legal (an endpoint that will
    /// only ever `Connect`, never `Listen`); any other port outside
    /// `[NOPORT, MAX_PORT]` fails here, at creation time.
    pub fn socket(&self, caller: Tid, port: Port) -> Result<Fid> {
        if !port.is_noport() && port.as_u16() as u32 > self.config.max_port as u32 {
            return Err(KernelError::BadPort(port));
        }
        let mut guard = self.state.lock();
        let pcb = guard
            .processes
            .get_mut(caller.pid())
            .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
        let scb = Arc::new(Mutex::new(Scb::Unbound { port }));
        let fid = pcb
            .fids
            .alloc(Fcb::Socket(scb))
            .ok_or(KernelError::NoFreeFile)?;
        Ok(Fid::new(fid))
    }

    /// Begin listening on the port `fid`'s socket was created with.
    pub fn listen(&self, caller: Tid, fid: Fid) -> Result<()> {
        let guard = self.state.lock();
        let pcb = guard
            .processes
            .get(caller.pid())
            .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
        let scb = match pcb.fids.get(fid.as_i32()) {
            Some(Fcb::Socket(scb)) => scb.clone(),
            Some(_) => return Err(KernelError::WrongKind),
            None => return Err(KernelError::BadFileId(fid)),
        };
        drop(guard);

        let port = match &*scb.lock() {
            Scb::Unbound { port } => *port,
            _ => return Err(KernelError::WrongKind),
        };
        if port.is_noport() {
            return Err(KernelError::WrongKind);
        }

        let mut guard = self.state.lock();
        if !guard.ports.bind(port, scb.clone()) {
            return Err(KernelError::PortInUse);
        }
        drop(guard);

        let mut s = scb.lock();
        *s = Scb::Listener(Listener {
            port,
            pending: std::collections::VecDeque::new(),
            incoming: crate::sched::kcondvar::KCondVar::new(),
        });
        Ok(())
    }

    /// Block until a connection request arrives, then complete the
    /// three-way handshake: allocate a fresh peer endpoint for this side
    /// and wire the connector's endpoint into a peer too, joined by two
    /// independent pipes.
    pub fn accept(self: &Arc<Self>, caller: Tid, fid: Fid) -> Result<Fid> {
        let my_tcb = {
            let guard = self.state.lock();
            self.lookup_tcb(&guard, caller)?
        };
        let scb = {
            let guard = self.state.lock();
            let pcb = guard
                .processes
                .get(caller.pid())
                .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
            match pcb.fids.get(fid.as_i32()) {
                Some(Fcb::Socket(scb)) => scb.clone(),
                Some(_) => return Err(KernelError::WrongKind),
                None => return Err(KernelError::BadFileId(fid)),
            }
        };

        let request = loop {
            let mut guard = self.state.lock();
            let popped = {
                let mut s = scb.lock();
                match &mut *s {
                    Scb::Listener(listener) => listener.pending.pop_front(),
                    _ => return Err(KernelError::WrongKind),
                }
            };
            if let Some(req) = popped {
                break req;
            }
            {
                let mut s = scb.lock();
                if let Scb::Listener(listener) = &mut *s {
                    listener.incoming.enqueue(my_tcb);
                }
            }
            guard = self.park_caller(guard, my_tcb, Cause::Pipe, NO_TIMEOUT);
            drop(guard);
        };

        let a_to_b = Arc::new(Mutex::new(Picb::new(self.config.pipe_buffer_size)));
        let b_to_a = Arc::new(Mutex::new(Picb::new(self.config.pipe_buffer_size)));

        *request.connector.lock() = Scb::Peer {
            send: b_to_a.clone(),
            recv: a_to_b.clone(),
        };

        let mut outcome = request.outcome.lock();
        *outcome = RequestOutcome::Accepted;
        let waiters = request.ready.drain();
        drop(outcome);
        for w in &waiters {
            self.scheduler.wakeup(*w);
        }
        if !waiters.is_empty() {
            self.bios.restart_all();
        }

        let server_scb = Arc::new(Mutex::new(Scb::Peer {
            send: a_to_b,
            recv: b_to_a,
        }));
        let mut guard = self.state.lock();
        let pcb = guard
            .processes
            .get_mut(caller.pid())
            .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
        let new_fid = pcb
            .fids
            .alloc(Fcb::Socket(server_scb))
            .ok_or(KernelError::NoFreeFile)?;
        Ok(Fid::new(new_fid))
    }

    /// Connect an unbound socket to a listener on `port`, blocking until
    /// accepted or `timeout_ticks` elapse ([`crate::ids::NO_TIMEOUT`] to
    /// wait forever).
    pub fn connect(self: &Arc<Self>, caller: Tid, fid: Fid, port: Port, timeout_ticks: u64) -> Result<()> {
        let my_tcb = {
            let guard = self.state.lock();
            self.lookup_tcb(&guard, caller)?
        };
        let scb = {
            let guard = self.state.lock();
            let pcb = guard
                .processes
                .get(caller.pid())
                .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
            match pcb.fids.get(fid.as_i32()) {
                Some(Fcb::Socket(scb)) => scb.clone(),
                Some(_) => return Err(KernelError::WrongKind),
                None => return Err(KernelError::BadFileId(fid)),
            }
        };
        if !matches!(&*scb.lock(), Scb::Unbound { .. }) {
            return Err(KernelError::WrongKind);
        }

        let listener_scb = {
            let guard = self.state.lock();
            guard.ports.get(port).ok_or(KernelError::NoListener)?
        };

        let request = Arc::new(Request {
            connector: scb.clone(),
            outcome: Mutex::new(RequestOutcome::Pending),
            ready: crate::sched::kcondvar::KCondVar::new(),
        });
        {
            let mut s = listener_scb.lock();
            match &mut *s {
                Scb::Listener(listener) => {
                    listener.pending.push_back(request.clone());
                    let waiters = listener.incoming.drain();
                    drop(s);
                    for w in &waiters {
                        self.scheduler.wakeup(*w);
                    }
                    if !waiters.is_empty() {
                        self.bios.restart_all();
                    }
                }
                _ => return Err(KernelError::NoListener),
            }
        }

        loop {
            let mut guard = self.state.lock();
            let outcome = *request.outcome.lock();
            match outcome {
                RequestOutcome::Accepted => return Ok(()),
                RequestOutcome::TimedOut => return Err(KernelError::TimedOut),
                RequestOutcome::Pending => {
                    request.ready.enqueue(my_tcb);
                    guard = self.park_caller(guard, my_tcb, Cause::Pipe, timeout_ticks);
                    drop(guard);
                    if timeout_ticks != NO_TIMEOUT {
                        let mut outcome = request.outcome.lock();
                        if *outcome == RequestOutcome::Pending {
                            // Our alarm may have expired without an
                            // Accept ever reaching us; give up.
                            *outcome = RequestOutcome::TimedOut;
                            return Err(KernelError::TimedOut);
                        }
                    }
                }
            }
        }
    }

    // ---- reflection ----------------------------------------------------

    /// Open a read-only snapshot of the live process table.
    pub fn open_info(&self, caller: Tid) -> Result<Fid> {
        let mut guard = self.state.lock();
        let rows: Vec<(u32, Option<u32>, usize)> = guard
            .processes
            .iter()
            .map(|p| (p.pid.as_u32(), p.parent.map(|pp| pp.as_u32()), p.thread_count()))
            .collect();
        let pcb = guard
            .processes
            .get_mut(caller.pid())
            .ok_or(KernelError::NoSuchProcess(caller.pid()))?;
        let fid = pcb
            .fids
            .alloc(Fcb::Info(Arc::new(Mutex::new(InfoStream::render(rows.into_iter())))))
            .ok_or(KernelError::NoFreeFile)?;
        Ok(Fid::new(fid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

fn idle_loop(kernel: Arc<Kernel>, my_tcb: TcbId) {
    loop {
        if kernel.is_shutting_down() {
            return;
        }
        kernel.scheduler.yield_now(&kernel.bios, my_tcb, Cause::Idle);
        if kernel.is_shutting_down() {
            return;
        }
        kernel.bios.halt();
    }
}

fn ticker_loop(kernel: std::sync::Weak<Kernel>, tick_period: Duration) {
    loop {
        std::thread::sleep(tick_period);
        let Some(kernel) = kernel.upgrade() else {
            return;
        };
        if kernel.is_shutting_down() {
            return;
        }
        kernel.bios.advance();
        if kernel.scheduler.sweep_timeouts(&kernel.bios) {
            debug!("ticker: timeout sweep made threads ready, restarting halted cores");
            kernel.bios.restart_all();
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if !self.is_shutting_down() {
            warn!("kernel dropped without an explicit shutdown(); halted idle cores will be released, but threads blocked elsewhere leak their native OS thread");
        }
        self.shutdown();
    }
}
